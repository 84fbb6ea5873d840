//! Fan-out/fan-in coordination of one agent round.
//!
//! A round dispatches every active persona concurrently against the same
//! phase input and waits for all of them or for the round deadline,
//! whichever comes first. Personas run in parallel deliberately: no
//! persona's output may seed another's starting context, and a call blocked
//! on network I/O must not hold up the rest.
//!
//! The result is a set, not a sequence — entries carry no ordering
//! guarantee relative to each other.

use crate::agent::{AgentExecutor, AgentOutput};
use crate::errors::RoundError;
use crate::persona::{Persona, render_prompt};
use crate::router::TaskDescriptor;
use crate::run::Phase;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A persona that produced nothing this round, with the cause.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingOutput {
    pub persona: Persona,
    pub reason: String,
}

/// Per-persona result of a round.
#[derive(Debug, Clone)]
pub enum RoundEntry {
    Output(AgentOutput),
    Missing(MissingOutput),
}

/// The fan-in result: one entry per dispatched persona.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub phase: Phase,
    pub entries: HashMap<Persona, RoundEntry>,
    pub duration: Duration,
}

impl RoundOutcome {
    /// Successful outputs, as an unordered set.
    pub fn outputs(&self) -> Vec<&AgentOutput> {
        self.entries
            .values()
            .filter_map(|e| match e {
                RoundEntry::Output(o) => Some(o),
                RoundEntry::Missing(_) => None,
            })
            .collect()
    }

    /// Personas that produced nothing, with reasons.
    pub fn missing(&self) -> Vec<&MissingOutput> {
        self.entries
            .values()
            .filter_map(|e| match e {
                RoundEntry::Missing(m) => Some(m),
                RoundEntry::Output(_) => None,
            })
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.outputs().len()
    }
}

/// Runs rounds: one executor call per persona, in parallel, under a
/// round-level deadline longer than any single call's timeout.
pub struct RoundCoordinator {
    executor: Arc<AgentExecutor>,
    round_timeout: Duration,
}

impl RoundCoordinator {
    pub fn new(executor: Arc<AgentExecutor>, round_timeout: Duration) -> Self {
        Self {
            executor,
            round_timeout,
        }
    }

    /// Execute one round. Fails only when no persona produced output.
    pub async fn run_round(
        &self,
        run_id: &str,
        phase: Phase,
        attempt: u32,
        personas: &[Persona],
        task: &TaskDescriptor,
        feature: &str,
        context: &str,
    ) -> Result<RoundOutcome, RoundError> {
        let started = Instant::now();
        let deadline = started + self.round_timeout;

        let mut set = JoinSet::new();
        for &persona in personas {
            let executor = Arc::clone(&self.executor);
            let run_id = run_id.to_string();
            let task = task.clone();
            let prompt = render_prompt(persona, phase, feature, context);
            let context = context.to_string();
            set.spawn(async move {
                let result = executor
                    .execute(&run_id, phase, attempt, persona, &task, &prompt, &context)
                    .await;
                (persona, result)
            });
        }

        let mut entries: HashMap<Persona, RoundEntry> = HashMap::new();
        while !set.is_empty() {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((persona, Ok(output))))) => {
                    debug!(persona = %persona, phase = %phase, "persona completed");
                    entries.insert(persona, RoundEntry::Output(output));
                }
                Ok(Some(Ok((persona, Err(e))))) => {
                    warn!(persona = %persona, phase = %phase, error = %e, "persona missing");
                    entries.insert(
                        persona,
                        RoundEntry::Missing(MissingOutput {
                            persona,
                            reason: e.to_string(),
                        }),
                    );
                }
                // A panicked task is indistinguishable from a lost persona;
                // its entry is filled in below.
                Ok(Some(Err(_join_err))) => {}
                Ok(None) => break,
                Err(_elapsed) => {
                    warn!(phase = %phase, "round deadline hit, cancelling stragglers");
                    set.abort_all();
                    break;
                }
            }
        }

        // Personas still unaccounted for were cancelled by the deadline (or
        // their task died); the round proceeds with whatever completed.
        for &persona in personas {
            entries.entry(persona).or_insert_with(|| {
                RoundEntry::Missing(MissingOutput {
                    persona,
                    reason: "round timeout".to_string(),
                })
            });
        }

        let outcome = RoundOutcome {
            phase,
            entries,
            duration: started.elapsed(),
        };

        if outcome.success_count() == 0 {
            return Err(RoundError::AllAgentsFailed {
                personas: personas.len(),
            });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentCall;
    use crate::errors::AgentCallError;
    use crate::router::Backend;
    use crate::store::{ArtifactStore, MemoryBackend};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    /// Per-persona scripted behavior.
    #[derive(Clone)]
    enum Behavior {
        Reply(&'static str),
        ReplyAfter(Duration, &'static str),
        Unavailable,
        Stall,
    }

    struct PanelAgent {
        behaviors: StdHashMap<Persona, Behavior>,
    }

    #[async_trait]
    impl AgentCall for PanelAgent {
        async fn call(
            &self,
            _backend: Backend,
            persona: Persona,
            _prompt: &str,
            _context: &str,
            _timeout: Duration,
        ) -> Result<String, AgentCallError> {
            match self.behaviors.get(&persona).cloned().unwrap_or(Behavior::Stall) {
                Behavior::Reply(text) => Ok(text.to_string()),
                Behavior::ReplyAfter(delay, text) => {
                    tokio::time::sleep(delay).await;
                    Ok(text.to_string())
                }
                Behavior::Unavailable => {
                    Err(AgentCallError::Unavailable("backend down".into()))
                }
                Behavior::Stall => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("too late".into())
                }
            }
        }
    }

    fn coordinator(
        behaviors: StdHashMap<Persona, Behavior>,
        call_timeout: Duration,
        round_timeout: Duration,
    ) -> RoundCoordinator {
        let artifacts = ArtifactStore::new(Arc::new(MemoryBackend::new()));
        let executor = AgentExecutor::new(
            Arc::new(PanelAgent { behaviors }),
            artifacts,
            call_timeout,
            0,
        );
        RoundCoordinator::new(Arc::new(executor), round_timeout)
    }

    fn task() -> TaskDescriptor {
        TaskDescriptor::for_phase(Phase::Design)
    }

    #[tokio::test]
    async fn test_all_personas_respond() {
        let behaviors = StdHashMap::from([
            (Persona::Architect, Behavior::Reply("layers")),
            (Persona::Tester, Behavior::Reply("edge cases")),
        ]);
        let coordinator =
            coordinator(behaviors, Duration::from_secs(5), Duration::from_secs(30));

        let outcome = coordinator
            .run_round(
                "r1",
                Phase::Design,
                1,
                &[Persona::Architect, Persona::Tester],
                &task(),
                "feature",
                "",
            )
            .await
            .unwrap();

        assert_eq!(outcome.success_count(), 2);
        assert!(outcome.missing().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_round_marks_missing_and_succeeds() {
        // Scenario C: Y times out while X and Z succeed.
        let behaviors = StdHashMap::from([
            (Persona::Architect, Behavior::Reply("x position")),
            (Persona::Tester, Behavior::Stall),
            (Persona::Reviewer, Behavior::Reply("z position")),
        ]);
        let coordinator =
            coordinator(behaviors, Duration::from_millis(100), Duration::from_secs(10));

        let outcome = coordinator
            .run_round(
                "r1",
                Phase::Design,
                1,
                &[Persona::Architect, Persona::Tester, Persona::Reviewer],
                &task(),
                "feature",
                "",
            )
            .await
            .unwrap();

        assert_eq!(outcome.success_count(), 2);
        let missing = outcome.missing();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].persona, Persona::Tester);
        assert!(missing[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_unavailable_persona_does_not_fail_round() {
        let behaviors = StdHashMap::from([
            (Persona::Architect, Behavior::Unavailable),
            (Persona::Tester, Behavior::Reply("fine")),
        ]);
        let coordinator =
            coordinator(behaviors, Duration::from_secs(5), Duration::from_secs(30));

        let outcome = coordinator
            .run_round(
                "r1",
                Phase::Design,
                1,
                &[Persona::Architect, Persona::Tester],
                &task(),
                "feature",
                "",
            )
            .await
            .unwrap();

        assert_eq!(outcome.success_count(), 1);
        assert_eq!(outcome.missing()[0].persona, Persona::Architect);
        assert!(outcome.missing()[0].reason.contains("unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_agents_failed() {
        let behaviors = StdHashMap::from([
            (Persona::Architect, Behavior::Unavailable),
            (Persona::Tester, Behavior::Stall),
        ]);
        let coordinator =
            coordinator(behaviors, Duration::from_millis(50), Duration::from_secs(10));

        let result = coordinator
            .run_round(
                "r1",
                Phase::Design,
                1,
                &[Persona::Architect, Persona::Tester],
                &task(),
                "feature",
                "",
            )
            .await;

        assert!(matches!(
            result,
            Err(RoundError::AllAgentsFailed { personas: 2 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_deadline_keeps_completed_outputs() {
        // Architect answers immediately; Tester would answer within its own
        // call timeout but after the round deadline.
        let behaviors = StdHashMap::from([
            (Persona::Architect, Behavior::Reply("quick")),
            (
                Persona::Tester,
                Behavior::ReplyAfter(Duration::from_secs(8), "slow"),
            ),
        ]);
        let coordinator =
            coordinator(behaviors, Duration::from_secs(20), Duration::from_secs(2));

        let outcome = coordinator
            .run_round(
                "r1",
                Phase::Design,
                1,
                &[Persona::Architect, Persona::Tester],
                &task(),
                "feature",
                "",
            )
            .await
            .unwrap();

        assert_eq!(outcome.success_count(), 1);
        let missing = outcome.missing();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].persona, Persona::Tester);
        assert_eq!(missing[0].reason, "round timeout");
    }

    #[tokio::test]
    async fn test_round_with_one_success_returns_before_round_timeout() {
        let behaviors = StdHashMap::from([(Persona::Architect, Behavior::Reply("only one"))]);
        let coordinator =
            coordinator(behaviors, Duration::from_secs(5), Duration::from_secs(600));

        let outcome = coordinator
            .run_round(
                "r1",
                Phase::Design,
                1,
                &[Persona::Architect],
                &task(),
                "feature",
                "",
            )
            .await
            .unwrap();

        assert!(outcome.duration < Duration::from_secs(600));
        assert_eq!(outcome.success_count(), 1);
    }
}
