//! Agent execution: one persona, one prompt, one audited output.
//!
//! `AgentCall` is the collaborator boundary — the engine never sees how the
//! text is produced. `AgentExecutor` wraps a call with the centralized retry
//! policy (timeouts retried up to a fixed bound, unavailability propagated
//! immediately) and persists every successful output to the artifact store
//! before returning it, so the audit trail exists even when the caller
//! discards the result.

use crate::errors::AgentCallError;
use crate::persona::Persona;
use crate::router::{Backend, TaskDescriptor, route};
use crate::run::Phase;
use crate::store::{ArtifactKey, ArtifactStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// External agent backend. Implementations are out of the engine's scope;
/// the `backend` argument selects which of the two model executors serves
/// the call.
#[async_trait]
pub trait AgentCall: Send + Sync {
    async fn call(
        &self,
        backend: Backend,
        persona: Persona,
        prompt: &str,
        context: &str,
        timeout: Duration,
    ) -> Result<String, AgentCallError>;
}

/// The result of one agent executing one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentOutput {
    pub persona: Persona,
    pub content: String,
    /// Where the output was persisted.
    pub artifact: ArtifactKey,
    pub produced_at: DateTime<Utc>,
}

/// Executes single agent calls with retry, timeout, and artifact persistence.
pub struct AgentExecutor {
    agent: Arc<dyn AgentCall>,
    artifacts: ArtifactStore,
    call_timeout: Duration,
    /// Extra attempts after the first, on timeout only.
    max_retries: u32,
}

impl AgentExecutor {
    pub fn new(
        agent: Arc<dyn AgentCall>,
        artifacts: ArtifactStore,
        call_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            agent,
            artifacts,
            call_timeout,
            max_retries,
        }
    }

    /// Execute one persona's task. The routing decision is recomputed per
    /// attempt from the task descriptor with the retry count folded in, so
    /// exhausted local attempts escalate to the remote backend on their own.
    ///
    /// `attempt` is the phase attempt number used for the artifact key; call
    /// retries within one attempt do not produce separate artifacts because
    /// only the successful response has content to persist.
    pub async fn execute(
        &self,
        run_id: &str,
        phase: Phase,
        attempt: u32,
        persona: Persona,
        task: &TaskDescriptor,
        prompt: &str,
        context: &str,
    ) -> Result<AgentOutput, AgentCallError> {
        for retry in 0..=self.max_retries {
            let descriptor = task.clone().with_retry_count(task.retry_count + retry);
            let backend = route(&descriptor);

            let call = self
                .agent
                .call(backend, persona, prompt, context, self.call_timeout);
            let outcome = match tokio::time::timeout(self.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(AgentCallError::Timeout {
                    timeout: self.call_timeout,
                }),
            };

            match outcome {
                Ok(content) => {
                    let key = ArtifactKey::new(run_id, phase, persona, attempt);
                    return match self.artifacts.save(&key, &content) {
                        Ok(record) => Ok(AgentOutput {
                            persona,
                            content,
                            artifact: key,
                            produced_at: record.produced_at,
                        }),
                        // Without the artifact the audit-trail contract is
                        // broken; surface the persona as missing rather than
                        // hand back an unpersisted output.
                        Err(e) => Err(AgentCallError::Unavailable(format!(
                            "artifact persistence failed: {}",
                            e
                        ))),
                    };
                }
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    warn!(
                        persona = %persona,
                        retry = retry + 1,
                        "agent call timed out, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::Mutex;

    /// Scripted agent double: pops one canned response per call and records
    /// which backend each call was routed to.
    struct ScriptedAgent {
        script: Mutex<Vec<Result<String, AgentCallError>>>,
        backends_seen: Mutex<Vec<Backend>>,
    }

    impl ScriptedAgent {
        fn new(script: Vec<Result<String, AgentCallError>>) -> Self {
            Self {
                script: Mutex::new(script),
                backends_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentCall for ScriptedAgent {
        async fn call(
            &self,
            backend: Backend,
            _persona: Persona,
            _prompt: &str,
            _context: &str,
            _timeout: Duration,
        ) -> Result<String, AgentCallError> {
            self.backends_seen.lock().unwrap().push(backend);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(AgentCallError::Unavailable("script exhausted".into()));
            }
            script.remove(0)
        }
    }

    fn timeout_err() -> AgentCallError {
        AgentCallError::Timeout {
            timeout: Duration::from_millis(10),
        }
    }

    fn executor(agent: Arc<ScriptedAgent>) -> (AgentExecutor, ArtifactStore) {
        let artifacts = ArtifactStore::new(Arc::new(MemoryBackend::new()));
        (
            AgentExecutor::new(agent, artifacts.clone(), Duration::from_secs(5), 2),
            artifacts,
        )
    }

    #[tokio::test]
    async fn test_success_persists_artifact_before_return() {
        let agent = Arc::new(ScriptedAgent::new(vec![Ok("analysis output".into())]));
        let (executor, artifacts) = executor(agent);

        let task = TaskDescriptor::for_phase(Phase::Analysis);
        let output = executor
            .execute("r1", Phase::Analysis, 1, Persona::Architect, &task, "p", "c")
            .await
            .unwrap();

        assert_eq!(output.content, "analysis output");
        let stored = artifacts.load(&output.artifact).unwrap().unwrap();
        assert_eq!(stored.content, "analysis output");
        assert!(stored.verify_digest());
    }

    #[tokio::test]
    async fn test_timeout_is_retried_until_success() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            Err(timeout_err()),
            Err(timeout_err()),
            Ok("third time".into()),
        ]));
        let (executor, _) = executor(agent.clone());

        let task = TaskDescriptor::for_phase(Phase::Design);
        let output = executor
            .execute("r1", Phase::Design, 1, Persona::Tester, &task, "p", "c")
            .await
            .unwrap();

        assert_eq!(output.content, "third time");
        assert_eq!(agent.backends_seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_bound_is_enforced() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            Err(timeout_err()),
            Err(timeout_err()),
            Err(timeout_err()),
            Ok("never reached".into()),
        ]));
        let (executor, _) = executor(agent.clone());

        let task = TaskDescriptor::for_phase(Phase::Design);
        let result = executor
            .execute("r1", Phase::Design, 1, Persona::Tester, &task, "p", "c")
            .await;

        assert!(matches!(result, Err(AgentCallError::Timeout { .. })));
        // First attempt + 2 retries, nothing more.
        assert_eq!(agent.backends_seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            Err(AgentCallError::Unavailable("down".into())),
            Ok("never reached".into()),
        ]));
        let (executor, _) = executor(agent.clone());

        let task = TaskDescriptor::for_phase(Phase::Design);
        let result = executor
            .execute("r1", Phase::Design, 1, Persona::Reviewer, &task, "p", "c")
            .await;

        assert!(matches!(result, Err(AgentCallError::Unavailable(_))));
        assert_eq!(agent.backends_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_escalate_to_remote_backend() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            Err(timeout_err()),
            Err(timeout_err()),
            Ok("remote answer".into()),
        ]));
        let (executor, _) = executor(agent.clone());

        let task = TaskDescriptor::for_phase(Phase::Design);
        executor
            .execute("r1", Phase::Design, 1, Persona::Architect, &task, "p", "c")
            .await
            .unwrap();

        let seen = agent.backends_seen.lock().unwrap();
        // retry_count 0 and 1 route local; the second retry crosses the
        // escalation threshold.
        assert_eq!(*seen, vec![Backend::Local, Backend::Local, Backend::Remote]);
    }

    #[tokio::test]
    async fn test_wall_clock_timeout_maps_to_timeout_error() {
        /// Agent that never answers, regardless of the timeout it is handed.
        struct StallingAgent;

        #[async_trait]
        impl AgentCall for StallingAgent {
            async fn call(
                &self,
                _backend: Backend,
                _persona: Persona,
                _prompt: &str,
                _context: &str,
                _timeout: Duration,
            ) -> Result<String, AgentCallError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("too late".into())
            }
        }

        tokio::time::pause();
        let artifacts = ArtifactStore::new(Arc::new(MemoryBackend::new()));
        let executor = AgentExecutor::new(
            Arc::new(StallingAgent),
            artifacts,
            Duration::from_millis(50),
            0,
        );

        let task = TaskDescriptor::for_phase(Phase::Analysis);
        let handle = tokio::spawn(async move {
            executor
                .execute("r1", Phase::Analysis, 1, Persona::Architect, &task, "p", "c")
                .await
        });
        tokio::time::advance(Duration::from_millis(100)).await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AgentCallError::Timeout { .. })));
    }
}
