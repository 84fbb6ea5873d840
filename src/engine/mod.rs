//! The workflow engine: a checkpointed phase state machine over agent rounds.
//!
//! One engine drives one run at a time through
//! `Analysis → Design → Finalization → Implementation`. Each phase entry
//! fans out to the configured persona panel, detects and arbitrates
//! conflicts, and the phase only exits once its predicate holds (no open
//! conflicts; for implementation, green CI and no unresolved PR comments).
//! A checkpoint is written immediately before a phase executes and again at
//! the transition — the transition counts as taken only once that write
//! returned, so a crash at any point resumes from the recorded phase.
//!
//! Human input arrives exclusively through the PR feedback loop: escalated
//! conflicts suspend the run (`PausedForHuman`), and review comments either
//! close those conflicts or force re-entry into an earlier phase with the
//! feedback appended to its context.

pub mod context;
pub mod events;

pub use context::{Decision, RunContext};
pub use events::{EventLog, LoggedEvent, RunEvent};

use crate::agent::{AgentCall, AgentExecutor};
use crate::config::EngineConfig;
use crate::conflict::{ConflictRecord, Resolver, detect_conflicts};
use crate::errors::EngineError;
use crate::feedback::{CiStatus, FeedbackAction, FeedbackLoop, GithubClient};
use crate::round::RoundCoordinator;
use crate::router::TaskDescriptor;
use crate::run::{Phase, Run, RunStatus};
use crate::store::{ArtifactStore, CheckpointStore, RunStore, StorageBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of one phase entry action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseVerdict {
    /// Exit predicate satisfied; transition.
    Advance,
    /// Waiting on human input (open conflicts, CI, or PR comments).
    Blocked,
}

/// Stats from one phase execution, for events and `step_phase`.
#[derive(Debug, Clone, Copy)]
struct PhaseExecution {
    verdict: PhaseVerdict,
    outputs: usize,
    missing: usize,
    conflicts_opened: usize,
    conflicts_auto_resolved: usize,
}

/// Operator-facing snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: String,
    pub feature: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub open_conflicts: Vec<ConflictRecord>,
    pub error: Option<String>,
    pub checkpoints: u64,
}

/// Result of executing a single phase in isolation via `step_phase`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub phase: Phase,
    pub outputs: usize,
    pub missing: usize,
    pub conflicts_opened: usize,
    pub conflicts_auto_resolved: usize,
    pub blocked: bool,
}

/// The top-level driver.
pub struct WorkflowEngine {
    config: EngineConfig,
    runs: RunStore,
    checkpoints: CheckpointStore,
    artifacts: ArtifactStore,
    events: EventLog,
    coordinator: RoundCoordinator,
    resolver: Resolver,
    feedback: FeedbackLoop,
    github: Arc<dyn GithubClient>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn StorageBackend>,
        agent: Arc<dyn AgentCall>,
        github: Arc<dyn GithubClient>,
    ) -> Self {
        let artifacts = ArtifactStore::new(Arc::clone(&backend));
        let executor = AgentExecutor::new(
            agent,
            artifacts.clone(),
            config.call_timeout(),
            config.max_call_retries,
        );
        Self {
            runs: RunStore::new(Arc::clone(&backend)),
            checkpoints: CheckpointStore::new(Arc::clone(&backend)),
            events: EventLog::new(Arc::clone(&backend)),
            coordinator: RoundCoordinator::new(Arc::new(executor), config.round_timeout()),
            resolver: Resolver::new(config.precedence.clone()),
            feedback: FeedbackLoop::new(Arc::clone(&github)),
            artifacts,
            github,
            config,
        }
    }

    // =========================================
    // Public surface
    // =========================================

    /// Create a new run for a feature description. The run is persisted with
    /// an initial checkpoint and left `Pending`; `resume_run` drives it.
    pub fn start_run(&self, feature: &str) -> Result<String, EngineError> {
        let run = Run::new(feature);
        self.runs.save(&run)?;
        self.write_checkpoint(&run, &RunContext::default())?;
        self.log_event(
            &run.run_id,
            RunEvent::RunStarted {
                feature: feature.to_string(),
            },
        );
        info!(run_id = %run.run_id, "run created");
        Ok(run.run_id)
    }

    /// Load the highest-sequence checkpoint and continue from the recorded
    /// phase. A `Failed` run is explicitly restarted from its last
    /// checkpoint. Returns the status the run settled into.
    pub async fn resume_run(&self, run_id: &str) -> Result<RunStatus, EngineError> {
        let mut run = self.load_run(run_id)?;
        let checkpoint = self
            .checkpoints
            .latest(run_id)?
            .ok_or_else(|| EngineError::NoCheckpoint {
                run_id: run_id.to_string(),
            })?;
        let mut ctx = RunContext::from_value(checkpoint.context)?;

        match run.status() {
            RunStatus::Completed => return Ok(RunStatus::Completed),
            RunStatus::Failed => {
                info!(run_id, "restarting failed run from checkpoint {}", checkpoint.seq);
                // The checkpointed phase is authoritative after a failure.
                run.reenter(checkpoint.phase.min(run.phase()));
                run.clear_failure();
                self.runs.save(&run)?;
            }
            _ => {}
        }

        self.drive(&mut run, &mut ctx).await
    }

    /// Operator-facing status for a run, including its open conflicts and
    /// failure cause, straight from the stores.
    pub fn get_status(&self, run_id: &str) -> Result<StatusReport, EngineError> {
        let run = self.load_run(run_id)?;
        let (open_conflicts, checkpoints) = match self.checkpoints.latest(run_id)? {
            Some(cp) => (RunContext::from_value(cp.context)?.open_conflicts, cp.seq),
            None => (Vec::new(), 0),
        };
        Ok(StatusReport {
            run_id: run.run_id.clone(),
            feature: run.feature.clone(),
            phase: run.phase(),
            status: run.status(),
            open_conflicts,
            error: run.error().map(str::to_string),
            checkpoints,
        })
    }

    /// All persisted runs.
    pub fn list_runs(&self) -> Result<Vec<Run>, EngineError> {
        Ok(self.runs.list()?)
    }

    /// Execute one named phase in isolation against the run's current
    /// context, without advancing the machine or mutating persisted state.
    /// Artifacts and events are still written (they are the audit trail of
    /// the step having happened). Debug/testing aid.
    pub async fn step_phase(&self, run_id: &str, phase: Phase) -> Result<StepReport, EngineError> {
        let run = self.load_run(run_id)?;
        let checkpoint = self
            .checkpoints
            .latest(run_id)?
            .ok_or_else(|| EngineError::NoCheckpoint {
                run_id: run_id.to_string(),
            })?;
        let mut scratch = RunContext::from_value(checkpoint.context)?;

        let execution = self.execute_phase(&run, &mut scratch, phase).await?;
        Ok(StepReport {
            phase,
            outputs: execution.outputs,
            missing: execution.missing,
            conflicts_opened: execution.conflicts_opened,
            conflicts_auto_resolved: execution.conflicts_auto_resolved,
            blocked: execution.verdict == PhaseVerdict::Blocked,
        })
    }

    // =========================================
    // Drive loop
    // =========================================

    async fn drive(&self, run: &mut Run, ctx: &mut RunContext) -> Result<RunStatus, EngineError> {
        loop {
            match run.status() {
                RunStatus::Completed | RunStatus::Failed => return Ok(run.status()),
                RunStatus::Pending => {
                    run.set_status(RunStatus::Running);
                    self.runs.save(run)?;
                }
                RunStatus::PausedForHuman => {
                    let progressed = self.consume_feedback(run, ctx).await?;
                    if run.status() == RunStatus::Running {
                        // Feedback forced a re-entry; fall through and run it.
                        continue;
                    }
                    if ctx.open_conflict_count() == 0
                        && self.exit_predicate_clear(run, ctx).await?
                    {
                        // The blockage cleared without new work (conflicts
                        // answered, CI went green): take the transition.
                        run.set_status(RunStatus::Running);
                        if let Err(e) = self.finish_phase(run, ctx) {
                            return self.fail_run(run, e);
                        }
                        continue;
                    }
                    if !progressed {
                        // Nothing new; the wait for humans is unbounded, so
                        // hand control back to the caller.
                        return Ok(RunStatus::PausedForHuman);
                    }
                    continue;
                }
                RunStatus::Running => {}
            }

            let phase = run.phase();
            // Pre-entry checkpoint: the phase about to execute, with any
            // feedback already merged into the context.
            if let Err(e) = self.write_checkpoint(run, ctx) {
                return self.fail_run(run, e);
            }

            match self.execute_phase(run, ctx, phase).await {
                Ok(execution) if execution.verdict == PhaseVerdict::Advance => {
                    if let Err(e) = self.finish_phase(run, ctx) {
                        return self.fail_run(run, e);
                    }
                }
                Ok(_blocked) => {
                    run.set_status(RunStatus::PausedForHuman);
                    self.runs.save(run)?;
                    if let Err(e) = self.write_checkpoint(run, ctx) {
                        return self.fail_run(run, e);
                    }
                    self.log_event(
                        &run.run_id,
                        RunEvent::RunPaused {
                            phase,
                            open_conflicts: ctx.open_conflict_count(),
                        },
                    );
                    info!(run_id = %run.run_id, phase = %phase, "run paused for human input");
                }
                Err(e) => return self.fail_run(run, e),
            }
        }
    }

    /// One phase entry action: assemble context, fan out the round, detect
    /// and arbitrate conflicts, then evaluate the exit predicate.
    async fn execute_phase(
        &self,
        run: &Run,
        ctx: &mut RunContext,
        phase: Phase,
    ) -> Result<PhaseExecution, EngineError> {
        let attempt = ctx.next_attempt(phase);
        let feedback_items = ctx.take_feedback_for(phase);
        // Feedback-driven rework is the correctness-critical case; route it
        // to the remote backend.
        let task =
            TaskDescriptor::for_phase(phase).with_escalation(!feedback_items.is_empty());

        self.log_event(&run.run_id, RunEvent::PhaseEntered { phase, attempt });
        info!(run_id = %run.run_id, phase = %phase, attempt, "entering phase");

        let context_text = self.assemble_context(ctx, &feedback_items)?;
        let outcome = self
            .coordinator
            .run_round(
                &run.run_id,
                phase,
                attempt,
                &self.config.personas,
                &task,
                &run.feature,
                &context_text,
            )
            .await?;

        let outputs = outcome.outputs();
        for output in &outputs {
            ctx.artifacts.push(output.artifact.clone());
        }

        let mut records = detect_conflicts(&outputs, &ctx.history);
        let auto_resolved = self.resolver.resolve(&mut records);
        let mut opened = 0;
        for record in records {
            if record.is_open() {
                // A re-entered phase can re-detect a question that is still
                // awaiting its human answer; one open record per question.
                if ctx
                    .open_conflicts
                    .iter()
                    .any(|c| c.question == record.question)
                {
                    continue;
                }
                self.log_event(
                    &run.run_id,
                    RunEvent::ConflictOpened {
                        question: record.question.clone(),
                        severity: record.severity,
                    },
                );
                opened += 1;
                ctx.open_conflicts.push(record);
            } else {
                self.log_event(
                    &run.run_id,
                    RunEvent::ConflictClosed {
                        question: record.question.clone(),
                        action: record.action,
                    },
                );
                ctx.record_resolved(phase, &record);
            }
        }

        let mut execution = PhaseExecution {
            verdict: PhaseVerdict::Advance,
            outputs: outcome.success_count(),
            missing: outcome.missing().len(),
            conflicts_opened: opened,
            conflicts_auto_resolved: auto_resolved,
        };

        if ctx.open_conflict_count() > 0 {
            execution.verdict = PhaseVerdict::Blocked;
            return Ok(execution);
        }

        if phase == Phase::Implementation {
            self.publish_pr(run, ctx).await?;
            if !self.exit_predicate_clear(run, ctx).await? {
                execution.verdict = PhaseVerdict::Blocked;
            }
        }
        Ok(execution)
    }

    /// Take the transition out of the current phase. The checkpoint records
    /// the phase being entered (or the final phase, on completion) and is
    /// written before the run record moves: if the write fails, the prior
    /// checkpoint stays current and the run is untouched.
    fn finish_phase(&self, run: &mut Run, ctx: &mut RunContext) -> Result<(), EngineError> {
        let completed = run.phase();
        let target = completed.next();

        let checkpoint_phase = target.unwrap_or(completed);
        let checkpoint =
            self.checkpoints
                .append(&run.run_id, checkpoint_phase, ctx.to_value()?)?;
        self.log_event(
            &run.run_id,
            RunEvent::CheckpointWritten {
                seq: checkpoint.seq,
                phase: checkpoint_phase,
            },
        );
        self.log_event(&run.run_id, RunEvent::PhaseCompleted { phase: completed });

        match target {
            Some(_) => run.advance(),
            None => {
                run.complete();
                self.log_event(&run.run_id, RunEvent::RunCompleted);
                info!(run_id = %run.run_id, "run completed");
            }
        }
        self.runs.save(run)?;
        Ok(())
    }

    /// One feedback poll: close answered conflicts, queue re-entry feedback,
    /// and persist the advanced marker. Returns whether anything arrived.
    async fn consume_feedback(
        &self,
        run: &mut Run,
        ctx: &mut RunContext,
    ) -> Result<bool, EngineError> {
        let open_questions = ctx.open_questions();
        let outcome = self
            .feedback
            .poll(&run.run_id, ctx.last_comment_id, &open_questions)
            .await?;
        if outcome.is_empty() {
            return Ok(false);
        }
        ctx.last_comment_id = outcome.last_comment_id;

        let mut reentry: Option<Phase> = None;
        for action in outcome.actions {
            match action {
                FeedbackAction::CloseConflict {
                    question,
                    resolution,
                    ..
                } => {
                    if ctx.close_conflict(run.phase(), &question, &resolution) {
                        self.log_event(
                            &run.run_id,
                            RunEvent::ConflictClosed {
                                question,
                                action: crate::conflict::ResolutionAction::EscalatedToHuman,
                            },
                        );
                    }
                }
                FeedbackAction::Reenter { item } => {
                    self.log_event(
                        &run.run_id,
                        RunEvent::FeedbackConsumed {
                            comment_id: item.comment_id,
                            target: item.target,
                        },
                    );
                    let target = item.target.phase();
                    ctx.feedback.push(item);
                    reentry = Some(match reentry {
                        Some(existing) => existing.min(target),
                        None => target,
                    });
                }
            }
        }

        if let Some(target) = reentry {
            if target <= run.phase() {
                // Forced transition: jump back without resetting the target
                // phase's context.
                run.reenter(target);
                run.set_status(RunStatus::Running);
                self.log_event(&run.run_id, RunEvent::RunReentered { target });
                info!(run_id = %run.run_id, target = %target, "feedback forced phase re-entry");
            }
            // Feedback for a later phase stays queued until that phase runs.
        }

        self.write_checkpoint(run, ctx)?;
        self.runs.save(run)?;
        Ok(true)
    }

    /// Whether the current phase's exit predicate holds, ignoring open
    /// conflicts (callers check those first).
    async fn exit_predicate_clear(
        &self,
        run: &Run,
        ctx: &RunContext,
    ) -> Result<bool, EngineError> {
        if run.phase() != Phase::Implementation {
            return Ok(true);
        }
        // A PR must exist before the implementation phase can exit.
        if ctx.pr_number.is_none() {
            return Ok(false);
        }
        let ci = self.github.ci_status(&run.run_id).await?;
        if ci != CiStatus::Success {
            info!(run_id = %run.run_id, "waiting on CI");
            return Ok(false);
        }
        Ok(self.pending_comment_count(run, ctx).await? == 0)
    }

    async fn publish_pr(&self, run: &Run, ctx: &mut RunContext) -> Result<(), EngineError> {
        let mut files: Vec<String> = ctx
            .artifacts
            .iter()
            .filter(|k| k.phase == Phase::Implementation)
            .map(|k| k.storage_key())
            .collect();
        files.sort();
        files.dedup();

        let body = self.pr_body(ctx);
        let pr = self
            .github
            .create_or_update_pr(&run.run_id, &run.feature, &body, &files)
            .await?;
        ctx.pr_number = Some(pr);
        info!(run_id = %run.run_id, pr, "pull request published");
        Ok(())
    }

    fn pr_body(&self, ctx: &RunContext) -> String {
        let mut body = String::from("## Decisions\n");
        if ctx.decisions.is_empty() {
            body.push_str("(none recorded)\n");
        }
        for decision in &ctx.decisions {
            body.push_str(&format!(
                "- [{}] {}: {} ({})\n",
                decision.phase, decision.question, decision.resolution, decision.decided_by
            ));
        }
        body
    }

    /// Build the entry context for a phase from the run's accumulated
    /// decisions, every prior artifact, and any feedback being consumed.
    fn assemble_context(
        &self,
        ctx: &RunContext,
        feedback: &[crate::feedback::FeedbackItem],
    ) -> Result<String, EngineError> {
        let mut text = String::new();

        if !ctx.decisions.is_empty() {
            text.push_str("## Settled decisions\n");
            for decision in &ctx.decisions {
                text.push_str(&format!(
                    "- [{}] {}: {}\n",
                    decision.phase, decision.question, decision.resolution
                ));
            }
        }

        for key in &ctx.artifacts {
            match self.artifacts.load(key)? {
                Some(record) => {
                    text.push_str(&format!(
                        "\n## {} ({}, attempt {})\n{}\n",
                        key.persona, key.phase, key.attempt, record.content
                    ));
                }
                None => warn!(key = %key.storage_key(), "referenced artifact missing"),
            }
        }

        if !feedback.is_empty() {
            text.push_str("\n## Reviewer feedback\n");
            for item in feedback {
                text.push_str(&format!("- {}: {}\n", item.author, item.body));
            }
        }
        Ok(text)
    }

    async fn pending_comment_count(
        &self,
        run: &Run,
        ctx: &RunContext,
    ) -> Result<usize, EngineError> {
        let comments = self.github.fetch_comments(&run.run_id).await?;
        Ok(comments
            .iter()
            .filter(|c| c.id > ctx.last_comment_id)
            .count())
    }

    fn write_checkpoint(&self, run: &Run, ctx: &RunContext) -> Result<(), EngineError> {
        let checkpoint = self
            .checkpoints
            .append(&run.run_id, run.phase(), ctx.to_value()?)?;
        self.log_event(
            &run.run_id,
            RunEvent::CheckpointWritten {
                seq: checkpoint.seq,
                phase: checkpoint.phase,
            },
        );
        Ok(())
    }

    fn fail_run(&self, run: &mut Run, cause: EngineError) -> Result<RunStatus, EngineError> {
        error!(run_id = %run.run_id, %cause, "run failed");
        run.fail(&cause.to_string());
        self.runs.save(run)?;
        self.log_event(
            &run.run_id,
            RunEvent::RunFailed {
                cause: cause.to_string(),
            },
        );
        Ok(RunStatus::Failed)
    }

    fn load_run(&self, run_id: &str) -> Result<Run, EngineError> {
        self.runs
            .load(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    /// Event log failures must not take a run down; log and continue.
    fn log_event(&self, run_id: &str, event: RunEvent) {
        if let Err(e) = self.events.append(run_id, event) {
            warn!(run_id, error = %e, "failed to append run event");
        }
    }
}
