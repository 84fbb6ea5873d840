//! Run records and the phase/status vocabulary of the state machine.
//!
//! A `Run` is one end-to-end execution of the pipeline for a single feature.
//! Its phase and status fields are private: only the engine mutates them,
//! through the `pub(crate)` transition methods, so no component can flip a
//! run's status behind the state machine's back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The pipeline phases, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analysis,
    Design,
    Finalization,
    Implementation,
}

impl Phase {
    /// All phases, in execution order.
    pub const ALL: [Phase; 4] = [
        Phase::Analysis,
        Phase::Design,
        Phase::Finalization,
        Phase::Implementation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Design => "design",
            Self::Finalization => "finalization",
            Self::Implementation => "implementation",
        }
    }

    /// The phase after this one, or `None` after the last.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::Analysis => Some(Self::Design),
            Self::Design => Some(Self::Finalization),
            Self::Finalization => Some(Self::Implementation),
            Self::Implementation => None,
        }
    }

    /// Whether `self` runs before `other` in the pipeline.
    pub fn precedes(&self, other: Phase) -> bool {
        *self < other
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "design" => Ok(Self::Design),
            "finalization" => Ok(Self::Finalization),
            "implementation" => Ok(Self::Implementation),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// The current phase is suspended waiting for human input through the
    /// feedback loop. Not a phase: the suspended phase is preserved.
    PausedForHuman,
    Failed,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PausedForHuman => "paused_for_human",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Completed and Failed runs are terminal; Failed can still be restarted
    /// explicitly by an operator from its last checkpoint.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused_for_human" => Ok(Self::PausedForHuman),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// One execution of the pipeline for one feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    /// Unique, immutable, stable across resume.
    pub run_id: String,
    /// The feature/task description this run implements.
    pub feature: String,
    phase: Phase,
    status: RunStatus,
    /// Cause of failure, when status is `Failed`.
    error: Option<String>,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a new pending run with a fresh identifier.
    pub fn new(feature: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            feature: feature.to_string(),
            phase: Phase::Analysis,
            status: RunStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub(crate) fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Move to the next phase in order. Panics in debug builds if called on
    /// the last phase; callers must complete the run instead.
    pub(crate) fn advance(&mut self) {
        debug_assert!(self.phase.next().is_some());
        if let Some(next) = self.phase.next() {
            self.phase = next;
            self.updated_at = Utc::now();
        }
    }

    /// Forced transition back to an earlier phase, requested by the feedback
    /// loop. The target phase's context is preserved by the engine.
    pub(crate) fn reenter(&mut self, target: Phase) {
        debug_assert!(target <= self.phase);
        self.phase = target;
        self.updated_at = Utc::now();
    }

    pub(crate) fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.updated_at = Utc::now();
    }

    pub(crate) fn fail(&mut self, cause: &str) {
        self.status = RunStatus::Failed;
        self.error = Some(cause.to_string());
        self.updated_at = Utc::now();
    }

    /// Clear a failure so an operator restart can drive the run again.
    pub(crate) fn clear_failure(&mut self) {
        self.status = RunStatus::Running;
        self.error = None;
        self.updated_at = Utc::now();
    }
}
