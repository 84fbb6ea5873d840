//! Model routing: which of the two executor backends handles a task.
//!
//! `route` is a pure function over a by-value `TaskDescriptor`. There is no
//! process-wide router state; every call site builds a descriptor and asks.

use crate::run::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Retry count at which a task escalates to the remote backend.
pub const REMOTE_RETRY_THRESHOLD: u32 = 2;
/// Estimated diff size above which a task escalates.
pub const REMOTE_DIFF_LINES: u32 = 300;
/// Files-touched count above which a task escalates.
pub const REMOTE_FILES_TOUCHED: u32 = 10;

/// The two interchangeable model executor targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Cheap/fast backend for routine, small, first-attempt work.
    Local,
    /// Expensive/high-quality backend for escalations, large changes, and
    /// the finalization phase.
    Remote,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A unit of work as the router sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescriptor {
    pub phase: Phase,
    /// Estimated size of the change, in diff lines.
    pub diff_size_lines: u32,
    /// Estimated number of files touched.
    pub files_touched: u32,
    /// Retries so far within the current phase attempt. Resets to zero when
    /// the phase succeeds.
    pub retry_count: u32,
    /// Caller-requested escalation; overrides every other rule.
    pub explicit_escalation: bool,
}

impl TaskDescriptor {
    /// A fresh first-attempt descriptor for a phase.
    pub fn for_phase(phase: Phase) -> Self {
        Self {
            phase,
            diff_size_lines: 0,
            files_touched: 0,
            retry_count: 0,
            explicit_escalation: false,
        }
    }

    pub fn with_diff_size(mut self, lines: u32) -> Self {
        self.diff_size_lines = lines;
        self
    }

    pub fn with_files_touched(mut self, files: u32) -> Self {
        self.files_touched = files;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_escalation(mut self, escalate: bool) -> Self {
        self.explicit_escalation = escalate;
        self
    }
}

/// Route a task to a backend. First matching rule wins:
///
/// 1. explicit escalation        → Remote
/// 2. retry_count >= 2           → Remote
/// 3. phase == Finalization      → Remote
/// 4. diff_size_lines > 300      → Remote
/// 5. files_touched > 10         → Remote
/// 6. otherwise                  → Local
pub fn route(task: &TaskDescriptor) -> Backend {
    if task.explicit_escalation {
        return Backend::Remote;
    }
    if task.retry_count >= REMOTE_RETRY_THRESHOLD {
        return Backend::Remote;
    }
    if task.phase == Phase::Finalization {
        return Backend::Remote;
    }
    if task.diff_size_lines > REMOTE_DIFF_LINES {
        return Backend::Remote;
    }
    if task.files_touched > REMOTE_FILES_TOUCHED {
        return Backend::Remote;
    }
    Backend::Local
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(phase: Phase) -> TaskDescriptor {
        TaskDescriptor::for_phase(phase)
    }

    // =========================================
    // Decision table (§ routing rules, in order)
    // =========================================

    #[test]
    fn test_small_first_attempt_routes_local() {
        // Scenario A: diff=50, files=2, retries=0, escalate=false
        let task = base(Phase::Design).with_diff_size(50).with_files_touched(2);
        assert_eq!(route(&task), Backend::Local);
    }

    #[test]
    fn test_explicit_escalation_routes_remote() {
        // Scenario B: same as A but escalate=true
        let task = base(Phase::Design)
            .with_diff_size(50)
            .with_files_touched(2)
            .with_escalation(true);
        assert_eq!(route(&task), Backend::Remote);
    }

    #[test]
    fn test_escalation_overrides_every_other_rule() {
        // Even a descriptor that matches no other remote rule goes remote.
        for phase in Phase::ALL {
            let task = base(phase).with_escalation(true);
            assert_eq!(route(&task), Backend::Remote);
        }
    }

    #[test]
    fn test_retry_threshold_routes_remote() {
        assert_eq!(route(&base(Phase::Analysis).with_retry_count(1)), Backend::Local);
        assert_eq!(route(&base(Phase::Analysis).with_retry_count(2)), Backend::Remote);
        assert_eq!(route(&base(Phase::Analysis).with_retry_count(7)), Backend::Remote);
    }

    #[test]
    fn test_finalization_always_remote() {
        assert_eq!(route(&base(Phase::Finalization)), Backend::Remote);
    }

    #[test]
    fn test_large_diff_routes_remote() {
        assert_eq!(route(&base(Phase::Design).with_diff_size(300)), Backend::Local);
        assert_eq!(route(&base(Phase::Design).with_diff_size(301)), Backend::Remote);
    }

    #[test]
    fn test_many_files_routes_remote() {
        assert_eq!(route(&base(Phase::Design).with_files_touched(10)), Backend::Local);
        assert_eq!(route(&base(Phase::Design).with_files_touched(11)), Backend::Remote);
    }

    #[test]
    fn test_default_routes_local() {
        for phase in [Phase::Analysis, Phase::Design, Phase::Implementation] {
            assert_eq!(route(&base(phase)), Backend::Local);
        }
    }

    // =========================================
    // Purity
    // =========================================

    #[test]
    fn test_route_is_deterministic() {
        let task = base(Phase::Implementation)
            .with_diff_size(250)
            .with_files_touched(9)
            .with_retry_count(1);
        let first = route(&task);
        for _ in 0..100 {
            assert_eq!(route(&task), first);
        }
    }

    #[test]
    fn test_descriptor_serde_roundtrip() {
        let task = base(Phase::Design)
            .with_diff_size(120)
            .with_retry_count(1)
            .with_escalation(true);
        let json = serde_json::to_string(&task).unwrap();
        let parsed: TaskDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, task);
    }
}
