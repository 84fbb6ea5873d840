//! The run context: everything a run has accumulated, carried inside each
//! checkpoint as the opaque blob.
//!
//! The context is the unit of resume. It holds decisions, artifact
//! references, the arbitration history, open conflicts, queued feedback, and
//! the feedback marker; the engine mutates it in memory and the checkpoint
//! store persists it at every transition.

use crate::conflict::{ArbitrationHistory, ConflictRecord, ResolutionAction};
use crate::feedback::FeedbackItem;
use crate::run::Phase;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One settled question, kept for prompt assembly in later phases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub phase: Phase,
    pub question: String,
    pub resolution: String,
    /// "auto" for precedence resolutions, "human" for feedback closures.
    pub decided_by: String,
}

/// Accumulated state of one run, serialized into checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunContext {
    pub decisions: Vec<Decision>,
    /// References to every artifact the run has produced, in write order.
    pub artifacts: Vec<crate::store::ArtifactKey>,
    pub history: ArbitrationHistory,
    /// Conflicts awaiting a human answer. Closed records move to `history`.
    pub open_conflicts: Vec<ConflictRecord>,
    /// Feedback queued for phases, drained on (re-)entry.
    pub feedback: Vec<FeedbackItem>,
    /// Highest PR comment id already consumed.
    pub last_comment_id: u64,
    /// Attempts per phase, keyed by phase name.
    pub phase_attempts: BTreeMap<String, u32>,
    pub pr_number: Option<u64>,
}

impl RunContext {
    /// Bump and return the attempt counter for a phase (first entry is 1).
    pub fn next_attempt(&mut self, phase: Phase) -> u32 {
        let counter = self.phase_attempts.entry(phase.as_str().to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn attempt(&self, phase: Phase) -> u32 {
        self.phase_attempts.get(phase.as_str()).copied().unwrap_or(0)
    }

    /// Open conflicts block whichever phase produced them.
    pub fn open_conflict_count(&self) -> usize {
        self.open_conflicts.len()
    }

    pub fn open_questions(&self) -> Vec<String> {
        self.open_conflicts.iter().map(|c| c.question.clone()).collect()
    }

    /// Close an open conflict with a human resolution. Returns false when no
    /// open conflict matches the question. `phase` is the phase the conflict
    /// was blocking.
    pub fn close_conflict(&mut self, phase: Phase, question: &str, resolution: &str) -> bool {
        let Some(index) = self
            .open_conflicts
            .iter()
            .position(|c| c.question == question)
        else {
            return false;
        };
        let mut record = self.open_conflicts.remove(index);
        record.action = ResolutionAction::EscalatedToHuman;
        record.close(resolution);
        self.history.record(&record);
        self.decisions.push(Decision {
            phase,
            question: record.question,
            resolution: resolution.to_string(),
            decided_by: "human".to_string(),
        });
        true
    }

    /// Record an auto-resolved conflict into history and decisions.
    pub fn record_resolved(&mut self, phase: Phase, record: &ConflictRecord) {
        self.history.record(record);
        self.decisions.push(Decision {
            phase,
            question: record.question.clone(),
            resolution: record.resolution.clone().unwrap_or_default(),
            decided_by: "auto".to_string(),
        });
    }

    /// Drain queued feedback items targeting a phase.
    pub fn take_feedback_for(&mut self, phase: Phase) -> Vec<FeedbackItem> {
        let (matching, rest): (Vec<_>, Vec<_>) = self
            .feedback
            .drain(..)
            .partition(|item| item.target.phase() == phase);
        self.feedback = rest;
        matching
    }

    /// Serialize into the checkpoint blob.
    pub fn to_value(&self) -> anyhow::Result<serde_json::Value> {
        serde_json::to_value(self).context("Failed to serialize run context")
    }

    /// Deserialize from a checkpoint blob.
    pub fn from_value(value: serde_json::Value) -> anyhow::Result<Self> {
        serde_json::from_value(value).context("Failed to deserialize run context")
    }
}
