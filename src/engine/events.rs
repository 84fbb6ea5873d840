//! Run event log: one JSON record per engine event, kept under the run's
//! directory for audit.

use crate::conflict::{ConflictSeverity, ResolutionAction};
use crate::errors::StoreError;
use crate::feedback::FeedbackTarget;
use crate::run::Phase;
use crate::store::StorageBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything the engine considers worth remembering about a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted { feature: String },
    PhaseEntered { phase: Phase, attempt: u32 },
    CheckpointWritten { seq: u64, phase: Phase },
    ConflictOpened { question: String, severity: ConflictSeverity },
    ConflictClosed { question: String, action: ResolutionAction },
    FeedbackConsumed { comment_id: u64, target: FeedbackTarget },
    PhaseCompleted { phase: Phase },
    RunPaused { phase: Phase, open_conflicts: usize },
    RunReentered { target: Phase },
    RunCompleted,
    RunFailed { cause: String },
}

/// A logged event with its timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Append-only per-run event log on top of the storage backend.
#[derive(Clone)]
pub struct EventLog {
    backend: Arc<dyn StorageBackend>,
}

impl EventLog {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn prefix(run_id: &str) -> String {
        format!("runs/{}/events/", run_id)
    }

    pub fn append(&self, run_id: &str, event: RunEvent) -> Result<(), StoreError> {
        let seq = self.backend.list_keys(&Self::prefix(run_id))?.len() as u64 + 1;
        let key = format!("{}{:06}.json", Self::prefix(run_id), seq);
        let logged = LoggedEvent {
            at: Utc::now(),
            event,
        };
        let bytes = serde_json::to_vec(&logged).map_err(|source| StoreError::Corrupt {
            key: key.clone(),
            source,
        })?;
        self.backend.put(&key, &bytes)
    }

    /// All events for a run, in append order.
    pub fn list(&self, run_id: &str) -> Result<Vec<LoggedEvent>, StoreError> {
        let mut events = Vec::new();
        for key in self.backend.list_keys(&Self::prefix(run_id))? {
            if let Some(bytes) = self.backend.get(&key)? {
                let logged = serde_json::from_slice(&bytes)
                    .map_err(|source| StoreError::Corrupt { key: key.clone(), source })?;
                events.push(logged);
            }
        }
        Ok(events)
    }
}
