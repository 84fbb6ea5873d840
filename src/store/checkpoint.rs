//! Append-only checkpoint persistence, one record per phase boundary.
//!
//! Checkpoints are totally ordered per run by sequence number and never
//! mutated after write; the current checkpoint is simply the one with the
//! highest sequence number. The engine writes one immediately before and
//! after each phase executes, and a transition only counts as taken once
//! its checkpoint write returned.
//!
//! The context is carried as an opaque JSON blob — this store knows nothing
//! about its schema.

use crate::errors::StoreError;
use crate::run::Phase;
use crate::store::StorageBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A durable snapshot of a run's state at a phase boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub run_id: String,
    /// Monotonically increasing per run, starting at 1.
    pub seq: u64,
    pub phase: Phase,
    /// Opaque engine context (decisions, artifact refs, arbitration history).
    pub context: serde_json::Value,
    pub written_at: DateTime<Utc>,
}

/// Append-only store of checkpoints.
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn StorageBackend>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn prefix(run_id: &str) -> String {
        format!("runs/{}/checkpoints/", run_id)
    }

    fn key(run_id: &str, seq: u64) -> String {
        // Zero-padded so lexicographic key order equals numeric order.
        format!("runs/{}/checkpoints/{:06}.json", run_id, seq)
    }

    /// Append a new checkpoint with the next sequence number and return it.
    ///
    /// Any failure maps to `StoreError::CheckpointWrite`: the caller must
    /// abort the in-flight transition and keep the prior checkpoint current.
    pub fn append(
        &self,
        run_id: &str,
        phase: Phase,
        context: serde_json::Value,
    ) -> Result<Checkpoint, StoreError> {
        let seq = self.latest_seq(run_id)? + 1;
        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            seq,
            phase,
            context,
            written_at: Utc::now(),
        };

        let write = || -> Result<(), StoreError> {
            let key = Self::key(run_id, seq);
            let bytes = serde_json::to_vec_pretty(&checkpoint)
                .map_err(|source| StoreError::Corrupt { key: key.clone(), source })?;
            self.backend.put(&key, &bytes)
        };

        write().map_err(|e| StoreError::CheckpointWrite {
            run_id: run_id.to_string(),
            seq,
            message: e.to_string(),
        })?;
        Ok(checkpoint)
    }

    /// The current (highest-sequence) checkpoint, if any.
    pub fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let keys = self.backend.list_keys(&Self::prefix(run_id))?;
        match keys.last() {
            Some(key) => self.load(key).map(Some),
            None => Ok(None),
        }
    }

    /// All checkpoints for a run, ordered by ascending sequence number.
    /// Resume must never observe them out of order.
    pub fn all(&self, run_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let mut checkpoints = Vec::new();
        for key in self.backend.list_keys(&Self::prefix(run_id))? {
            checkpoints.push(self.load(&key)?);
        }
        checkpoints.sort_by_key(|c| c.seq);
        Ok(checkpoints)
    }

    fn latest_seq(&self, run_id: &str) -> Result<u64, StoreError> {
        Ok(self.latest(run_id)?.map(|c| c.seq).unwrap_or(0))
    }

    fn load(&self, key: &str) -> Result<Checkpoint, StoreError> {
        let bytes = self
            .backend
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })
    }
}
