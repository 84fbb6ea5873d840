//! Content-keyed artifact persistence, one record per agent output.
//!
//! Every agent call writes its output here before the result is returned to
//! the caller, keyed by (run, phase, persona, attempt). Distinct keys per
//! call mean concurrent writers never contend. Each record carries a sha256
//! digest of its content so the audit trail is tamper-evident.

use crate::errors::StoreError;
use crate::persona::Persona;
use crate::run::Phase;
use crate::store::StorageBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Address of one artifact: (run, phase, persona, attempt).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub run_id: String,
    pub phase: Phase,
    pub persona: Persona,
    pub attempt: u32,
}

impl ArtifactKey {
    pub fn new(run_id: &str, phase: Phase, persona: Persona, attempt: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase,
            persona,
            attempt,
        }
    }

    /// Logical storage key for this artifact.
    pub fn storage_key(&self) -> String {
        format!(
            "runs/{}/artifacts/{}/{}-{:03}.json",
            self.run_id,
            self.phase.as_str(),
            self.persona.as_str(),
            self.attempt
        )
    }
}

/// A persisted agent output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    pub key: ArtifactKey,
    /// Hex sha256 of `content`.
    pub digest: String,
    pub produced_at: DateTime<Utc>,
    pub content: String,
}

impl ArtifactRecord {
    /// Recompute the digest and compare with the stored one.
    pub fn verify_digest(&self) -> bool {
        content_digest(&self.content) == self.digest
    }
}

fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Store for agent output artifacts, scoped per run.
#[derive(Clone)]
pub struct ArtifactStore {
    backend: Arc<dyn StorageBackend>,
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Persist one agent output. Returns the full record as written.
    pub fn save(&self, key: &ArtifactKey, content: &str) -> Result<ArtifactRecord, StoreError> {
        let record = ArtifactRecord {
            key: key.clone(),
            digest: content_digest(content),
            produced_at: Utc::now(),
            content: content.to_string(),
        };
        let storage_key = key.storage_key();
        let bytes =
            serde_json::to_vec_pretty(&record).map_err(|source| StoreError::Corrupt {
                key: storage_key.clone(),
                source,
            })?;
        self.backend.put(&storage_key, &bytes)?;
        Ok(record)
    }

    pub fn load(&self, key: &ArtifactKey) -> Result<Option<ArtifactRecord>, StoreError> {
        let storage_key = key.storage_key();
        match self.backend.get(&storage_key)? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|source| StoreError::Corrupt { key: storage_key, source })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All artifacts one phase of a run produced, sorted by storage key.
    pub fn list_for_phase(
        &self,
        run_id: &str,
        phase: Phase,
    ) -> Result<Vec<ArtifactRecord>, StoreError> {
        let prefix = format!("runs/{}/artifacts/{}/", run_id, phase.as_str());
        self.load_all(&prefix)
    }

    /// Every artifact a run produced, across all phases.
    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, StoreError> {
        let prefix = format!("runs/{}/artifacts/", run_id);
        self.load_all(&prefix)
    }

    fn load_all(&self, prefix: &str) -> Result<Vec<ArtifactRecord>, StoreError> {
        let mut records = Vec::new();
        for key in self.backend.list_keys(prefix)? {
            if let Some(bytes) = self.backend.get(&key)? {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|source| StoreError::Corrupt { key: key.clone(), source })?;
                records.push(record);
            }
        }
        Ok(records)
    }
}
