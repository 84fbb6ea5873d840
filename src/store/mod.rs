//! Durable key-value persistence for runs, checkpoints, and artifacts.
//!
//! `StorageBackend` is the narrow interface both stores are written against:
//! `put`/`get`/`list_keys` over slash-separated logical keys. `FsBackend`
//! maps keys to files under a base directory and is the production backend;
//! `MemoryBackend` backs tests.

pub mod artifact;
pub mod checkpoint;

pub use artifact::{ArtifactKey, ArtifactRecord, ArtifactStore};
pub use checkpoint::{Checkpoint, CheckpointStore};

use crate::errors::StoreError;
use crate::run::Run;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable key-value/blob storage.
///
/// Keys are slash-separated logical paths (`runs/<id>/checkpoints/000001`).
/// Writers use distinct keys per logical record, so implementations need no
/// locking beyond their own internal consistency.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// All keys starting with `prefix`, sorted ascending.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

fn invalid_key(key: &str) -> StoreError {
    StoreError::Backend {
        key: key.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid storage key"),
    }
}

/// Reject keys that would escape the base directory.
fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(invalid_key(key));
    }
    Ok(())
}

/// File-backed storage under a base directory.
pub struct FsBackend {
    base: PathBuf,
}

impl FsBackend {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.base.join(key))
    }
}

impl StorageBackend for FsBackend {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let io = |source| StoreError::Backend {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        // Write-then-rename so a torn write never corrupts the record.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value).map_err(io)?;
        std::fs::rename(&tmp, &path).map_err(io)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Backend {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&self.base)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let rel = match entry.path().strip_prefix(&self.base) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) && !key.ends_with(".tmp") {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory storage for tests.
#[derive(Default)]
pub struct MemoryBackend {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        self.map
            .lock()
            .expect("storage map poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        Ok(self
            .map
            .lock()
            .expect("storage map poisoned")
            .get(key)
            .cloned())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .map
            .lock()
            .expect("storage map poisoned")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Persistence for the `Run` record itself.
#[derive(Clone)]
pub struct RunStore {
    backend: Arc<dyn StorageBackend>,
}

impl RunStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn key(run_id: &str) -> String {
        format!("runs/{}/run.json", run_id)
    }

    pub fn save(&self, run: &Run) -> Result<(), StoreError> {
        let key = Self::key(&run.run_id);
        let bytes = serde_json::to_vec_pretty(run).map_err(|source| StoreError::Corrupt {
            key: key.clone(),
            source,
        })?;
        self.backend.put(&key, &bytes)
    }

    pub fn load(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let key = Self::key(run_id);
        match self.backend.get(&key)? {
            Some(bytes) => {
                let run = serde_json::from_slice(&bytes)
                    .map_err(|source| StoreError::Corrupt { key, source })?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// All persisted runs, sorted by run id.
    pub fn list(&self) -> Result<Vec<Run>, StoreError> {
        let mut runs = Vec::new();
        for key in self.backend.list_keys("runs/")? {
            if key.ends_with("/run.json") {
                if let Some(bytes) = self.backend.get(&key)? {
                    let run = serde_json::from_slice(&bytes)
                        .map_err(|source| StoreError::Corrupt { key: key.clone(), source })?;
                    runs.push(run);
                }
            }
        }
        runs.sort_by(|a: &Run, b: &Run| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }
}
