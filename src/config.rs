//! Engine configuration, loaded from `conductor.toml`.
//!
//! Every field has a default so a bare directory works out of the box; the
//! file only needs to name what it overrides. `CONDUCTOR_AGENT_CMD` wins
//! over the file for the agent command, mirroring how operators swap the
//! backend binary per environment.

use crate::persona::{Persona, PrecedenceTable};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file searched for in the project directory.
pub const CONFIG_FILE: &str = "conductor.toml";

fn default_data_dir() -> PathBuf {
    PathBuf::from(".conductor")
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_round_timeout_secs() -> u64 {
    600
}

fn default_max_call_retries() -> u32 {
    2
}

fn default_personas() -> Vec<Persona> {
    Persona::ALL.to_vec()
}

fn default_precedence() -> PrecedenceTable {
    PrecedenceTable::new(vec![
        Persona::Architect,
        Persona::SeniorEngineer,
        Persona::Tester,
        Persona::Reviewer,
    ])
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_local_model() -> String {
    "haiku".to_string()
}

fn default_remote_model() -> String {
    "opus".to_string()
}

/// Runtime configuration for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Where run state, checkpoints, and artifacts live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Timeout for one agent call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Timeout for a whole fan-out round; must exceed the call timeout.
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,

    /// Retries after the first attempt, on timeout only.
    #[serde(default = "default_max_call_retries")]
    pub max_call_retries: u32,

    /// Personas dispatched each round.
    #[serde(default = "default_personas")]
    pub personas: Vec<Persona>,

    /// Ranking used to auto-resolve low/medium conflicts. Pluggable: any
    /// subset and order; unranked personas always escalate.
    #[serde(default = "default_precedence")]
    pub precedence: PrecedenceTable,

    /// Command spawned by the CLI's agent adapter.
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,

    /// Model flag for the local (cheap) backend.
    #[serde(default = "default_local_model")]
    pub local_model: String,

    /// Model flag for the remote (escalation) backend.
    #[serde(default = "default_remote_model")]
    pub remote_model: String,

    #[serde(default)]
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            call_timeout_secs: default_call_timeout_secs(),
            round_timeout_secs: default_round_timeout_secs(),
            max_call_retries: default_max_call_retries(),
            personas: default_personas(),
            precedence: default_precedence(),
            agent_cmd: default_agent_cmd(),
            local_model: default_local_model(),
            remote_model: default_remote_model(),
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Load from an explicit TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config TOML: {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Load `conductor.toml` from the project directory, or defaults when it
    /// does not exist.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var("CONDUCTOR_AGENT_CMD") {
            if !cmd.is_empty() {
                self.agent_cmd = cmd;
            }
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn with_call_timeout(mut self, secs: u64) -> Self {
        self.call_timeout_secs = secs;
        self
    }

    pub fn with_round_timeout(mut self, secs: u64) -> Self {
        self.round_timeout_secs = secs;
        self
    }

    pub fn with_personas(mut self, personas: Vec<Persona>) -> Self {
        self.personas = personas;
        self
    }

    pub fn with_precedence(mut self, precedence: PrecedenceTable) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.data_dir, PathBuf::from(".conductor"));
        assert_eq!(config.call_timeout(), Duration::from_secs(120));
        assert_eq!(config.round_timeout(), Duration::from_secs(600));
        assert_eq!(config.max_call_retries, 2);
        assert_eq!(config.personas.len(), 4);
        assert!(!config.precedence.is_empty());
        assert!(config.round_timeout() > config.call_timeout());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
call_timeout_secs = 30
personas = ["architect", "tester"]
precedence = ["tester", "architect"]
"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.personas, vec![Persona::Architect, Persona::Tester]);
        assert_eq!(
            config.precedence.winner(&[Persona::Architect, Persona::Tester]),
            Some(Persona::Tester)
        );
        // Untouched fields keep defaults.
        assert_eq!(config.round_timeout_secs, 600);
        assert_eq!(config.agent_cmd, "claude");
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.max_call_retries, 2);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "call_timeout_secs = \"not a number\"").unwrap();

        let result = EngineConfig::load(&path);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse config TOML")
        );
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::default()
            .with_data_dir(PathBuf::from("/tmp/runs"))
            .with_call_timeout(15)
            .with_round_timeout(60)
            .with_personas(vec![Persona::Architect])
            .with_verbose(true);

        assert_eq!(config.data_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.call_timeout_secs, 15);
        assert_eq!(config.round_timeout_secs, 60);
        assert_eq!(config.personas, vec![Persona::Architect]);
        assert!(config.verbose);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = EngineConfig::default().with_call_timeout(45);
        let toml_text = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed, config);
    }
}
