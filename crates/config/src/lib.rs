use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Resolve the rho home directory.
///
/// `$RHO_DIR` wins when set (tests use it for isolation), otherwise
/// `$HOME/.rho`, with `/tmp/.rho` as a last resort.
pub fn rho_dir() -> PathBuf {
    if let Ok(dir) = env::var("RHO_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    env::var("HOME")
        .map(|home| PathBuf::from(home).join(".rho"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/.rho"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// Path to the brain log. Empty means `<rho_dir>/brain/brain.jsonl`.
    pub path: String,
    pub prompt_budget: usize,
    pub decay_after_days: i64,
    pub decay_min_score: i64,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            prompt_budget: 2000,
            decay_after_days: 90,
            decay_min_score: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Argv of the agent child process, program first.
    pub agent_command: Vec<String>,
    /// Environment variables set on top of the inherited environment.
    pub env_set: Vec<(String, String)>,
    /// Inherited environment variables removed before spawn.
    pub env_remove: Vec<String>,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub event_buffer: usize,
    pub command_retention_secs: u64,
    pub orphan_grace_secs: u64,
    pub orphan_abort_delay_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            agent_command: Vec::new(),
            env_set: Vec::new(),
            env_remove: Vec::new(),
            connect_timeout_secs: 60,
            idle_timeout_secs: 600,
            kill_grace_secs: 2,
            event_buffer: 800,
            command_retention_secs: 300,
            orphan_grace_secs: 60,
            orphan_abort_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RhoConfig {
    pub brain: BrainConfig,
    pub rpc: RpcConfig,
    pub telemetry: TelemetryConfig,
}

impl RhoConfig {
    /// Load from `<rho_dir>/config.toml`. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(rho_dir().join("config.toml"))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolved brain log path.
    pub fn brain_path(&self) -> PathBuf {
        if self.brain.path.is_empty() {
            rho_dir().join("brain").join("brain.jsonl")
        } else {
            PathBuf::from(&self.brain.path)
        }
    }

    /// Lock file guarding brain appends: the brain path with a `.lock` suffix.
    pub fn brain_lock_path(&self) -> PathBuf {
        lock_path_for(&self.brain_path())
    }
}

/// Derive the lock path for a file by appending `.lock` to its full name.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "brain.jsonl".to_string());
    path.with_file_name(format!("{filename}.lock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RhoConfig::default();
        assert_eq!(config.brain.prompt_budget, 2000);
        assert_eq!(config.brain.decay_after_days, 90);
        assert_eq!(config.brain.decay_min_score, 3);
        assert_eq!(config.rpc.connect_timeout_secs, 60);
        assert_eq!(config.rpc.idle_timeout_secs, 600);
        assert_eq!(config.rpc.event_buffer, 800);
        assert_eq!(config.rpc.command_retention_secs, 300);
        assert_eq!(config.rpc.orphan_grace_secs, 60);
        assert_eq!(config.rpc.orphan_abort_delay_secs, 5);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[brain]\nprompt_budget = 512\n").unwrap();

        let config = RhoConfig::load_from(&path).unwrap();
        assert_eq!(config.brain.prompt_budget, 512);
        assert_eq!(config.brain.decay_after_days, 90);
    }

    #[test]
    fn lock_path_appends_suffix() {
        let lock = lock_path_for(Path::new("/tmp/x/brain.jsonl"));
        assert_eq!(lock, PathBuf::from("/tmp/x/brain.jsonl.lock"));
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = RhoConfig::default();
        config.brain.prompt_budget = 777;
        config.save_to(&path).unwrap();

        let loaded = RhoConfig::load_from(&path).unwrap();
        assert_eq!(loaded.brain.prompt_budget, 777);
    }
}
