use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_script_path")]
    pub script_path: PathBuf,

    /// Working directory for the script; inherits the caller's when unset.
    #[serde(default = "default_working_dir")]
    pub working_dir: Option<PathBuf>,

    /// Directory holding the script's helper tools (e.g. `sshpass`).
    #[serde(default = "default_helper_path")]
    pub helper_path: PathBuf,

    #[serde(default = "default_activate_timeout")]
    pub activate_timeout_secs: u64,

    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,

    /// Output lines quoted in `details` when the script fails.
    #[serde(default = "default_details_tail")]
    pub details_tail_lines: usize,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn default_script_path() -> PathBuf {
    std::env::var("PROVISION_SCRIPT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./provision_vm.sh"))
}

fn default_working_dir() -> Option<PathBuf> {
    std::env::var("PROVISION_WORKDIR").ok().map(PathBuf::from)
}

fn default_helper_path() -> PathBuf {
    std::env::var("DEVBENCH_HELPER_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/bin"))
}

fn default_activate_timeout() -> u64 {
    env_u64("DEVBENCH_ACTIVATE_TIMEOUT", 120) // 2 minutes
}

fn default_create_timeout() -> u64 {
    env_u64("DEVBENCH_CREATE_TIMEOUT", 30 * 60) // 30 minutes
}

fn default_details_tail() -> usize {
    env_u64("DEVBENCH_DETAILS_TAIL", 20) as usize
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVBENCH_DB_PATH") {
        return PathBuf::from(path);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devbench")
        .join("devbench.db")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            script_path: default_script_path(),
            working_dir: default_working_dir(),
            helper_path: default_helper_path(),
            activate_timeout_secs: default_activate_timeout(),
            create_timeout_secs: default_create_timeout(),
            details_tail_lines: default_details_tail(),
            db_path: default_db_path(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Load a YAML config file. Missing fields fall back to the environment defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            OrchestratorError::Config(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.script_path.as_os_str().is_empty() {
            return Err(OrchestratorError::Config(
                "script_path must not be empty".to_string(),
            ));
        }
        if self.activate_timeout_secs == 0 || self.create_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn activate_timeout(&self) -> Duration {
        Duration::from_secs(self.activate_timeout_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}
