use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{CpIdentity, LogCatalog, LogType};
use crate::engine::{EngineContext, FailureSupervisor};
use crate::error::ConfigError;
use crate::retention::Quota;
use crate::{PersistAction, PersistPolicy};

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_settle_ms() -> u64 {
    2_000
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_max_restarts() -> u32 {
    3
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/var/run/cplogd.pid")
}

/// Configuration of the `cplogd` daemon, read from a JSON file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub root_dir: PathBuf,
    #[serde(default)]
    pub cps: Vec<CpIdentity>,
    /// Replaces the built-in quota of these log types.
    #[serde(default)]
    pub quotas: HashMap<LogType, Quota>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a temporary file must stay untouched before it is ingested.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub fsync: bool,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<DaemonConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        DaemonConfig::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<DaemonConfig, ConfigError> {
        let config: DaemonConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root_dir is empty".to_string()));
        }
        for (log_type, quota) in &self.quotas {
            if quota.divider_percent > 100 {
                return Err(ConfigError::Invalid(format!(
                    "{log_type}: divider_percent {} is above 100",
                    quota.divider_percent
                )));
            }
            if quota.max_total_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{log_type}: max_total_size must be positive"
                )));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn persist_policy(&self) -> PersistPolicy {
        if self.fsync {
            PersistPolicy::Always(PersistAction::FlushAndFsync)
        } else {
            PersistPolicy::Always(PersistAction::Flush)
        }
    }

    pub fn catalog(&self) -> LogCatalog {
        LogCatalog::default_table().with_overrides(&self.quotas)
    }

    pub fn engine_context(&self) -> EngineContext {
        EngineContext::new(&self.root_dir, self.catalog()).with_persist_policy(self.persist_policy())
    }

    pub fn supervisor(&self) -> FailureSupervisor {
        FailureSupervisor::new(self.max_consecutive_failures, self.max_restarts)
    }
}
