//! Configuration for taskweave.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "TASKWEAVE_DATA_DIR";

/// taskweave configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for task records and logs.
    pub data_dir: PathBuf,
    /// Identity recorded as owner when this process starts a task.
    pub agent_name: String,
    /// Task store settings.
    pub store: StoreSettings,
    /// Background executor settings.
    pub background: BackgroundSettings,
    /// Coordinator loop settings.
    pub coordinator: CoordinatorSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taskweave");

        Self {
            data_dir,
            agent_name: "lead".to_string(),
            store: StoreSettings::default(),
            background: BackgroundSettings::default(),
            coordinator: CoordinatorSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_chain(config_path)?;
        if let Ok(dir) = std::env::var(DATA_DIR_ENV)
            && !dir.is_empty()
        {
            log::info!("Using data dir from {}: {}", DATA_DIR_ENV, dir);
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    fn load_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Primary location: ~/.config/taskweave/taskweave.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join("taskweave").join("taskweave.yml");
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        let fallback_config = PathBuf::from("taskweave.yml");
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Directory holding one JSON record per task.
    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    /// Directory holding one subdirectory per team.
    pub fn teams_dir(&self) -> PathBuf {
        self.data_dir.join("teams")
    }

    /// Directory for log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Task store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Bounded wait for a record lock (milliseconds).
    pub lock_timeout_ms: u64,
    /// Back-off between lock attempts (milliseconds).
    pub lock_retry_ms: u64,
    /// Age after which a lock file is presumed abandoned (milliseconds).
    pub stale_lock_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            lock_retry_ms: 10,
            stale_lock_ms: 30_000,
        }
    }
}

impl StoreSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms.max(1))
    }

    pub fn stale_lock(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }
}

/// Background executor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackgroundSettings {
    /// Character budget for notification summaries.
    pub summary_chars: usize,
    /// Cap on captured command output.
    pub max_output_chars: usize,
    /// Default timeout for a blocking output read (milliseconds).
    pub default_wait_ms: u64,
    /// Interpreter used for command work.
    pub shell: String,
    /// Finished tasks kept for output reads; the oldest are evicted beyond this.
    pub retain_finished: usize,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            summary_chars: 500,
            max_output_chars: 50_000,
            default_wait_ms: 30_000,
            shell: "sh".to_string(),
            retain_finished: 200,
        }
    }
}

impl BackgroundSettings {
    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.default_wait_ms)
    }
}

/// Coordinator loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Decision cycles before the loop gives up.
    pub max_cycles: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self { max_cycles: 50 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.agent_name, "lead");
        assert_eq!(config.store.lock_timeout_ms, 5_000);
        assert_eq!(config.background.summary_chars, 500);
        assert_eq!(config.coordinator.max_cycles, 50);
    }

    #[test]
    fn test_config_paths() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/test"),
            ..Default::default()
        };

        assert_eq!(config.tasks_dir(), PathBuf::from("/tmp/test/tasks"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/test/logs"));
        assert_eq!(config.teams_dir(), PathBuf::from("/tmp/test/teams"));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yml");

        let config_content = r#"
data_dir: /custom/path
agent_name: worker-2
store:
  lock_timeout_ms: 250
background:
  summary_chars: 120
  shell: bash
coordinator:
  max_cycles: 7
"#;
        fs::write(&config_path, config_content).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/path"));
        assert_eq!(config.agent_name, "worker-2");
        assert_eq!(config.store.lock_timeout(), Duration::from_millis(250));
        // Unspecified fields keep their defaults
        assert_eq!(config.store.stale_lock_ms, 30_000);
        assert_eq!(config.background.summary_chars, 120);
        assert_eq!(config.background.max_output_chars, 50_000);
        assert_eq!(config.background.shell, "bash");
        assert_eq!(config.background.retain_finished, 200);
        assert_eq!(config.coordinator.max_cycles, 7);
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.yml");
        assert!(Config::load_chain(Some(&missing)).is_err());
    }

    #[test]
    fn test_lock_retry_never_zero() {
        let settings = StoreSettings {
            lock_retry_ms: 0,
            ..Default::default()
        };
        assert_eq!(settings.lock_retry(), Duration::from_millis(1));
    }
}
