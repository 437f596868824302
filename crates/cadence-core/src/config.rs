use std::collections::HashSet;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
pub const DEFAULT_LOG_FILTER: &str = "cadence=info";
pub const ENV_PREFIX: &str = "CADENCE_";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Workers started by the `cadence` binary at boot.
    #[serde(default)]
    pub workers: Vec<WorkerSettings>,
}

/// Settings for the worker manager as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// How long a graceful stop waits for the running job before forcing.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// A worker declared in the config file.
///
/// Values are kept raw here; range checks happen when the scheduler turns
/// them into a validated worker config, on the same path as programmatic
/// starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub name: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Absolute jitter. Mutually exclusive with `jitter_fraction`.
    pub jitter_ms: Option<u64>,
    /// Jitter as a fraction of the interval, in `[0, 1)`.
    pub jitter_fraction: Option<f64>,
    #[serde(default)]
    pub task: TaskSettings,
}

/// Built-in job bodies available to config-declared workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSettings {
    /// Complete immediately.
    #[default]
    Noop,
    /// Cooperative async sleep; stops early when the run is cancelled.
    Sleep { ms: u64 },
    /// Thread-blocking sleep that ignores cancellation.
    Block { ms: u64 },
    /// Fail every run with the given message.
    Fail { message: String },
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `CADENCE_CONFIG` env var
    ///   3. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; defaults and env vars still apply.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("CADENCE_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        tracing::debug!(%path, "loading config");

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.shutdown_grace_ms == 0 {
            return Err(CadenceError::InvalidSetting {
                key: "scheduler.shutdown_grace_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            let name = worker.name.trim();
            if !seen.insert(name) {
                return Err(CadenceError::InvalidSetting {
                    key: "workers".to_string(),
                    reason: format!("duplicate worker name '{name}'"),
                });
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = CadenceConfig::load(Some("does-not-exist.toml")).unwrap();
            assert_eq!(config.scheduler.shutdown_grace_ms, DEFAULT_SHUTDOWN_GRACE_MS);
            assert_eq!(config.logging.filter, DEFAULT_LOG_FILTER);
            assert!(config.workers.is_empty());
            Ok(())
        });
    }

    #[test]
    fn parses_workers_and_tasks() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [scheduler]
                shutdown_grace_ms = 750

                [[workers]]
                name = "heartbeat"
                interval_ms = 1000
                timeout_ms = 250
                jitter_fraction = 0.1
                task = { kind = "sleep", ms = 20 }

                [[workers]]
                name = "flaky"
                interval_ms = 500
                timeout_ms = 100
                jitter_ms = 50
                task = { kind = "fail", message = "boom" }
                "#,
            )?;

            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.scheduler.shutdown_grace_ms, 750);
            assert_eq!(config.workers.len(), 2);

            let heartbeat = &config.workers[0];
            assert_eq!(heartbeat.name, "heartbeat");
            assert_eq!(heartbeat.jitter_fraction, Some(0.1));
            assert_eq!(heartbeat.jitter_ms, None);
            assert_eq!(heartbeat.task, TaskSettings::Sleep { ms: 20 });

            let flaky = &config.workers[1];
            assert_eq!(flaky.jitter_ms, Some(50));
            assert_eq!(
                flaky.task,
                TaskSettings::Fail {
                    message: "boom".to_string()
                }
            );
            Ok(())
        });
    }

    #[test]
    fn task_defaults_to_noop() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [[workers]]
                name = "idle"
                interval_ms = 100
                timeout_ms = 50
                "#,
            )?;
            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.workers[0].task, TaskSettings::Noop);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[scheduler]\nshutdown_grace_ms = 750\n")?;
            jail.set_env("CADENCE_SCHEDULER__SHUTDOWN_GRACE_MS", "1200");
            jail.set_env("CADENCE_LOGGING__FILTER", "cadence=debug");

            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.scheduler.shutdown_grace_ms, 1200);
            assert_eq!(config.logging.filter, "cadence=debug");
            Ok(())
        });
    }

    #[test]
    fn duplicate_worker_names_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [[workers]]
                name = "sync"
                interval_ms = 100
                timeout_ms = 50

                [[workers]]
                name = " sync "
                interval_ms = 200
                timeout_ms = 50
                "#,
            )?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "INVALID_SETTING");
            assert!(err.to_string().contains("duplicate worker name 'sync'"));
            Ok(())
        });
    }

    #[test]
    fn zero_grace_rejected() {
        let mut config = CadenceConfig::default();
        config.scheduler.shutdown_grace_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(CadenceError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn malformed_file_is_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[[workers]]\nname = 42\n")?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
