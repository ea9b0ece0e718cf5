//! Configuration management

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
    pub dispatcher: DispatcherConfig,
    pub registry: RegistryConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub observability: ObservabilityConfig,
}

/// Filesystem layout
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Root of all persisted state (runs, queues, scheduler state, registry)
    pub data_dir: PathBuf,
    /// Directory of DAG definitions
    pub dags_dir: PathBuf,
    /// Directory for step stdout/stderr logs
    pub log_dir: PathBuf,
    /// Namespace this instance serves; empty means all
    #[serde(default)]
    pub namespace: String,
}

/// Scheduler loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Upper bound on catchup firings enqueued per DAG per tick
    pub catchup_window_limit: usize,
    /// Scheduler state is flushed at most this often
    pub state_save_interval_secs: u64,
}

/// Execution engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Global cap on concurrently running attempts
    pub max_concurrent_runs: usize,
    /// Per-attempt status writes are coalesced to one per this many millis
    pub status_write_coalesce_ms: u64,
    pub default_retry_limit: u32,
    pub default_retry_interval_secs: u64,
    /// Queue processors also wake on this coarse timer
    pub processor_wake_interval_secs: u64,
}

/// Remote dispatch configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

/// Service registry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    pub heartbeat_interval_secs: u64,
    /// Hosts whose heartbeat is older than this are considered inactive
    pub heartbeat_ttl_secs: u64,
}

/// One LLM provider endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Secret<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub tracing_enabled: bool,
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Log format
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Config {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("paths.data_dir", "./data")?
            .set_default("paths.dags_dir", "./dags")?
            .set_default("paths.log_dir", "./logs")?
            .set_default("scheduler.tick_interval_secs", 30)?
            .set_default("scheduler.catchup_window_limit", 100)?
            .set_default("scheduler.state_save_interval_secs", 60)?
            .set_default("engine.max_concurrent_runs", 64)?
            .set_default("engine.status_write_coalesce_ms", 250)?
            .set_default("engine.default_retry_limit", 0)?
            .set_default("engine.default_retry_interval_secs", 5)?
            .set_default("engine.processor_wake_interval_secs", 15)?
            .set_default("dispatcher.request_timeout_ms", 30_000)?
            .set_default("dispatcher.poll_interval_ms", 2_000)?
            .set_default("registry.heartbeat_interval_secs", 10)?
            .set_default("registry.heartbeat_ttl_secs", 30)?
            .set_default("observability.metrics_enabled", true)?
            .set_default("observability.tracing_enabled", false)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "pretty")?;

        // Load from config file if exists
        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("DAGFLOW")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.scheduler.tick_interval_secs == 0 {
            errors.push("Scheduler tick interval must be greater than 0".to_string());
        }
        if self.scheduler.catchup_window_limit == 0 {
            errors.push("Catchup window limit must be greater than 0".to_string());
        }
        if self.engine.max_concurrent_runs == 0 {
            errors.push("Max concurrent runs must be greater than 0".to_string());
        }
        if self.registry.heartbeat_ttl_secs <= self.registry.heartbeat_interval_secs {
            errors.push("Heartbeat TTL must exceed the heartbeat interval".to_string());
        }
        if self.paths.data_dir.as_os_str().is_empty() {
            errors.push("Data directory must be set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                data_dir: PathBuf::from("./data"),
                dags_dir: PathBuf::from("./dags"),
                log_dir: PathBuf::from("./logs"),
                namespace: String::new(),
            },
            scheduler: SchedulerConfig {
                tick_interval_secs: 30,
                catchup_window_limit: 100,
                state_save_interval_secs: 60,
            },
            engine: EngineConfig {
                max_concurrent_runs: 64,
                status_write_coalesce_ms: 250,
                default_retry_limit: 0,
                default_retry_interval_secs: 5,
                processor_wake_interval_secs: 15,
            },
            dispatcher: DispatcherConfig {
                request_timeout_ms: 30_000,
                poll_interval_ms: 2_000,
            },
            registry: RegistryConfig {
                heartbeat_interval_secs: 10,
                heartbeat_ttl_secs: 30,
            },
            providers: HashMap::new(),
            observability: ObservabilityConfig {
                metrics_enabled: true,
                tracing_enabled: false,
                otlp_endpoint: None,
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn ttl_must_exceed_heartbeat_interval() {
        let mut config = Config::default();
        config.registry.heartbeat_ttl_secs = config.registry.heartbeat_interval_secs;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("Heartbeat TTL")));
    }
}
