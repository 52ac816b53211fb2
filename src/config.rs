//! TOML configuration for cibench.
//!
//! Every section falls back to compiled-in defaults. The file is looked up
//! via the `CIBENCH_CONFIG` environment variable, then `./cibench.toml`.
//! Credentials may be supplied through the environment instead of the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::execution::ExecutionConfig;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `CIBENCH_CONFIG`, `./cibench.toml`, compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("CIBENCH_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CIBENCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new("cibench.toml");
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Secrets and the project id may come from the environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("CIBENCH_TRIGGER_TOKEN") {
            self.provider.trigger_token = Some(token);
        }
        if let Ok(token) = std::env::var("CIBENCH_API_TOKEN") {
            self.provider.api_token = Some(token);
        }
        if let Ok(project) = std::env::var("CIBENCH_PROJECT_ID") {
            self.provider.project_id = Some(project);
        }
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Connection settings for the CI provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the CI instance, e.g. `https://gitlab.com`.
    pub base_url: String,
    /// Numeric id or namespaced path of the project that runs the pipelines.
    pub project_id: Option<String>,
    /// Token for read/cancel API calls.
    pub api_token: Option<String>,
    /// Pipeline trigger token.
    pub trigger_token: Option<String>,
    /// Per-request HTTP timeout (seconds).
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gitlab.com".to_string(),
            project_id: None,
            api_token: None,
            trigger_token: None,
            request_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Polling discipline of the execution tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Wait between two status checks (milliseconds).
    pub poll_interval_ms: u64,
    /// Wall-clock budget for one execution, measured from the start of polling.
    pub execution_timeout_secs: u64,
    /// Wait before retrying a log fetch that returned only empty logs.
    pub log_retry_delay_ms: u64,
    /// Number of completion attempts before empty logs are recorded as-is.
    pub log_retry_attempts: u32,
    /// Configuration used by plain `trigger(target)` calls.
    pub execution: ExecutionConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            execution_timeout_secs: 1_800,
            log_retry_delay_ms: 3_000,
            log_retry_attempts: 10,
            execution: ExecutionConfig {
                branch: "main".to_string(),
                ..ExecutionConfig::default()
            },
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn log_retry_delay(&self) -> Duration {
        Duration::from_millis(self.log_retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Benchmark
// ---------------------------------------------------------------------------

/// Defaults for benchmark runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Trials per task.
    pub trial_count: u32,
    /// Pause between two trials of the same task (milliseconds).
    pub inter_trial_delay_ms: u64,
    /// Targets the built-in task catalogue runs against.
    pub targets: Vec<String>,
    /// Pipelines started at once by the concurrency task.
    pub concurrent_runs: usize,
    /// Settings of the secondary runner used by the comparison task.
    pub secondary: ExecutionConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            trial_count: 3,
            inter_trial_delay_ms: 2_000,
            targets: vec!["hello-world".to_string()],
            concurrent_runs: 2,
            secondary: ExecutionConfig {
                branch: "main".to_string(),
                runner_tag: "secondary".to_string(),
                ..ExecutionConfig::default()
            },
        }
    }
}

impl BenchmarkConfig {
    pub fn inter_trial_delay(&self) -> Duration {
        Duration::from_millis(self.inter_trial_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Storage / API / Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file holding executions and measurements.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/cibench.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
