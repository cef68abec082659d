//! Application configuration
//!
//! Loaded from a YAML file at startup; every field has a serde default so a
//! partial (or missing) file still yields a runnable configuration. Tests
//! construct `AppConfig` directly and zero out the trace pacing.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// sqlx connection URL. `sqlite::memory:` for an ephemeral store.
    pub database_url: String,
    /// Gateway bind address.
    pub listen_addr: String,

    // Logging
    pub log_dir: String,
    pub log_file: String,
    /// "hourly" | "daily" | anything else = never rotate
    pub rotation: String,
    pub log_level: String,
    pub use_json: bool,

    /// Confirmation gate time-to-live in seconds.
    pub confirmation_ttl_secs: u64,
    /// Idempotency window for confirm retries, seconds.
    pub idempotency_window_secs: u64,

    /// Trace stream pacing per event status, milliseconds. UX signal only;
    /// set to zero in tests.
    pub trace_pacing: TracePacing,

    /// Agents the fusion reducer expects to complete in a full pipeline run.
    pub expected_agents: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TracePacing {
    pub started_ms: u64,
    pub running_ms: u64,
    pub completed_ms: u64,
}

impl Default for TracePacing {
    fn default() -> Self {
        Self {
            started_ms: 300,
            running_ms: 100,
            completed_ms: 500,
        }
    }
}

impl TracePacing {
    pub const NONE: TracePacing = TracePacing {
        started_ms: 0,
        running_ms: 0,
        completed_ms: 0,
    };
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:rxflow.db".to_string(),
            listen_addr: "127.0.0.1:8080".to_string(),
            log_dir: "logs".to_string(),
            log_file: "rxflow.log".to_string(),
            rotation: "daily".to_string(),
            log_level: "info".to_string(),
            use_json: false,
            confirmation_ttl_secs: 300,
            idempotency_window_secs: 60,
            trace_pacing: TracePacing::default(),
            expected_agents: 4,
        }
    }
}

impl AppConfig {
    /// Load from a YAML file, falling back to defaults if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.confirmation_ttl_secs)
    }

    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_secs)
    }
}
