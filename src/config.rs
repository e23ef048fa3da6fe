//! TOML configuration for the iruka-qa service.
//!
//! Layered model: an explicit path, then the `IRUKA_QA_CONFIG` environment
//! variable, then the system location, then compiled-in defaults. A few
//! deployment-specific values (callback endpoint, secret, domain allow-list)
//! can additionally be overridden from the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the service process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded service configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `IRUKA_QA_CONFIG` environment variable.
    /// 2. `/etc/iruka-qa/iruka-qa.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("IRUKA_QA_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "IRUKA_QA_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/iruka-qa/iruka-qa.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Resolve the configuration for a process: an explicit `--config` path
    /// must load, otherwise the layered lookup applies. Environment
    /// overrides and validation run in both cases.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is injected so tests do not
    /// touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("IRUKA_CALLBACK_URL").filter(|v| !v.trim().is_empty()) {
            self.callback.url = Some(url.trim().to_string());
        }
        if let Some(secret) = lookup("IRUKA_CALLBACK_SECRET").filter(|v| !v.is_empty()) {
            self.callback.secret = Some(secret);
        }
        if let Some(domains) = lookup("IRUKA_ALLOWED_DOMAINS") {
            self.submission.allowed_domains = domains
                .split(',')
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
        }
    }

    /// Reject configurations that cannot run a pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.driver.program.trim().is_empty() {
            anyhow::bail!("driver.program must not be empty");
        }
        if self.server.max_concurrent_runs == 0 {
            anyhow::bail!("server.max_concurrent_runs must be at least 1");
        }
        if self.bridge.log_capacity == 0 {
            anyhow::bail!("bridge.log_capacity must be at least 1");
        }
        if self.storage.backend == StorageBackend::Http && self.storage.endpoint.is_none() {
            anyhow::bail!("storage.endpoint is required for the http backend");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener and local filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Root directory holding one working directory per run.
    pub runs_dir: PathBuf,
    /// Upper bound on pipeline runs executing at the same time.
    pub max_concurrent_runs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("data/iruka-qa.db"),
            runs_dir: PathBuf::from("data/runs"),
            max_concurrent_runs: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Inputs accepted by `POST /run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Hosts a `gameUrl` may point at (exact match or subdomain). Empty means
    /// any host is accepted.
    pub allowed_domains: Vec<String>,
    /// The harness page handed to the driver alongside the build URL.
    pub hub_url: String,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            hub_url: "http://127.0.0.1:8080/hub/index.html".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The external test-driver process spawned once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Extra variables for the child. Empty values are dropped before spawn.
    pub extra_env: BTreeMap<String, String>,
    /// Directory (relative to the run dir) holding the HTML report.
    pub report_dir: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec!["playwright".to_string(), "test".to_string()],
            extra_env: BTreeMap::new(),
            report_dir: "playwright-report".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Host page bridge tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Query parameter appended to the build URL so the build knows it is
    /// hosted by the harness.
    pub harness_param: String,
    /// Default timeout for `wait_for_message_type`.
    pub wait_timeout_ms: u64,
    /// Poll period of the wait loop.
    pub poll_interval_ms: u64,
    /// Maximum number of messages kept per run.
    pub log_capacity: usize,
    /// INIT → READY latency above which the handshake check fails.
    pub ready_budget_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            harness_param: "iruka_harness".to_string(),
            wait_timeout_ms: 15_000,
            poll_interval_ms: 25,
            log_capacity: 2_000,
            ready_budget_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where run artifacts are published.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Artifacts stay in the local run directory only.
    Disabled,
    /// Copy into another directory tree (shared volume, tests).
    Local,
    /// HTTP PUT against an object-store endpoint.
    Http,
}

/// Blob storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Base URL objects are PUT to, e.g. `https://storage.example.com`.
    pub endpoint: Option<String>,
    /// Host used to build public URLs.
    pub public_host: String,
    pub bucket: String,
    /// Key prefix between bucket and run id.
    pub prefix: String,
    /// Destination root for the `local` backend.
    pub local_root: PathBuf,
    /// Bearer token for the `http` backend.
    pub token: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Disabled,
            endpoint: None,
            public_host: "storage.googleapis.com".to_string(),
            bucket: "iruka-qa-artifacts".to_string(),
            prefix: "runs".to_string(),
            local_root: PathBuf::from("data/published"),
            token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

/// Outbound webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub url: Option<String>,
    /// HMAC key. When absent the callback is sent unsigned.
    pub secret: Option<String>,
    pub timeout_ms: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
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
