//! Host page bridge: hosts the candidate build in an isolated frame, speaks
//! the harness protocol with it, and keeps a sequence-numbered log of every
//! message for later inspection.

pub mod harness;
pub mod log;
pub mod protocol;
pub mod transport;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::BridgeConfig;

use self::log::{BridgeLog, LogEntry};
use self::protocol::{Direction, FrameMessage, MessageType};

/// File name the driver writes the bridge dump to, relative to the run dir.
pub const DUMP_FILE: &str = "bridge-artifacts.json";

/// Query parameter carrying the cache-busting token.
pub const CACHE_BUST_PARAM: &str = "_cb";

/// Dump metadata key set when a wait on the frame expired.
pub const WAIT_TIMEOUT_KEY: &str = "waitTimeout";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("timed out after {timeout_ms} ms waiting for {kind}")]
    Timeout { kind: MessageType, timeout_ms: u64 },

    #[error("invalid build url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("frame transport failed: {0}")]
    Transport(String),
}

/// The channel into the isolated frame.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BridgeError>;
    async fn post(&self, message: &FrameMessage) -> Result<(), BridgeError>;
}

/// Everything the bridge saw during a run, returned for post-hoc inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeDump {
    #[serde(default)]
    pub frame_url: Option<String>,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Entries dropped because the log was full.
    #[serde(default)]
    pub evicted: u64,
}

impl BridgeDump {
    /// Read a dump written by the driver into `work_dir`.
    pub fn read_from(work_dir: &Path) -> anyhow::Result<Self> {
        let path = work_dir.join(DUMP_FILE);
        let raw = std::fs::read(&path)
            .with_context(|| format!("failed to read bridge dump: {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse bridge dump: {}", path.display()))
    }

    /// Write the dump as pretty JSON into `work_dir`.
    pub fn write_to(&self, work_dir: &Path) -> anyhow::Result<std::path::PathBuf> {
        let path = work_dir.join(DUMP_FILE);
        let json = serde_json::to_vec_pretty(self).context("failed to serialize bridge dump")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write bridge dump: {}", path.display()))?;
        Ok(path)
    }

    pub fn inbound(&self, kind: MessageType) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(move |e| e.kind == kind && e.direction == Direction::Inbound)
    }
}

/// Build the URL loaded into the frame: the harness flag is added if it is
/// missing, and any previous cache-busting token is replaced by `token`.
pub fn frame_url(build_url: &str, harness_param: &str, token: &str) -> Result<Url, BridgeError> {
    let mut url = Url::parse(build_url).map_err(|e| BridgeError::InvalidUrl {
        url: build_url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https" | "file") {
        return Err(BridgeError::InvalidUrl {
            url: build_url.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != CACHE_BUST_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.iter().any(|(k, _)| k == harness_param) {
        pairs.push((harness_param.to_string(), "1".to_string()));
    }
    pairs.push((CACHE_BUST_PARAM.to_string(), token.to_string()));

    url.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(url)
}

/// Harness-side bridge for one run.
pub struct HostBridge<T> {
    transport: T,
    log: Arc<Mutex<BridgeLog>>,
    config: BridgeConfig,
    frame_url: Mutex<Option<Url>>,
    metadata: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl<T: FrameTransport> HostBridge<T> {
    pub fn new(transport: T, config: BridgeConfig) -> Self {
        Self {
            transport,
            log: Arc::new(Mutex::new(BridgeLog::new(config.log_capacity))),
            config,
            frame_url: Mutex::new(None),
            metadata: Mutex::new(serde_json::Map::new()),
        }
    }

    /// Shared handle to the log, for the task pumping inbound messages.
    pub fn log_handle(&self) -> Arc<Mutex<BridgeLog>> {
        self.log.clone()
    }

    /// Load the build into the frame. The log is cleared so messages from a
    /// previous load of the same page can never be observed.
    pub async fn load(&self, build_url: &str) -> Result<Url, BridgeError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let url = frame_url(build_url, &self.config.harness_param, &token)?;
        self.log.lock().await.clear();
        self.transport.navigate(url.as_str()).await?;
        info!(url = %url, "build loaded into frame");
        *self.frame_url.lock().await = Some(url.clone());
        Ok(url)
    }

    /// Set the mark to the current end of the log.
    pub async fn mark(&self) -> u64 {
        self.log.lock().await.mark()
    }

    /// Send the INIT handshake. The mark is moved first so a following
    /// wait only sees replies to this INIT.
    pub async fn send_init(&self, payload: Option<serde_json::Value>) -> Result<(), BridgeError> {
        let message = FrameMessage::new(MessageType::Init, payload);
        {
            let mut log = self.log.lock().await;
            log.mark();
            log.record(MessageType::Init, Direction::Outbound, message.payload.clone());
        }
        self.transport.post(&message).await
    }

    /// Wait until an inbound message of `kind` recorded after the mark shows
    /// up, using the configured default timeout.
    pub async fn wait_for(&self, kind: MessageType) -> Result<LogEntry, BridgeError> {
        self.wait_for_message_type(kind, Duration::from_millis(self.config.wait_timeout_ms))
            .await
    }

    /// Wait until an inbound message of `kind` recorded after the mark and no
    /// later than `timeout` from now shows up.
    pub async fn wait_for_message_type(
        &self,
        kind: MessageType,
        timeout: Duration,
    ) -> Result<LogEntry, BridgeError> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            if let Some(entry) = self.log.lock().await.find_after_mark(kind, deadline) {
                debug!(seq = entry.seq, kind = %kind, "wait satisfied");
                return Ok(entry.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout {
                    kind,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Attach harness-captured metadata to the dump.
    pub async fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.lock().await.insert(key.into(), value);
    }

    /// Snapshot everything recorded so far.
    pub async fn dump_artifacts(&self) -> BridgeDump {
        let log = self.log.lock().await;
        BridgeDump {
            frame_url: self.frame_url.lock().await.as_ref().map(Url::to_string),
            entries: log.entries().cloned().collect(),
            metadata: self.metadata.lock().await.clone(),
            evicted: log.evicted(),
        }
    }
}
