//! Outbound run-completion webhook.
//!
//! One POST per run to the configured endpoint. The raw JSON body is signed
//! with HMAC-SHA256 when a secret is configured; without a secret the request
//! is unauthenticated and only fit for trusted networks. Delivery is
//! one-shot: failures are logged and never retried or surfaced to the run.

use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CallbackConfig;
use crate::summary::{RunStatus, Summary};

pub const SIGNATURE_HEADER: &str = "x-iruka-signature";

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a received signature in constant time.
pub fn verify(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Body of the callback request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: Summary,
    pub report_url: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl CallbackPayload {
    pub fn new(summary: Summary, report_url: Option<String>, meta: serde_json::Value) -> Self {
        Self {
            run_id: summary.run.run_id.clone(),
            status: summary.status,
            summary,
            report_url,
            meta,
        }
    }
}

#[derive(Clone)]
pub struct CallbackDispatcher {
    client: Client,
    url: Option<String>,
    secret: Option<String>,
}

impl CallbackDispatcher {
    pub fn from_config(config: &CallbackConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// Deliver once. Returns an error for transport failures and non-2xx
    /// responses; callers decide what to do with it.
    pub async fn deliver(&self, payload: &CallbackPayload) -> Result<()> {
        let Some(url) = &self.url else {
            return Ok(());
        };
        let body = serde_json::to_vec(payload).context("failed to serialize callback")?;

        let mut req = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            req = req.header(SIGNATURE_HEADER, sign(secret.as_bytes(), &body));
        }

        let resp = req
            .body(body)
            .send()
            .await
            .with_context(|| format!("callback to {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("callback to {url} returned {status}");
        }
        debug!(run_id = %payload.run_id, %status, "callback accepted");
        Ok(())
    }

    /// Fire-and-forget delivery on a background task. Returns `None` when no
    /// endpoint is configured.
    pub fn dispatch(&self, payload: CallbackPayload) -> Option<JoinHandle<()>> {
        if !self.is_configured() {
            return None;
        }
        if self.secret.is_none() {
            debug!(run_id = %payload.run_id, "sending unsigned callback");
        }
        let this = self.clone();
        Some(tokio::spawn(async move {
            match this.deliver(&payload).await {
                Ok(()) => info!(run_id = %payload.run_id, status = %payload.status, "callback delivered"),
                Err(e) => warn!(run_id = %payload.run_id, error = %e, "callback delivery failed"),
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
