//! Driver-side harness session.
//!
//! The test driver spawns `iruka-qa harness` and plays the frame: it reads
//! JSON-lines commands from the harness's stdout and writes the build's
//! messages to its stdin. One session loads the build, performs the INIT
//! handshake, waits for READY and then RESULT, drains whatever else the
//! build sends until the driver closes the stream, and writes the dump into
//! the run directory for the service to evaluate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::protocol::MessageType;
use super::transport::{pump, JsonLinesTransport};
use super::{BridgeError, HostBridge, WAIT_TIMEOUT_KEY};
use crate::config::BridgeConfig;

/// How a harness session ended.
#[derive(Debug, Clone)]
pub struct HarnessOutcome {
    pub dump_path: PathBuf,
    /// The message type whose wait expired, if any.
    pub timed_out: Option<MessageType>,
    pub entries: usize,
}

/// Run one session: `load` → `send_init` → wait for READY → wait for
/// RESULT, then dump. A wait that expires is recorded in the dump metadata
/// and ends the session early; it is not an error. Transport failures and
/// bad build URLs are errors and leave no dump behind.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    config: &BridgeConfig,
    game_url: &str,
    run_dir: &Path,
) -> Result<HarnessOutcome>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let bridge = HostBridge::new(JsonLinesTransport::new(writer), config.clone());
    let mut inbound = tokio::spawn(pump(reader, bridge.log_handle()));

    bridge.load(game_url).await?;
    bridge.send_init(None).await?;

    let mut timed_out = None;
    for kind in [MessageType::Ready, MessageType::Result] {
        match bridge.wait_for(kind).await {
            Ok(entry) => info!(seq = entry.seq, kind = %kind, "harness received"),
            Err(BridgeError::Timeout { kind, timeout_ms }) => {
                warn!(kind = %kind, timeout_ms, "harness wait expired");
                bridge
                    .set_metadata(
                        WAIT_TIMEOUT_KEY,
                        json!({ "type": kind.as_str(), "timeoutMs": timeout_ms }),
                    )
                    .await;
                timed_out = Some(kind);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Retries of a RESULT arrive after the first one; keep recording until
    // the driver closes the stream.
    if timed_out.is_none() {
        let drain = Duration::from_millis(config.wait_timeout_ms);
        match tokio::time::timeout(drain, &mut inbound).await {
            Ok(Ok(Ok(lines))) => info!(lines, "frame stream closed"),
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "frame stream failed");
                bridge.set_metadata("streamError", json!(e.to_string())).await;
            }
            Ok(Err(e)) => warn!(error = %e, "frame reader task failed"),
            Err(_) => warn!("frame stream still open after drain window"),
        }
    }
    inbound.abort();

    let dump = bridge.dump_artifacts().await;
    let dump_path = dump.write_to(run_dir)?;
    info!(path = %dump_path.display(), entries = dump.entries.len(), "bridge dump written");
    Ok(HarnessOutcome {
        dump_path,
        timed_out,
        entries: dump.entries.len(),
    })
}
