//! JSON-lines frame transport.
//!
//! The harness process hosting the isolated frame speaks one JSON object per
//! line: commands go down as `{"op":"navigate",...}` / `{"op":"post",...}`,
//! messages from the build come back as plain [`FrameMessage`] lines.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::log::BridgeLog;
use super::protocol::{Direction, FrameMessage, MessageType};
use super::{BridgeError, FrameTransport};

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command<'a> {
    Navigate { url: &'a str },
    Post { message: &'a FrameMessage },
}

/// Writes harness commands as JSON lines to `W`.
pub struct JsonLinesTransport<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    async fn send(&self, command: &Command<'_>) -> Result<(), BridgeError> {
        let mut line =
            serde_json::to_string(command).map_err(|e| BridgeError::Transport(e.to_string()))?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}

#[async_trait]
impl<W> FrameTransport for JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn navigate(&self, url: &str) -> Result<(), BridgeError> {
        self.send(&Command::Navigate { url }).await
    }

    async fn post(&self, message: &FrameMessage) -> Result<(), BridgeError> {
        self.send(&Command::Post { message }).await
    }
}

/// Read JSON lines from the harness until EOF, recording every line in the
/// log. Lines that do not decode are kept as `INVALID` entries with the raw
/// text. Returns the number of lines recorded.
pub async fn pump<R>(reader: R, log: Arc<Mutex<BridgeLog>>) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (kind, payload) = match serde_json::from_str::<FrameMessage>(trimmed) {
            Ok(msg) => (msg.kind, msg.payload),
            Err(e) => {
                warn!(error = %e, "undecodable harness line");
                (MessageType::Invalid, Some(serde_json::json!({ "raw": trimmed })))
            }
        };
        let seq = log.lock().await.record(kind, Direction::Inbound, payload);
        debug!(seq, kind = %kind, "harness message");
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_commands_are_json_lines() {
        let (client, mut server) = tokio::io::duplex(1024);
        let transport = JsonLinesTransport::new(client);
        transport.navigate("https://cdn.example.com/g/?x=1").await.unwrap();
        transport
            .post(&FrameMessage::new(MessageType::Init, None))
            .await
            .unwrap();
        drop(transport);

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], r#"{"op":"navigate","url":"https://cdn.example.com/g/?x=1"}"#);
        assert_eq!(lines[1], r#"{"op":"post","message":{"type":"INIT"}}"#);
    }

    #[tokio::test]
    async fn test_pump_records_valid_and_invalid_lines() {
        let input = b"{\"type\":\"READY\"}\n\nnot json\n{\"type\":\"RESULT\",\"payload\":{\"score\":3}}\n";
        let log = Arc::new(Mutex::new(BridgeLog::new(16)));
        let n = pump(&input[..], log.clone()).await.unwrap();
        assert_eq!(n, 3);

        let log = log.lock().await;
        let kinds: Vec<MessageType> = log.entries().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageType::Ready, MessageType::Invalid, MessageType::Result]
        );
        let invalid = log.entries().nth(1).unwrap();
        assert_eq!(invalid.payload.as_ref().unwrap()["raw"], "not json");
    }
}
