//! Newline-delimited JSON over Unix sockets.
//!
//! The daemon reports startup progress to its parent supervisor through this
//! channel: one [`StartupMessage`] per line. The supervisor side only ever
//! reads; the daemon side only ever writes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::BufReader;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Startup progress reported by the daemon to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartupMessage {
    /// Sent before full startup: the computed daemon log file path, so the
    /// supervisor can point operators at it even if startup later fails.
    Config {
        #[serde(rename = "logPath")]
        log_path: String,
    },

    /// Startup completed; carries the human-readable routing-table dump.
    Success { table: String },

    /// Fatal startup failure.
    Error { message: String },
}

pub async fn read_json_line_with_limit<R, T>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > max_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "json line exceeds max length ({} > {})",
                buf.len(),
                max_bytes
            ),
        ));
    }

    let s = std::str::from_utf8(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    serde_json::from_str::<T>(s)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub async fn read_json_line<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_json_line_with_limit(reader, DEFAULT_MAX_LINE_BYTES).await
}

pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Connect to the supervisor socket and send one startup message.
pub async fn send_startup_message(
    socket_path: impl AsRef<Path>,
    message: &StartupMessage,
) -> std::io::Result<()> {
    let mut stream = UnixStream::connect(socket_path.as_ref()).await?;
    write_json_line(&mut stream, message).await?;
    stream.shutdown().await
}

/// Read startup messages until the daemon closes its end.
pub async fn read_startup_messages(stream: UnixStream) -> std::io::Result<Vec<StartupMessage>> {
    let mut reader = BufReader::new(stream);
    let mut messages = Vec::new();
    while let Some(msg) = read_json_line::<_, StartupMessage>(&mut reader).await? {
        messages.push(msg);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn roundtrips_startup_messages_over_jsonl() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut _ar, mut aw) = tokio::io::split(a);
        let (mut br, _bw) = tokio::io::split(b);
        let mut br = BufReader::new(&mut br);

        let sent = StartupMessage::Config {
            log_path: "/var/log/trellis/daemon.log".to_string(),
        };
        write_json_line(&mut aw, &sent).await.unwrap();
        let recv: StartupMessage = read_json_line(&mut br).await.unwrap().unwrap();
        assert_eq!(recv, sent);
    }

    #[tokio::test]
    async fn config_message_uses_wire_field_names() {
        let msg = StartupMessage::Config {
            log_path: "/tmp/d.log".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""kind":"config""#));
        assert!(json.contains(r#""logPath":"/tmp/d.log""#));
    }

    #[tokio::test]
    async fn returns_invalid_data_on_bad_json() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut _ar, mut aw) = tokio::io::split(a);
        let (mut br, _bw) = tokio::io::split(b);
        let mut br = BufReader::new(&mut br);

        aw.write_all(b"{not json}\n").await.unwrap();

        let err = read_json_line::<_, StartupMessage>(&mut br)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn errors_when_line_exceeds_limit() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (mut _ar, mut aw) = tokio::io::split(a);
        let (mut br, _bw) = tokio::io::split(b);
        let mut br = BufReader::new(&mut br);

        let big = "a".repeat(33);
        aw.write_all(big.as_bytes()).await.unwrap();
        aw.write_all(b"\n").await.unwrap();

        let err = read_json_line_with_limit::<_, serde_json::Value>(&mut br, 32)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn reads_messages_until_daemon_disconnects() {
        let (a, b) = UnixStream::pair().unwrap();

        let writer = tokio::spawn(async move {
            let mut a = a;
            write_json_line(
                &mut a,
                &StartupMessage::Config {
                    log_path: "/tmp/t.log".to_string(),
                },
            )
            .await
            .unwrap();
            write_json_line(
                &mut a,
                &StartupMessage::Success {
                    table: "empty".to_string(),
                },
            )
            .await
            .unwrap();
        });

        let messages = read_startup_messages(b).await.unwrap();
        writer.await.unwrap();

        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], StartupMessage::Config { .. }));
        assert!(matches!(
            messages[1],
            StartupMessage::Success { ref table } if table == "empty"
        ));
    }
}
