//! Content-Length frame delimiting for stream sockets.
//!
//! This module implements HTTP-style Content-Length framing, the same scheme
//! used by the Language Server Protocol (LSP). It restores packet boundaries
//! on top of a byte stream.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <frame-body>
//! ```
//!
//! The header parsing is case-insensitive and handles both CRLF and LF line endings.

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one Content-Length framed packet from the stream.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
///
/// # Errors
///
/// Returns an error if:
/// - The stream ends in the middle of a header block or body
/// - No Content-Length header is found
/// - Content-Length exceeds `max_size`
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read header line")?;

        if bytes_read == 0 {
            if saw_header {
                return Err(anyhow!("Connection closed in the middle of a frame header"));
            }
            return Ok(None);
        }
        saw_header = true;

        let trimmed = line.trim();

        // Empty line signals end of headers
        if trimmed.is_empty() {
            break;
        }

        if let Some(colon_pos) = trimmed.find(':') {
            let key = trimmed[..colon_pos].trim();
            let value = trimmed[colon_pos + 1..].trim();

            if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid Content-Length value: {}", value))?,
                );
            }
            // Ignore other headers (e.g., Content-Type)
        }
    }

    let size = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;

    if size > max_size {
        return Err(anyhow!(
            "Frame size {} exceeds maximum {} bytes",
            size,
            max_size
        ));
    }

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read frame body")?;

    Ok(Some(body))
}

/// Write one Content-Length framed packet and flush it.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    writer
        .write_all(header.as_bytes())
        .await
        .context("Failed to write frame header")?;

    writer
        .write_all(body)
        .await
        .context("Failed to write frame body")?;

    writer.flush().await.context("Failed to flush frame")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    const MAX: usize = 1024;

    /// Create a connected Unix socket pair for testing.
    /// Returns (server_read, client_write): the reader sees what the writer writes.
    fn socket_pair() -> (OwnedReadHalf, OwnedWriteHalf) {
        let (stream_a, stream_b) = UnixStream::pair().expect("Failed to create socket pair");
        let (a_read, _a_write) = stream_a.into_split();
        let (_b_read, b_write) = stream_b.into_split();
        (a_read, b_write)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (server_read, mut client_write) = socket_pair();

        let frame = br#"{"type":"request","id":1,"name":"ping"}"#;
        write_frame(&mut client_write, frame)
            .await
            .expect("Write failed");

        let mut reader = BufReader::new(server_read);
        let received = timeout(TEST_TIMEOUT, read_frame(&mut reader, MAX))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received.as_deref(), Some(&frame[..]));
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (server_read, mut client_write) = socket_pair();

        write_frame(&mut client_write, b"first").await.unwrap();
        write_frame(&mut client_write, b"").await.unwrap();
        write_frame(&mut client_write, b"third").await.unwrap();
        drop(client_write);

        let mut reader = BufReader::new(server_read);
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), Some(b"third".to_vec()));
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_missing_content_length() {
        let (server_read, mut client_write) = socket_pair();

        client_write.write_all(b"\r\n").await.expect("Write failed");
        drop(client_write);

        let mut reader = BufReader::new(server_read);
        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader, MAX))
            .await
            .expect("Test timed out");

        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("Missing Content-Length"),
            "Expected 'Missing Content-Length' error, got: {}",
            err_msg
        );
    }

    #[tokio::test]
    async fn test_read_handles_lf_only_and_extra_headers() {
        let (server_read, mut client_write) = socket_pair();

        let body = r#"{"test":true}"#;
        let raw = format!(
            "Content-Type: application/json\ncontent-length: {}\n\n{}",
            body.len(),
            body
        );
        client_write.write_all(raw.as_bytes()).await.unwrap();

        let mut reader = BufReader::new(server_read);
        let received = timeout(TEST_TIMEOUT, read_frame(&mut reader, MAX))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received, Some(body.as_bytes().to_vec()));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let (server_read, mut client_write) = socket_pair();

        let raw = format!("Content-Length: {}\r\n\r\n", MAX + 1);
        client_write.write_all(raw.as_bytes()).await.unwrap();

        let mut reader = BufReader::new(server_read);
        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader, MAX))
            .await
            .expect("Test timed out");

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("exceeds maximum"), "Expected size error, got: {}", err_msg);
    }

    #[tokio::test]
    async fn test_clean_close_returns_none() {
        let (server_read, client_write) = socket_pair();
        drop(client_write);

        let mut reader = BufReader::new(server_read);
        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader, MAX))
            .await
            .expect("Test timed out")
            .expect("Clean close is not an error");

        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_close_mid_header_is_error() {
        let (server_read, mut client_write) = socket_pair();
        client_write.write_all(b"Content-Length: 4\r\n").await.unwrap();
        drop(client_write);

        let mut reader = BufReader::new(server_read);
        let result = timeout(TEST_TIMEOUT, read_frame(&mut reader, MAX))
            .await
            .expect("Test timed out");

        assert!(result.unwrap_err().to_string().contains("middle of a frame"));
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let (server_read, mut client_write) = socket_pair();
        client_write
            .write_all(b"Content-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        drop(client_write);

        let mut reader = BufReader::new(server_read);
        let result = read_frame(&mut reader, MAX).await;
        assert!(result.unwrap_err().to_string().contains("Failed to read frame body"));
    }
}
