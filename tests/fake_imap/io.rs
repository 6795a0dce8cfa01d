//! Shared I/O helpers for the fake IMAP server.
//!
//! Thin wrappers around `AsyncWriteExt`/`AsyncBufReadExt` that flush
//! after every write and read one protocol line at a time. Real IMAP
//! servers batch writes for performance; flushing eagerly keeps the
//! test server simple and deterministic.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Write a string to the stream and flush.
pub async fn write_line<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    line: &str,
) -> std::io::Result<()> {
    stream.get_mut().write_all(line.as_bytes()).await?;
    stream.get_mut().flush().await
}

/// Write raw bytes to the stream and flush.
pub async fn write_bytes<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    data: &[u8],
) -> std::io::Result<()> {
    stream.get_mut().write_all(data).await?;
    stream.get_mut().flush().await
}

/// Read one CRLF-terminated line as raw bytes (message literals may
/// follow a line, so the session loop works in bytes, not `String`).
/// Returns `None` on EOF.
pub async fn read_line<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = stream.read_until(b'\n', &mut line).await?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(line))
    }
}
