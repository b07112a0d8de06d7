//! Waiting for a tunnel process to announce that it is listening
//!
//! Session clients report readiness by printing a marker line. The output is
//! appended to a log file, so the reader here follows a growing stream: end of
//! input only means "nothing yet", not "done".

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::{sleep, timeout};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("readiness marker not seen within {0:?}")]
    Timeout(Duration),
    #[error("process exited before becoming ready: {0}")]
    Exited(ExitStatus),
    #[error("failed to read process output: {0}")]
    Io(#[from] io::Error),
}

/// Scan `reader` until a line containing `marker` appears.
///
/// `exited` is polled whenever the stream runs dry; any exit before the marker
/// is a failure. The whole wait is bounded by `limit`.
pub async fn await_readiness_marker<R, F>(
    reader: R,
    marker: &str,
    limit: Duration,
    exited: F,
) -> Result<(), ReadinessError>
where
    R: AsyncBufRead + Unpin,
    F: FnMut() -> Option<ExitStatus>,
{
    match timeout(limit, scan(reader, marker, exited)).await {
        Ok(result) => result,
        Err(_) => Err(ReadinessError::Timeout(limit)),
    }
}

async fn scan<R, F>(mut reader: R, marker: &str, mut exited: F) -> Result<(), ReadinessError>
where
    R: AsyncBufRead + Unpin,
    F: FnMut() -> Option<ExitStatus>,
{
    // client output is not guaranteed to be UTF-8
    let mut line = Vec::new();
    loop {
        let read = reader.read_until(b'\n', &mut line).await?;

        // a partial line at the end of the stream is kept and extended later
        let text = String::from_utf8_lossy(&line);
        if text.contains(marker) {
            debug!(line = %text.trim_end(), "readiness marker seen");
            return Ok(());
        }
        if line.ends_with(b"\n") {
            line.clear();
        }

        if read == 0 {
            if let Some(status) = exited() {
                return Err(ReadinessError::Exited(status));
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use tempfile::TempDir;
    use tokio::io::{AsyncWriteExt, BufReader};

    const MARKER: &str = "Waiting for connections";

    #[tokio::test]
    async fn test_marker_found() {
        let output = b"Starting session with SessionId: abc\nPort 19881 opened for sessionId abc.\nWaiting for connections...\n";
        let result = await_readiness_marker(BufReader::new(&output[..]), MARKER, Duration::from_secs(1), || None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_marker_without_trailing_newline() {
        let output = b"Waiting for connections...";
        let result = await_readiness_marker(BufReader::new(&output[..]), MARKER, Duration::from_secs(1), || None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_marker_after_invalid_utf8() {
        let output = b"banner \xff\xfe\x80 garbage\npartial \xc3\nWaiting for connections...\n";
        let result = await_readiness_marker(BufReader::new(&output[..]), MARKER, Duration::from_secs(1), || None).await;
        assert!(result.is_ok(), "{:?}", result);
    }

    #[tokio::test]
    async fn test_exit_before_marker() {
        let output = b"An error occurred (TargetNotConnected)\n";
        let result = await_readiness_marker(BufReader::new(&output[..]), MARKER, Duration::from_secs(5), || {
            Some(ExitStatus::from_raw(255 << 8))
        })
        .await;

        match result {
            Err(ReadinessError::Exited(status)) => assert_eq!(status.code(), Some(255)),
            other => panic!("expected exit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let output = b"Starting session with SessionId: abc\n";
        let result =
            await_readiness_marker(BufReader::new(&output[..]), MARKER, Duration::from_millis(300), || None).await;

        assert!(matches!(result, Err(ReadinessError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_follows_growing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunnel.log");
        tokio::fs::write(&path, "Starting session\n").await.unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .await
                .unwrap();
            file.write_all(b"Waiting for conn").await.unwrap();
            file.flush().await.unwrap();
            sleep(Duration::from_millis(150)).await;
            file.write_all(b"ections...\n").await.unwrap();
            file.flush().await.unwrap();
        });

        let reader = BufReader::new(tokio::fs::File::open(&path).await.unwrap());
        let result = await_readiness_marker(reader, MARKER, Duration::from_secs(5), || None).await;
        assert!(result.is_ok(), "{:?}", result);

        writer.await.unwrap();
    }
}
