//! Progress reporting for transfers.
//!
//! Transfer paths emit one update per chunk and directory transfers emit one
//! update per completed file. Updates travel over an unbounded channel to
//! whatever collaborator renders them; when no sink is attached, progress is
//! silently discarded. Elapsed values are monotonic deltas from the start of
//! the transfer.

use ferry_platform::FerryResult;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// A single progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// One transferred chunk.
    Chunk {
        /// Bytes moved by this chunk
        bytes: u64,
        /// Cumulative bytes moved by the transfer
        transferred: u64,
        /// Expected total size (0 when unknown)
        total: u64,
        /// Time since the transfer started
        elapsed: Duration,
    },
    /// A file completed during a directory transfer.
    FileDone {
        /// Destination path of the completed file
        path: String,
    },
}

/// Sending side of the progress channel.
///
/// Cheap to clone; dropping every receiver turns emission into a no-op.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink {
    /// Creates a sink and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn chunk(&self, bytes: u64, transferred: u64, total: u64, elapsed: Duration) {
        let _ = self.tx.send(ProgressUpdate::Chunk {
            bytes,
            transferred,
            total,
            elapsed,
        });
    }

    pub(crate) fn file_done(&self, path: &str) {
        let _ = self.tx.send(ProgressUpdate::FileDone {
            path: path.to_string(),
        });
    }
}

/// Formats a byte count with the usual size buckets.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{}KB", bytes / 1024)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{}MB", bytes / (1024 * 1024))
    } else {
        format!("{}GB", bytes / (1024 * 1024 * 1024))
    }
}

/// Renders one update as a plain text line.
pub fn render_update(update: &ProgressUpdate) -> String {
    match update {
        ProgressUpdate::Chunk {
            transferred,
            total,
            elapsed,
            ..
        } => {
            if *total > 0 {
                let percent = (*transferred as f64 / *total as f64 * 100.0) as u32;
                format!(
                    "{} / {} ({}%) {}ms",
                    format_bytes(*transferred),
                    format_bytes(*total),
                    percent.min(100),
                    elapsed.as_millis()
                )
            } else {
                format!(
                    "{} {}ms",
                    format_bytes(*transferred),
                    elapsed.as_millis()
                )
            }
        }
        ProgressUpdate::FileDone { path } => path.clone(),
    }
}

/// Drains a progress receiver into a byte writer, one line per update.
/// Returns when every sink clone has been dropped.
pub async fn pump<W>(
    mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
    writer: &mut W,
) -> FerryResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(update) = rx.recv().await {
        let mut line = render_update(&update);
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_buckets() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5GB");
    }

    #[test]
    fn test_render_chunk() {
        let update = ProgressUpdate::Chunk {
            bytes: 1024,
            transferred: 2048,
            total: 4096,
            elapsed: Duration::from_millis(10),
        };
        let line = render_update(&update);
        assert!(line.contains("2KB"));
        assert!(line.contains("50%"));
    }

    #[tokio::test]
    async fn test_sink_delivers_updates() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.chunk(10, 10, 100, Duration::from_millis(1));
        sink.file_done("/srv/app.conf");
        drop(sink);

        match rx.recv().await.unwrap() {
            ProgressUpdate::Chunk { bytes, .. } => assert_eq!(bytes, 10),
            other => panic!("unexpected update: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ProgressUpdate::FileDone { path } => assert_eq!(path, "/srv/app.conf"),
            other => panic!("unexpected update: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_writes_lines() {
        let (sink, rx) = ProgressSink::channel();
        sink.file_done("done-1");
        sink.file_done("done-2");
        drop(sink);

        let mut out = Vec::new();
        pump(rx, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "done-1\ndone-2\n");
    }
}
