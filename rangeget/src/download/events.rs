//! Notifications emitted by a running download.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::progress::Progress;
use crate::error::DownloadError;

/// Event delivered to the caller.
///
/// A successful download emits `Started`, any number of `Progress` and
/// `Error`, `Completed`, then `Disposed`. A download that is interrupted or
/// fails ends with `Disposed` and no `Completed`. Errors raised before the
/// first connections are established may precede `Started`.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Started(StartInfo),
    Progress(Progress),
    /// A connection failed, or the download itself did. Check
    /// [`DownloadError::is_recoverable`] to tell a retry from an abort.
    Error(Arc<DownloadError>),
    Completed(Summary),
    Disposed,
}

/// What the download discovered before transferring data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInfo {
    /// Destination file.
    pub path: PathBuf,
    /// Size of the resource, `None` if the server did not say.
    pub file_size: Option<u64>,
    /// Connections opened at start.
    pub connections: usize,
    /// Whether progress was restored from a manifest.
    pub resumed: bool,
    /// Bytes already on disk at start.
    pub completed: u64,
}

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub path: PathBuf,
    /// Final size of the file.
    pub bytes: u64,
    /// Bytes transferred by this run (excludes resumed bytes).
    pub transferred: u64,
    pub elapsed: Duration,
    pub resumed: bool,
    /// Connection errors recovered from.
    pub errors: u32,
}

impl Summary {
    /// Average transfer rate of this run.
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            self.transferred
        } else {
            (self.transferred as f64 / secs) as u64
        }
    }
}

/// How a download run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed(Summary),
    /// Disposed before completion. Progress is kept in the manifest when the
    /// server supports ranges.
    Interrupted {
        path: Option<PathBuf>,
        completed: u64,
    },
}

/// Receiving end of a download's events.
#[derive(Debug)]
pub struct DownloadEvents {
    receiver: mpsc::UnboundedReceiver<DownloadEvent>,
}

impl DownloadEvents {
    /// Next event, `None` once the download is gone.
    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<DownloadEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Sending end, owned by the download. A dropped receiver is not an error.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    sender: mpsc::UnboundedSender<DownloadEvent>,
}

impl EventSender {
    pub fn emit(&self, event: DownloadEvent) {
        let _ = self.sender.send(event);
    }
}

pub(crate) fn channel() -> (EventSender, DownloadEvents) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSender { sender }, DownloadEvents { receiver })
}

/// Cancels a download from any task or thread.
#[derive(Debug, Clone)]
pub struct DisposeHandle {
    token: CancellationToken,
}

impl DisposeHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stop the download. The manifest is flushed before the run returns.
    pub fn dispose(&self) {
        self.token.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_second() {
        let summary = Summary {
            path: PathBuf::from("a.bin"),
            bytes: 4000,
            transferred: 3000,
            elapsed: Duration::from_secs(2),
            resumed: true,
            errors: 0,
        };
        assert_eq!(summary.bytes_per_second(), 1500);
    }

    #[tokio::test]
    async fn test_events_survive_dropped_receiver() {
        let (sender, mut events) = channel();
        sender.emit(DownloadEvent::Disposed);
        assert!(matches!(events.recv().await, Some(DownloadEvent::Disposed)));

        drop(events);
        sender.emit(DownloadEvent::Disposed);
    }

    #[test]
    fn test_dispose_handle() {
        let handle = DisposeHandle::new(CancellationToken::new());
        let clone = handle.clone();
        assert!(!handle.is_disposed());
        clone.dispose();
        assert!(handle.is_disposed());
    }
}
