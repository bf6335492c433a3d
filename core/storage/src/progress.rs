//! Progress reporting for uploads.
//!
//! Progress is an observer interface the caller subscribes to, decoupled
//! from the upload control flow: the gateway and the multipart coordinator
//! emit events, and never block or fail because of an observer.

use tokio::sync::mpsc;

/// One progress event from the gateway or the multipart coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A file upload started.
    FileStarted {
        /// File name within the transfer.
        name: String,
    },
    /// A file upload finished and the object exists at `key`.
    FileCompleted {
        /// File name within the transfer.
        name: String,
        /// Object key the file was stored under.
        key: String,
    },
    /// A file upload failed; the batch continues.
    FileFailed {
        /// File name within the transfer.
        name: String,
        /// Rendered error.
        error: String,
    },
    /// One multipart part finished uploading.
    PartUploaded {
        /// Object key of the multipart session.
        key: String,
        /// Part number, starting at 1.
        part_number: u32,
    },
}

/// Observer interface for upload progress.
pub trait ProgressObserver: Send + Sync {
    /// Called for every event. Implementations must not block.
    fn on_progress(&self, event: ProgressEvent);
}

/// Observer that forwards events into an unbounded channel.
///
/// Dropped receivers are ignored; progress must never fail an upload.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiving half for the subscriber.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_observer_forwards() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_progress(ProgressEvent::FileStarted {
            name: "a.txt".to_string(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::FileStarted {
                name: "a.txt".to_string()
            }
        );
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_progress(ProgressEvent::PartUploaded {
            key: "k".to_string(),
            part_number: 1,
        });
    }
}
