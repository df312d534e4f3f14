//! Worker lifecycle state as seen from outside the worker.

use std::fmt;
use std::sync::Arc;

use camrec_common::error::WorkerError;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::frame::{CameraId, NegotiatedSettings};
use crate::segment::Segment;

/// Observable state of a camera worker.
///
/// `Opening → Streaming → Stopping → Stopped`, with `Errored` reachable from
/// `Opening` and `Streaming`. `Stopped` and `Errored` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum WorkerStatus {
    Opening,
    Streaming,
    Stopping,
    Stopped,
    Errored(WorkerError),
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Errored(_))
    }

    pub fn is_opening(&self) -> bool {
        matches!(self, Self::Opening)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Streaming => "streaming",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored(_) => "errored",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Errored(reason) => write!(f, "errored ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Everything a worker reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub camera_id: CameraId,
    pub status: WorkerStatus,
    pub negotiated: Option<NegotiatedSettings>,
    pub open_segment: Option<Segment>,
    pub frames_written: u64,
    pub segments_closed: u64,
}

impl WorkerSnapshot {
    pub fn opening(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            status: WorkerStatus::Opening,
            negotiated: None,
            open_segment: None,
            frames_written: 0,
            segments_closed: 0,
        }
    }
}

/// Write side of a worker's status channel.
///
/// Once a terminal status is recorded the snapshot is frozen: later
/// transitions and updates are ignored, so whoever reports first (the worker,
/// or its supervisor after a forced termination) wins.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<WorkerSnapshot>>,
}

impl StatusPublisher {
    pub fn new(camera_id: CameraId) -> (Self, watch::Receiver<WorkerSnapshot>) {
        let (tx, rx) = watch::channel(WorkerSnapshot::opening(camera_id));
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.tx.borrow().clone()
    }

    /// Move to `status`. Returns false if the worker had already finished.
    pub fn transition(&self, status: WorkerStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if current.status.is_terminal() || current.status == status {
                return false;
            }
            tracing::debug!(
                camera_id = current.camera_id,
                from = current.status.label(),
                to = status.label(),
                "Worker state transition"
            );
            current.status = status;
            true
        })
    }

    /// Amend non-status fields. Ignored once the worker has finished.
    pub fn update(&self, amend: impl FnOnce(&mut WorkerSnapshot)) -> bool {
        self.tx.send_if_modified(|current| {
            if current.status.is_terminal() {
                return false;
            }
            amend(current);
            true
        })
    }

    /// Adopt a snapshot relayed from elsewhere (e.g. a worker process).
    pub fn replace(&self, snapshot: WorkerSnapshot) -> bool {
        self.tx.send_if_modified(|current| {
            if current.status.is_terminal() || *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_is_sticky() {
        let (publisher, rx) = StatusPublisher::new(2);
        assert!(publisher.transition(WorkerStatus::Streaming));
        assert!(publisher.transition(WorkerStatus::Errored(WorkerError::DeviceDisconnected(
            "unplugged".into()
        ))));
        assert!(!publisher.transition(WorkerStatus::Stopped));
        assert!(!publisher.update(|s| s.frames_written = 99));
        assert!(!publisher.replace(WorkerSnapshot::opening(2)));

        let seen = rx.borrow().clone();
        assert!(matches!(seen.status, WorkerStatus::Errored(_)));
        assert_eq!(seen.frames_written, 0);
    }

    #[test]
    fn receivers_observe_transitions() {
        let (publisher, mut rx) = StatusPublisher::new(0);
        assert!(rx.borrow_and_update().status.is_opening());
        publisher.transition(WorkerStatus::Streaming);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, WorkerStatus::Streaming);
        assert!(!publisher.transition(WorkerStatus::Streaming));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn status_display_includes_reason() {
        let status = WorkerStatus::Errored(WorkerError::DeviceUnavailable("busy".into()));
        assert_eq!(status.to_string(), "errored (device unavailable: busy)");
        assert_eq!(WorkerStatus::Streaming.to_string(), "streaming");
    }
}
