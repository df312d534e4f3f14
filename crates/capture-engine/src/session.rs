//! Recording session management.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camrec_common::clock::RecordingClock;
use camrec_common::config::{EngineTuning, CHUNK_MINUTES_RANGE};
use camrec_common::error::{CamrecError, CamrecResult, WorkerError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::frame::{CameraDescriptor, CameraId, Frame};
use crate::launcher::{WorkerHandle, WorkerLauncher};
use crate::preview::PreviewSlot;
use crate::status::{StatusPublisher, WorkerSnapshot, WorkerStatus};
use crate::worker::{SourceKind, WorkerSpec};

/// Settings snapshot for one recording session. Never changes once the
/// session has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory segment files are written to. Must already exist.
    pub output_dir: PathBuf,

    /// Nominal length of each segment, in minutes.
    pub chunk_minutes: u32,

    /// Cameras to record, one worker each.
    pub cameras: Vec<CameraDescriptor>,

    /// Where frames come from.
    #[serde(default)]
    pub source: SourceKind,
}

impl SessionConfig {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        chunk_minutes: u32,
        cameras: Vec<CameraDescriptor>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            chunk_minutes,
            cameras,
            source: SourceKind::Device,
        }
    }

    pub fn with_source(mut self, source: SourceKind) -> Self {
        self.source = source;
        self
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.chunk_minutes) * 60)
    }

    /// Check everything that would make the session fail before any worker
    /// is launched.
    pub fn validate(&self) -> CamrecResult<()> {
        if self.cameras.is_empty() {
            return Err(CamrecError::NoCamerasSelected);
        }

        let mut seen = BTreeSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(CamrecError::config(format!(
                    "camera {} selected more than once",
                    camera.id
                )));
            }
        }

        if !CHUNK_MINUTES_RANGE.contains(&self.chunk_minutes) {
            return Err(CamrecError::config(format!(
                "chunk duration must be {}..={} minutes, got {}",
                CHUNK_MINUTES_RANGE.start(),
                CHUNK_MINUTES_RANGE.end(),
                self.chunk_minutes
            )));
        }

        let dir = &self.output_dir;
        let metadata = std::fs::metadata(dir)
            .map_err(|e| CamrecError::invalid_output_dir(dir, format!("cannot access: {e}")))?;
        if !metadata.is_dir() {
            return Err(CamrecError::invalid_output_dir(dir, "not a directory"));
        }

        let probe = dir.join(format!(".camrec-write-probe-{}", std::process::id()));
        std::fs::write(&probe, b"")
            .map_err(|e| CamrecError::invalid_output_dir(dir, format!("not writable: {e}")))?;
        if let Err(e) = std::fs::remove_file(&probe) {
            tracing::warn!(path = %probe.display(), error = %e, "Failed to remove write probe");
        }
        Ok(())
    }
}

struct WorkerEntry {
    handle: Option<Box<dyn WorkerHandle>>,
    status: watch::Receiver<WorkerSnapshot>,
    preview: Arc<PreviewSlot>,
}

impl WorkerEntry {
    /// Entry for a camera whose worker could not be launched at all.
    fn spawn_failed(camera_id: CameraId, message: String) -> Self {
        let (publisher, status) = StatusPublisher::new(camera_id);
        publisher.transition(WorkerStatus::Errored(WorkerError::SpawnFailed(message)));
        Self {
            handle: None,
            status,
            preview: Arc::new(PreviewSlot::new()),
        }
    }
}

/// One active recording across all selected cameras.
///
/// The session only launches, signals, and observes workers; it never
/// touches a camera or a segment file itself.
pub struct RecordingSession {
    config: SessionConfig,
    workers: BTreeMap<CameraId, WorkerEntry>,
    clock: RecordingClock,
    stop_grace: Duration,
    stopped: bool,
}

impl RecordingSession {
    /// Validate `config`, launch one worker per camera, and wait until every
    /// worker has left `Opening` (or the open timeout passed).
    ///
    /// A session whose workers all failed to open is still started; check
    /// [`RecordingSession::status`].
    pub async fn start(
        config: SessionConfig,
        tuning: &EngineTuning,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> CamrecResult<Self> {
        config.validate()?;

        tracing::info!(
            output_dir = %config.output_dir.display(),
            chunk_minutes = config.chunk_minutes,
            cameras = config.cameras.len(),
            "Starting recording session"
        );

        let chunk = config.chunk_duration();
        let mut workers = BTreeMap::new();
        for camera in &config.cameras {
            let spec = WorkerSpec::new(*camera, &config.output_dir, chunk, tuning)
                .with_source(config.source);
            let entry = match launcher.launch(spec) {
                Ok(handle) => WorkerEntry {
                    status: handle.subscribe(),
                    preview: handle.preview(),
                    handle: Some(handle),
                },
                Err(e) => {
                    tracing::error!(camera_id = camera.id, error = %e, "Failed to launch worker");
                    WorkerEntry::spawn_failed(camera.id, e.to_string())
                }
            };
            workers.insert(camera.id, entry);
        }

        let deadline = Instant::now() + tuning.open_timeout();
        for (camera_id, entry) in &workers {
            let mut rx = entry.status.clone();
            let left_opening = tokio::time::timeout_at(
                deadline,
                async move { rx.wait_for(|s| !s.status.is_opening()).await.map(|_| ()) },
            )
            .await;
            if left_opening.is_err() {
                tracing::warn!(camera_id, timeout = ?tuning.open_timeout(), "Camera still opening");
            }
        }

        let session = Self {
            config,
            workers,
            clock: RecordingClock::start(),
            stop_grace: tuning.stop_grace(),
            stopped: false,
        };
        for snapshot in session.snapshots() {
            match &snapshot.status {
                WorkerStatus::Errored(reason) => {
                    tracing::warn!(camera_id = snapshot.camera_id, %reason, "Camera failed to start")
                }
                status => tracing::info!(camera_id = snapshot.camera_id, %status, "Camera started"),
            }
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current status of every camera. Never blocks on a worker.
    pub fn status(&self) -> BTreeMap<CameraId, WorkerStatus> {
        self.workers
            .iter()
            .map(|(id, entry)| (*id, entry.status.borrow().status.clone()))
            .collect()
    }

    /// Full snapshot of every camera, ordered by camera id.
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .values()
            .map(|entry| entry.status.borrow().clone())
            .collect()
    }

    /// Newest unread preview frame for `camera_id`, if any.
    pub fn try_take_preview(&self, camera_id: CameraId) -> Option<Frame> {
        self.workers.get(&camera_id)?.preview.try_take()
    }

    /// Whether `stop` has not run yet.
    pub fn is_active(&self) -> bool {
        !self.stopped
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.clock.elapsed_secs()
    }

    /// Stop every worker and wait for all of them to finish.
    ///
    /// Workers get the stop grace period to close their segments; any worker
    /// still running after that is force-terminated and reported as
    /// `Errored(Unresponsive)`. Returns the final status per camera.
    pub async fn stop(&mut self) -> CamrecResult<BTreeMap<CameraId, WorkerStatus>> {
        if self.stopped {
            return Ok(self.status());
        }
        self.stopped = true;
        tracing::info!(elapsed_secs = self.elapsed_secs(), "Stopping recording session");

        for entry in self.workers.values_mut() {
            if let Some(handle) = entry.handle.as_mut() {
                handle.request_stop();
            }
        }

        let deadline = Instant::now() + self.stop_grace;
        for (camera_id, entry) in self.workers.iter_mut() {
            let mut rx = entry.status.clone();
            let finished = tokio::time::timeout_at(
                deadline,
                async move { rx.wait_for(|s| s.status.is_terminal()).await.map(|_| ()) },
            )
            .await;
            if finished.is_err() {
                tracing::warn!(camera_id, grace = ?self.stop_grace, "Worker ignored stop request");
                if let Some(handle) = entry.handle.as_mut() {
                    handle.terminate();
                }
            }
        }

        let handles: Vec<Box<dyn WorkerHandle>> = self
            .workers
            .values_mut()
            .filter_map(|entry| entry.handle.take())
            .collect();
        tokio::task::spawn_blocking(move || {
            for handle in handles {
                let camera_id = handle.camera_id();
                let status = handle.reap();
                tracing::debug!(camera_id, %status, "Worker reaped");
            }
        })
        .await
        .map_err(|e| CamrecError::session(format!("failed to reap workers: {e}")))?;

        let statuses = self.status();
        tracing::info!(?statuses, "Recording session stopped");
        Ok(statuses)
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        tracing::warn!("Recording session dropped without stop; signalling workers");
        for entry in self.workers.values_mut() {
            if let Some(handle) = entry.handle.as_mut() {
                handle.request_stop();
            }
        }
    }
}
