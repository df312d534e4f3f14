//! Running camera workers as isolated units of execution.
//!
//! A [`WorkerLauncher`] turns a [`WorkerSpec`] into a running worker and hands
//! back a [`WorkerHandle`] the session uses to observe, stop, and reap it.
//! Two launchers exist: [`ThreadLauncher`] (a dedicated OS thread per camera)
//! and [`crate::process::ProcessLauncher`] (a child process per camera).

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use camrec_common::error::{CamrecError, CamrecResult, WorkerError};
use tokio::sync::watch;

use crate::frame::CameraId;
use crate::preview::PreviewSlot;
use crate::status::{StatusPublisher, WorkerSnapshot, WorkerStatus};
use crate::worker::{CameraWorker, WorkerBackends, WorkerSpec};

/// Supervisor-side view of one running worker.
pub trait WorkerHandle: Send {
    fn camera_id(&self) -> CameraId;

    /// Status channel for this worker.
    fn subscribe(&self) -> watch::Receiver<WorkerSnapshot>;

    /// Preview slot the worker's frames land in.
    fn preview(&self) -> Arc<PreviewSlot>;

    /// Ask the worker to stop after its current frame. Never blocks.
    fn request_stop(&mut self);

    /// Give up on a worker that ignored the stop request. The worker is
    /// recorded as `Errored(Unresponsive)`.
    fn terminate(&mut self);

    /// Wait for the worker to finish and return its final status.
    fn reap(self: Box<Self>) -> WorkerStatus;
}

/// Starts camera workers.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: WorkerSpec) -> CamrecResult<Box<dyn WorkerHandle>>;
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Record a forced termination, naming the segment that may be truncated.
pub(crate) fn mark_unresponsive(status: &StatusPublisher) -> bool {
    let possibly_truncated = status.snapshot().open_segment.map(|s| s.path);
    if let Some(path) = &possibly_truncated {
        tracing::warn!(
            camera_id = status.snapshot().camera_id,
            path = %path.display(),
            "Worker force-terminated, segment may be truncated"
        );
    }
    status.transition(WorkerStatus::Errored(WorkerError::Unresponsive {
        possibly_truncated,
    }))
}

/// Run a worker, turning a panic into `Errored(Panicked)`.
pub(crate) fn run_contained(worker: CameraWorker, status: &StatusPublisher) -> WorkerStatus {
    match panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
        Ok(final_status) => final_status,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                camera_id = status.snapshot().camera_id,
                %message,
                "Camera worker panicked"
            );
            let errored = WorkerStatus::Errored(WorkerError::Panicked(message));
            status.transition(errored.clone());
            errored
        }
    }
}

/// Runs each worker on its own named OS thread.
///
/// The worker exclusively owns its device and writer; the only state shared
/// with the supervisor is the status channel, the preview slot, and the stop
/// flag.
pub struct ThreadLauncher {
    backends: WorkerBackends,
}

impl ThreadLauncher {
    pub fn new(backends: WorkerBackends) -> Self {
        Self { backends }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, spec: WorkerSpec) -> CamrecResult<Box<dyn WorkerHandle>> {
        let camera_id = spec.camera.id;
        let (status, _) = StatusPublisher::new(camera_id);
        let preview = Arc::new(PreviewSlot::new());
        let stop = Arc::new(AtomicBool::new(false));

        let worker = CameraWorker::new(
            spec,
            self.backends.clone(),
            status.clone(),
            Arc::clone(&preview),
            Arc::clone(&stop),
        );
        let thread_status = status.clone();
        let join = thread::Builder::new()
            .name(format!("camrec-camera-{camera_id}"))
            .spawn(move || run_contained(worker, &thread_status))
            .map_err(|e| {
                CamrecError::session(format!(
                    "failed to spawn worker thread for camera {camera_id}: {e}"
                ))
            })?;

        tracing::debug!(camera_id, "Launched worker thread");
        Ok(Box::new(ThreadHandle {
            camera_id,
            status,
            preview,
            stop,
            join: Some(join),
        }))
    }
}

struct ThreadHandle {
    camera_id: CameraId,
    status: StatusPublisher,
    preview: Arc<PreviewSlot>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<WorkerStatus>>,
}

impl WorkerHandle for ThreadHandle {
    fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    fn subscribe(&self) -> watch::Receiver<WorkerSnapshot> {
        self.status.subscribe()
    }

    fn preview(&self) -> Arc<PreviewSlot> {
        Arc::clone(&self.preview)
    }

    fn request_stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn terminate(&mut self) {
        // A thread cannot be killed; it is detached and left to exit on its
        // own once whatever it is blocked on returns.
        self.stop.store(true, Ordering::SeqCst);
        mark_unresponsive(&self.status);
        if self.join.take().is_some() {
            tracing::warn!(camera_id = self.camera_id, "Abandoned unresponsive worker thread");
        }
    }

    fn reap(mut self: Box<Self>) -> WorkerStatus {
        if let Some(join) = self.join.take() {
            if let Err(payload) = join.join() {
                let message = panic_message(payload.as_ref());
                self.status
                    .transition(WorkerStatus::Errored(WorkerError::Panicked(message)));
            }
        }
        self.status.snapshot().status
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
