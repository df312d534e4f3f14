//! The per-camera capture → preview → write loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camrec_common::clock::{Clock, RateController, RecordingClock, SystemClock};
use camrec_common::config::EngineTuning;
use camrec_common::error::CamrecResult;
use serde::{Deserialize, Serialize};

use crate::device::{CaptureDeviceFactory, CaptureUnit};
use crate::frame::CameraDescriptor;
use crate::pipeline::{GstDeviceFactory, GstSinkFactory};
use crate::preview::PreviewSlot;
use crate::status::{StatusPublisher, WorkerStatus};
use crate::synthetic::{SyntheticCameraFactory, SyntheticPattern};
use crate::writer::{SegmentSinkFactory, SegmentWriter};

/// How often progress counters are pushed to the status channel while streaming.
const PROGRESS_HZ: u32 = 4;

/// Where a worker gets its frames from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Real cameras through GStreamer.
    #[default]
    Device,
    /// Generated test pattern paced in real time.
    Synthetic,
}

/// Everything a worker needs to know, in a form that can be handed to a
/// separate process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub camera: CameraDescriptor,
    pub output_dir: PathBuf,
    pub chunk_duration: Duration,
    pub read_timeout: Duration,
    pub max_consecutive_read_failures: u32,
    pub preview_interval: Duration,
    pub preview_jpeg_quality: u8,
    #[serde(default)]
    pub source: SourceKind,
}

impl WorkerSpec {
    pub fn new(
        camera: CameraDescriptor,
        output_dir: impl Into<PathBuf>,
        chunk_duration: Duration,
        tuning: &EngineTuning,
    ) -> Self {
        Self {
            camera,
            output_dir: output_dir.into(),
            chunk_duration,
            read_timeout: tuning.read_timeout(),
            max_consecutive_read_failures: tuning.max_consecutive_read_failures,
            preview_interval: tuning.preview_interval(),
            preview_jpeg_quality: tuning.preview_jpeg_quality,
            source: SourceKind::Device,
        }
    }

    pub fn with_source(mut self, source: SourceKind) -> Self {
        self.source = source;
        self
    }
}

/// The device and file backends a worker runs against.
#[derive(Clone)]
pub struct WorkerBackends {
    pub devices: Arc<dyn CaptureDeviceFactory>,
    pub sinks: Arc<dyn SegmentSinkFactory>,
    pub clock: Arc<dyn Clock>,
}

impl WorkerBackends {
    pub fn new(
        devices: Arc<dyn CaptureDeviceFactory>,
        sinks: Arc<dyn SegmentSinkFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            devices,
            sinks,
            clock,
        }
    }

    /// Production backends: GStreamer capture and MP4 encoding.
    pub fn for_source(source: SourceKind) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let devices: Arc<dyn CaptureDeviceFactory> = match source {
            SourceKind::Device => Arc::new(GstDeviceFactory::new(Arc::clone(&clock))),
            SourceKind::Synthetic => Arc::new(
                SyntheticCameraFactory::new(Arc::clone(&clock))
                    .realtime(true)
                    .pattern(SyntheticPattern::default()),
            ),
        };
        Self::new(devices, Arc::new(GstSinkFactory::default()), clock)
    }
}

/// One camera's isolated capture unit of work.
pub struct CameraWorker {
    spec: WorkerSpec,
    backends: WorkerBackends,
    status: StatusPublisher,
    preview: Arc<PreviewSlot>,
    stop: Arc<AtomicBool>,
}

impl CameraWorker {
    pub fn new(
        spec: WorkerSpec,
        backends: WorkerBackends,
        status: StatusPublisher,
        preview: Arc<PreviewSlot>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            spec,
            backends,
            status,
            preview,
            stop,
        }
    }

    /// Run until stopped or failed. Returns the terminal status.
    ///
    /// Every path out of here has released the camera handle and finalized
    /// the open segment.
    pub fn run(self) -> WorkerStatus {
        let camera_id = self.spec.camera.id;
        let span = tracing::info_span!("camera_worker", camera_id);
        let _guard = span.enter();

        let mut unit = match CaptureUnit::open(
            self.backends.devices.as_ref(),
            &self.spec.camera,
            self.spec.read_timeout,
            self.spec.max_consecutive_read_failures,
        ) {
            Ok(unit) => unit,
            Err(e) => {
                tracing::error!(error = %e, "Cannot open camera");
                return self.finish(WorkerStatus::Errored(e.worker_reason()));
            }
        };

        let settings = unit.negotiated();
        self.status.update(|s| s.negotiated = Some(settings));

        let mut writer = SegmentWriter::new(
            camera_id,
            &self.spec.output_dir,
            self.spec.chunk_duration,
            settings,
            Arc::clone(&self.backends.sinks),
        );
        match writer.open(self.backends.clock.now()) {
            Ok(segment) => {
                let segment = segment.clone();
                self.status.update(|s| s.open_segment = Some(segment));
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot open first segment");
                unit.close();
                return self.finish(WorkerStatus::Errored(e.worker_reason()));
            }
        }

        self.status.transition(WorkerStatus::Streaming);

        let streamed = self.stream(&mut unit, &mut writer);

        // Terminated by the supervisor while blocked: the reported status is
        // final and the segment stays as it was at that moment.
        let reported = self.status.snapshot().status;
        if reported.is_terminal() {
            writer.abandon();
            unit.close();
            tracing::warn!(status = %reported, "Worker returned after being abandoned");
            return reported;
        }

        match streamed {
            Ok(()) => {
                self.status.transition(WorkerStatus::Stopping);
                let closed = writer.close();
                unit.close();
                self.publish_progress(&writer);
                match closed {
                    Ok(_) => {
                        tracing::info!(
                            frames = writer.frames_written(),
                            segments = writer.segments_closed(),
                            "Stopped recording"
                        );
                        self.finish(WorkerStatus::Stopped)
                    }
                    Err(e) => self.finish(WorkerStatus::Errored(e.worker_reason())),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Camera worker failed");
                if let Err(close_err) = writer.close() {
                    tracing::warn!(error = %close_err, "Open segment could not be finalized");
                }
                unit.close();
                self.publish_progress(&writer);
                self.finish(WorkerStatus::Errored(e.worker_reason()))
            }
        }
    }

    fn stream(&self, unit: &mut CaptureUnit, writer: &mut SegmentWriter) -> CamrecResult<()> {
        let uptime = RecordingClock::start();
        let mut progress = RateController::new(PROGRESS_HZ);

        while !self.stop.load(Ordering::SeqCst) {
            match unit.read_frame() {
                Ok(frame) => {
                    self.preview.publish(frame.clone());
                    if let Some(closed) = writer.write(frame)? {
                        tracing::info!(
                            segment_index = closed.segment_index,
                            path = %closed.path.display(),
                            "Segment finalized"
                        );
                        self.publish_progress(writer);
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Camera stalled, retrying");
                }
                Err(e) => return Err(e),
            }

            if progress.should_tick(uptime.elapsed_ns()) {
                self.publish_progress(writer);
            }
        }

        tracing::debug!("Stop requested");
        Ok(())
    }

    fn publish_progress(&self, writer: &SegmentWriter) {
        let open_segment = writer.current().cloned();
        let frames_written = writer.frames_written();
        let segments_closed = writer.segments_closed();
        self.status.update(|s| {
            s.open_segment = open_segment;
            s.frames_written = frames_written;
            s.segments_closed = segments_closed;
        });
    }

    fn finish(&self, status: WorkerStatus) -> WorkerStatus {
        if let WorkerStatus::Errored(reason) = &status {
            tracing::warn!(%reason, "Worker errored");
        }
        self.status.transition(status.clone());
        status
    }
}
