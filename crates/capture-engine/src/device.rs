//! Camera device access.
//!
//! A [`CaptureDevice`] is one open camera handle. [`CaptureUnit`] wraps it for
//! the worker: it stamps frames with a contiguous sequence number, bounds how
//! many consecutive read timeouts are tolerated, and guarantees the handle is
//! released exactly once.

use std::time::Duration;

use camrec_common::error::{CamrecError, CamrecResult};

use crate::frame::{CameraDescriptor, CameraId, Frame, NegotiatedSettings};

/// One open camera.
pub trait CaptureDevice: Send {
    /// Settings the device actually delivers.
    fn negotiated(&self) -> NegotiatedSettings;

    /// Block for at most the read timeout given at open time.
    ///
    /// Fails with `ReadTimeout` when no frame arrived in time and with
    /// `DeviceDisconnected` when the device is gone.
    fn read_frame(&mut self) -> CamrecResult<Frame>;

    /// Release the device. Must be safe to call more than once.
    fn close(&mut self) -> CamrecResult<()>;
}

/// Opens camera devices.
pub trait CaptureDeviceFactory: Send + Sync {
    /// Open the camera described by `descriptor`, failing with
    /// `DeviceUnavailable` when it is absent or in use.
    fn open(
        &self,
        descriptor: &CameraDescriptor,
        read_timeout: Duration,
    ) -> CamrecResult<Box<dyn CaptureDevice>>;
}

/// The capture side of a camera worker.
pub struct CaptureUnit {
    camera_id: CameraId,
    device: Option<Box<dyn CaptureDevice>>,
    negotiated: NegotiatedSettings,
    read_timeout: Duration,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
    frames_read: u64,
}

impl CaptureUnit {
    pub fn open(
        factory: &dyn CaptureDeviceFactory,
        descriptor: &CameraDescriptor,
        read_timeout: Duration,
        max_consecutive_failures: u32,
    ) -> CamrecResult<Self> {
        let device = factory.open(descriptor, read_timeout)?;
        let negotiated = device.negotiated();
        tracing::info!(
            camera_id = descriptor.id,
            requested_fps = descriptor.requested_fps,
            requested_width = descriptor.requested_width,
            requested_height = descriptor.requested_height,
            %negotiated,
            "Camera opened"
        );
        Ok(Self {
            camera_id: descriptor.id,
            device: Some(device),
            negotiated,
            read_timeout,
            max_consecutive_failures: max_consecutive_failures.max(1),
            consecutive_failures: 0,
            frames_read: 0,
        })
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn negotiated(&self) -> NegotiatedSettings {
        self.negotiated
    }

    /// Frames delivered so far.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Read the next frame.
    ///
    /// A `ReadTimeout` is passed through until `max_consecutive_failures` of
    /// them happen in a row; the one that reaches the bound is reported as
    /// `DeviceDisconnected` instead.
    pub fn read_frame(&mut self) -> CamrecResult<Frame> {
        let Some(device) = self.device.as_mut() else {
            return Err(CamrecError::disconnected(self.camera_id, "device already closed"));
        };

        match device.read_frame() {
            Ok(mut frame) => {
                self.consecutive_failures = 0;
                frame.sequence = self.frames_read;
                self.frames_read += 1;
                Ok(frame)
            }
            Err(e) if e.is_transient() => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.max_consecutive_failures {
                    Err(CamrecError::disconnected(
                        self.camera_id,
                        format!(
                            "no frame after {} consecutive reads ({:?} timeout each)",
                            self.consecutive_failures, self.read_timeout
                        ),
                    ))
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Release the device handle. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.close() {
                tracing::warn!(camera_id = self.camera_id, error = %e, "Camera close reported an error");
            } else {
                tracing::debug!(camera_id = self.camera_id, frames = self.frames_read, "Camera closed");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }
}

impl Drop for CaptureUnit {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::Local;

    use super::*;

    enum Step {
        Frame,
        Timeout,
        Disconnect,
    }

    struct ScriptedDevice {
        steps: VecDeque<Step>,
        closes: Arc<AtomicUsize>,
    }

    impl CaptureDevice for ScriptedDevice {
        fn negotiated(&self) -> NegotiatedSettings {
            NegotiatedSettings {
                fps: 10,
                width: 1,
                height: 1,
            }
        }

        fn read_frame(&mut self) -> CamrecResult<Frame> {
            match self.steps.pop_front() {
                Some(Step::Frame) => Ok(Frame::new(vec![0u8; 3], 1, 1, Local::now(), 999)),
                Some(Step::Timeout) | None => Err(CamrecError::ReadTimeout {
                    camera_id: 0,
                    timeout: Duration::from_millis(1),
                }),
                Some(Step::Disconnect) => Err(CamrecError::disconnected(0, "unplugged")),
            }
        }

        fn close(&mut self) -> CamrecResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedFactory {
        steps: std::sync::Mutex<Option<Vec<Step>>>,
        closes: Arc<AtomicUsize>,
    }

    impl CaptureDeviceFactory for ScriptedFactory {
        fn open(
            &self,
            descriptor: &CameraDescriptor,
            _read_timeout: Duration,
        ) -> CamrecResult<Box<dyn CaptureDevice>> {
            let steps = self
                .steps
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| CamrecError::device_unavailable(descriptor.id, "in use"))?;
            Ok(Box::new(ScriptedDevice {
                steps: steps.into(),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn unit(steps: Vec<Step>, max_failures: u32) -> (CaptureUnit, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = ScriptedFactory {
            steps: std::sync::Mutex::new(Some(steps)),
            closes: Arc::clone(&closes),
        };
        let unit = CaptureUnit::open(
            &factory,
            &CameraDescriptor::device_default(0),
            Duration::from_millis(1),
            max_failures,
        )
        .unwrap();
        (unit, closes)
    }

    #[test]
    fn sequences_are_contiguous_across_timeouts() {
        let (mut unit, _) = unit(vec![Step::Frame, Step::Timeout, Step::Frame], 3);
        assert_eq!(unit.read_frame().unwrap().sequence, 0);
        assert!(unit.read_frame().unwrap_err().is_transient());
        assert_eq!(unit.read_frame().unwrap().sequence, 1);
    }

    #[test]
    fn consecutive_timeouts_escalate_to_disconnect() {
        let (mut unit, _) = unit(vec![Step::Timeout, Step::Timeout, Step::Timeout], 3);
        assert!(unit.read_frame().unwrap_err().is_transient());
        assert!(unit.read_frame().unwrap_err().is_transient());
        assert!(matches!(
            unit.read_frame().unwrap_err(),
            CamrecError::DeviceDisconnected { .. }
        ));
    }

    #[test]
    fn a_frame_resets_the_failure_count() {
        let (mut unit, _) = unit(
            vec![Step::Timeout, Step::Frame, Step::Timeout, Step::Disconnect],
            2,
        );
        assert!(unit.read_frame().unwrap_err().is_transient());
        assert!(unit.read_frame().is_ok());
        assert!(unit.read_frame().unwrap_err().is_transient());
        assert!(matches!(
            unit.read_frame().unwrap_err(),
            CamrecError::DeviceDisconnected { .. }
        ));
    }

    #[test]
    fn close_releases_device_once() {
        let (mut unit, closes) = unit(vec![], 1);
        unit.close();
        unit.close();
        assert!(!unit.is_open());
        assert!(unit.read_frame().is_err());
        drop(unit);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_failure_is_device_unavailable() {
        let factory = ScriptedFactory {
            steps: std::sync::Mutex::new(None),
            closes: Arc::new(AtomicUsize::new(0)),
        };
        let err = CaptureUnit::open(
            &factory,
            &CameraDescriptor::device_default(4),
            Duration::from_millis(1),
            1,
        )
        .err()
        .unwrap();
        assert!(matches!(err, CamrecError::DeviceUnavailable { camera_id: 4, .. }));
    }
}
