//! Decoded frames and camera descriptors.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Stable index of a physical camera.
pub type CameraId = u32;

/// Bytes per pixel of the packed RGB24 layout every frame uses.
pub const BYTES_PER_PIXEL: usize = 3;

/// Identifies a physical camera and the settings requested for it.
///
/// A requested value of 0 means "use the device default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub id: CameraId,
    pub requested_fps: u32,
    pub requested_width: u32,
    pub requested_height: u32,
}

impl CameraDescriptor {
    /// A descriptor that accepts whatever the device offers.
    pub fn device_default(id: CameraId) -> Self {
        Self {
            id,
            requested_fps: 0,
            requested_width: 0,
            requested_height: 0,
        }
    }

    pub fn with_request(mut self, fps: u32, width: u32, height: u32) -> Self {
        self.requested_fps = fps;
        self.requested_width = width;
        self.requested_height = height;
        self
    }
}

/// The settings a device actually delivers after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedSettings {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl NegotiatedSettings {
    /// FPS assumed when neither the request nor the device names one.
    pub const FALLBACK_FPS: u32 = 30;

    /// Resolve a device report against the request: a non-zero request wins
    /// for FPS (the encoder is fed at that rate), the device wins for size.
    pub fn resolve(requested: &CameraDescriptor, device_fps: Option<u32>, width: u32, height: u32) -> Self {
        let fps = if requested.requested_fps > 0 {
            requested.requested_fps
        } else {
            device_fps.filter(|f| *f > 0).unwrap_or(Self::FALLBACK_FPS)
        };
        Self { fps, width, height }
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Display for NegotiatedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} @ {} FPS", self.width, self.height, self.fps)
    }
}

/// One decoded image in packed RGB24.
///
/// Cloning is cheap: the pixel buffer is shared, so handing a frame to the
/// preview slot never copies pixels.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Local>,
    /// Per-worker capture counter, starting at 0.
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        pixels: impl Into<Arc<[u8]>>,
        width: u32,
        height: u32,
        captured_at: DateTime<Local>,
        sequence: u64,
    ) -> Self {
        Self {
            pixels: pixels.into(),
            width,
            height,
            captured_at,
            sequence,
        }
    }

    /// Whether the buffer length matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.pixels.len() == self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .field("captured_at", &self.captured_at)
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_prefers_requested_fps() {
        let requested = CameraDescriptor::device_default(0).with_request(10, 640, 480);
        let settings = NegotiatedSettings::resolve(&requested, Some(25), 1280, 720);
        assert_eq!(settings.fps, 10);
        assert_eq!((settings.width, settings.height), (1280, 720));
    }

    #[test]
    fn negotiation_falls_back_to_thirty_fps() {
        let requested = CameraDescriptor::device_default(0);
        assert_eq!(NegotiatedSettings::resolve(&requested, None, 640, 480).fps, 30);
        assert_eq!(NegotiatedSettings::resolve(&requested, Some(0), 640, 480).fps, 30);
        assert_eq!(NegotiatedSettings::resolve(&requested, Some(15), 640, 480).fps, 15);
    }

    #[test]
    fn frame_clone_shares_pixels() {
        let frame = Frame::new(vec![0u8; 12], 2, 2, Local::now(), 0);
        let copy = frame.clone();
        assert!(Arc::ptr_eq(&frame.pixels, &copy.pixels));
        assert!(frame.is_well_formed());
    }
}
