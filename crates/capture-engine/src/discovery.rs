//! One-shot camera enumeration.
//!
//! Probing is done by opening each index in turn; whatever opens is a camera.
//! On Linux the V4L2 sysfs entries add a human-readable name and a score
//! for how webcam-like the device looks.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::device::CaptureDeviceFactory;
use crate::frame::{CameraDescriptor, CameraId, NegotiatedSettings};

/// Probe indices `0..probe_count` and return the cameras that opened.
pub fn list_available_cameras(
    factory: &dyn CaptureDeviceFactory,
    probe_count: u32,
    read_timeout: Duration,
) -> Vec<CameraDescriptor> {
    probe_cameras(factory, probe_count, read_timeout)
        .into_iter()
        .map(|(descriptor, _)| descriptor)
        .collect()
}

/// Like [`list_available_cameras`], also returning what each device negotiated.
pub fn probe_cameras(
    factory: &dyn CaptureDeviceFactory,
    probe_count: u32,
    read_timeout: Duration,
) -> Vec<(CameraDescriptor, NegotiatedSettings)> {
    let mut found = Vec::new();
    for id in 0..probe_count {
        let descriptor = CameraDescriptor::device_default(id);
        match factory.open(&descriptor, read_timeout) {
            Ok(mut device) => {
                let negotiated = device.negotiated();
                if let Err(e) = device.close() {
                    tracing::debug!(camera_id = id, error = %e, "Probe close failed");
                }
                tracing::debug!(camera_id = id, %negotiated, "Camera found");
                found.push((descriptor, negotiated));
            }
            Err(e) => tracing::trace!(camera_id = id, error = %e, "No camera at index"),
        }
    }
    tracing::info!(count = found.len(), "Camera probe finished");
    found
}

/// Display information about a camera index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraInfo {
    pub id: CameraId,
    pub device_path: Option<PathBuf>,
    pub name: Option<String>,
    /// Higher is more webcam-like; 0 means almost certainly not a webcam.
    pub webcam_score: u32,
}

/// Describe `id` from the platform's device metadata.
pub fn describe_camera(id: CameraId) -> CameraInfo {
    #[cfg(target_os = "linux")]
    {
        let dev_path = PathBuf::from(format!("/dev/video{id}"));
        let name = std::fs::read_to_string(format!("/sys/class/video4linux/video{id}/name"))
            .ok()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        let webcam_score = name
            .as_deref()
            .map(|n| webcam_score(n, probe_v4l2_capture(&dev_path)))
            .unwrap_or(0);
        CameraInfo {
            id,
            device_path: dev_path.exists().then_some(dev_path),
            name,
            webcam_score,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        CameraInfo {
            id,
            device_path: None,
            name: None,
            webcam_score: 0,
        }
    }
}

const WEBCAM_KEYWORDS: &[&str] = &[
    "webcam",
    "camera",
    "cam",
    "facetime",
    "logitech",
    "microsoft",
    "creative",
    "razer",
    "elgato",
    "obs",
    "virtual",
    "v4l2loopback",
];

const NON_WEBCAM_KEYWORDS: &[&str] = &[
    "tuner",
    "tv",
    "dvb",
    "hdmi",
    "encoder",
    "decoder",
    "hauppauge",
    "blackmagic",
    "magewell",
    "metadata",
];

/// Score a device name as a webcam candidate.
///
/// `supports_capture` is what `v4l2-ctl` reported, or `None` when it is not
/// installed.
pub fn webcam_score(name: &str, supports_capture: Option<bool>) -> u32 {
    let name = name.to_lowercase();
    if NON_WEBCAM_KEYWORDS.iter().any(|kw| name.contains(kw)) {
        return 0;
    }
    let named_webcam = WEBCAM_KEYWORDS.iter().any(|kw| name.contains(kw));
    match (named_webcam, supports_capture) {
        (true, Some(true)) => 100,
        (true, _) => 80,
        (false, Some(true)) => 50,
        (false, Some(false)) => 0,
        (false, None) => 10,
    }
}

/// Ask `v4l2-ctl` whether a node reports Video Capture.
#[cfg(target_os = "linux")]
fn probe_v4l2_capture(dev_path: &std::path::Path) -> Option<bool> {
    let output = std::process::Command::new("v4l2-ctl")
        .arg("--device")
        .arg(dev_path)
        .arg("--info")
        .output()
        .ok()?;
    if !output.status.success() {
        return Some(false);
    }
    Some(
        String::from_utf8_lossy(&output.stdout)
            .to_lowercase()
            .contains("video capture"),
    )
}
