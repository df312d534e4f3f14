//! GStreamer-backed camera capture and segment encoding.
//!
//! Capture: `<camera source> ! videoconvert ! videoscale ! videorate ! RGB caps ! appsink`
//! Encoding: `appsrc (RGB) ! videoconvert ! x264enc ! h264parse ! mp4mux ! filesink`

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use camrec_common::clock::{frame_interval, Clock};
use camrec_common::error::{CamrecError, CamrecResult};
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;

use crate::device::{CaptureDevice, CaptureDeviceFactory};
use crate::frame::{CameraDescriptor, CameraId, Frame, NegotiatedSettings, BYTES_PER_PIXEL};
use crate::segment::Segment;
use crate::writer::{create_segment_file, SegmentSink, SegmentSinkFactory};

/// Shortest time `open` waits for the first frame, whatever the read timeout.
const MIN_OPEN_WAIT: Duration = Duration::from_secs(5);

/// How long closing a segment waits for the muxer to write its trailer.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn init_gstreamer() -> CamrecResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let init_res = GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string()));
    match init_res {
        Ok(()) => Ok(()),
        Err(e) => Err(CamrecError::config(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}

#[cfg(target_os = "linux")]
const SOURCE_ELEMENT: &str = "v4l2src";
#[cfg(target_os = "windows")]
const SOURCE_ELEMENT: &str = "ksvideosrc";
#[cfg(target_os = "macos")]
const SOURCE_ELEMENT: &str = "avfvideosrc";
#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
const SOURCE_ELEMENT: &str = "autovideosrc";

/// Elements the capture and encoding pipelines are built from.
pub const REQUIRED_ELEMENTS: &[&str] = &[
    SOURCE_ELEMENT,
    "videoconvert",
    "videoscale",
    "videorate",
    "appsink",
    "appsrc",
    "x264enc",
    "h264parse",
    "mp4mux",
    "filesink",
];

/// Initialize GStreamer and report which required elements are installed.
pub fn check_elements() -> CamrecResult<Vec<(&'static str, bool)>> {
    init_gstreamer()?;
    Ok(REQUIRED_ELEMENTS
        .iter()
        .map(|name| (*name, gst::ElementFactory::find(name).is_some()))
        .collect())
}

fn clock_time(duration: Duration) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(duration.as_nanos() as u64)
}

/// Platform camera source element for device `index`.
fn source_fragment(index: u32) -> String {
    #[cfg(target_os = "linux")]
    {
        format!("v4l2src device=/dev/video{index} do-timestamp=true")
    }
    #[cfg(target_os = "windows")]
    {
        format!("ksvideosrc device-index={index} do-stats=true")
    }
    #[cfg(target_os = "macos")]
    {
        format!("avfvideosrc device-index={index}")
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        let _ = index;
        "autovideosrc".to_string()
    }
}

/// Caps string pinning RGB output and any non-zero requested values.
fn capture_caps(descriptor: &CameraDescriptor) -> String {
    let mut caps = String::from("video/x-raw,format=RGB");
    if descriptor.requested_width > 0 {
        caps.push_str(&format!(",width={}", descriptor.requested_width));
    }
    if descriptor.requested_height > 0 {
        caps.push_str(&format!(",height={}", descriptor.requested_height));
    }
    if descriptor.requested_fps > 0 {
        caps.push_str(&format!(",framerate={}/1", descriptor.requested_fps));
    }
    caps
}

fn capture_launch(descriptor: &CameraDescriptor) -> String {
    // The appsink keeps at most two decoded frames; if the worker falls behind,
    // older frames are dropped at the source instead of queueing in memory.
    format!(
        "{} ! videoconvert ! videoscale ! videorate ! {} ! appsink name=sink max-buffers=2 drop=true sync=false",
        source_fragment(descriptor.id),
        capture_caps(descriptor)
    )
}

/// Pop a pending error message off the bus without waiting.
fn pending_bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(match err.debug() {
            Some(debug) => format!("{} ({debug})", err.error()),
            None => err.error().to_string(),
        }),
        _ => None,
    }
}

/// Copy tightly packed RGB rows out of a buffer that may carry row padding.
fn unpad_rows(data: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let row = width as usize * BYTES_PER_PIXEL;
    let height = height as usize;
    if height == 0 || data.len() < row * height {
        return None;
    }
    let stride = data.len() / height;
    if stride == row {
        return Some(data[..row * height].to_vec());
    }
    let mut packed = Vec::with_capacity(row * height);
    for y in 0..height {
        packed.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    Some(packed)
}

/// Pad packed RGB rows to the 4-byte stride GStreamer expects for raw video.
fn pad_rows(pixels: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let row = width as usize * BYTES_PER_PIXEL;
    let stride = (row + 3) & !3;
    if stride == row {
        return None;
    }
    let mut padded = vec![0u8; stride * height as usize];
    for (y, chunk) in pixels.chunks_exact(row).enumerate() {
        padded[y * stride..y * stride + row].copy_from_slice(chunk);
    }
    Some(padded)
}

fn settings_from_caps(
    descriptor: &CameraDescriptor,
    caps: &gst::CapsRef,
) -> CamrecResult<NegotiatedSettings> {
    let structure = caps
        .structure(0)
        .ok_or_else(|| CamrecError::device_unavailable(descriptor.id, "camera produced empty caps"))?;
    let width = structure.get::<i32>("width").unwrap_or(0).max(0) as u32;
    let height = structure.get::<i32>("height").unwrap_or(0).max(0) as u32;
    if width == 0 || height == 0 {
        return Err(CamrecError::device_unavailable(
            descriptor.id,
            "camera did not report a frame size",
        ));
    }
    let device_fps = structure.get::<gst::Fraction>("framerate").ok().and_then(|f| {
        let denom = f.denom();
        (denom > 0 && f.numer() > 0).then(|| (f.numer() as f64 / denom as f64).round() as u32)
    });
    Ok(NegotiatedSettings::resolve(descriptor, device_fps, width, height))
}

/// Opens cameras through the platform's GStreamer source element.
pub struct GstDeviceFactory {
    clock: Arc<dyn Clock>,
}

impl GstDeviceFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl CaptureDeviceFactory for GstDeviceFactory {
    fn open(
        &self,
        descriptor: &CameraDescriptor,
        read_timeout: Duration,
    ) -> CamrecResult<Box<dyn CaptureDevice>> {
        Ok(Box::new(GstCaptureDevice::open(
            descriptor,
            read_timeout,
            Arc::clone(&self.clock),
        )?))
    }
}

/// A camera read through an appsink.
pub struct GstCaptureDevice {
    camera_id: CameraId,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    negotiated: NegotiatedSettings,
    read_timeout: Duration,
    clock: Arc<dyn Clock>,
    pending: Option<gst::Sample>,
    closed: bool,
}

impl GstCaptureDevice {
    pub fn open(
        descriptor: &CameraDescriptor,
        read_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> CamrecResult<Self> {
        init_gstreamer()?;
        let camera_id = descriptor.id;
        let unavailable = |msg: String| CamrecError::device_unavailable(camera_id, msg);

        let launch = capture_launch(descriptor);
        tracing::debug!(camera_id, %launch, "Building capture pipeline");
        let pipeline = gst::parse::launch(&launch)
            .map_err(|e| unavailable(format!("failed to build pipeline: {e}")))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| unavailable("launch string did not produce a pipeline".to_string()))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.dynamic_cast::<gst_app::AppSink>().ok())
            .ok_or_else(|| unavailable("capture pipeline has no appsink".to_string()))?;

        let mut device = Self {
            camera_id,
            pipeline,
            appsink,
            negotiated: NegotiatedSettings {
                fps: 0,
                width: 0,
                height: 0,
            },
            read_timeout,
            clock,
            pending: None,
            closed: false,
        };

        if let Err(e) = device.pipeline.set_state(gst::State::Playing) {
            let reason = pending_bus_error(&device.pipeline).unwrap_or_else(|| format!("{e:?}"));
            let _ = device.close();
            return Err(unavailable(reason));
        }

        // The first sample carries the caps the device actually agreed to.
        let wait = read_timeout.max(MIN_OPEN_WAIT);
        let Some(sample) = device.appsink.try_pull_sample(clock_time(wait)) else {
            let reason = pending_bus_error(&device.pipeline)
                .unwrap_or_else(|| format!("no frame within {wait:?}"));
            let _ = device.close();
            return Err(unavailable(reason));
        };
        let negotiated = match sample.caps() {
            Some(caps) => settings_from_caps(descriptor, caps),
            None => Err(unavailable("first frame carried no caps".to_string())),
        };
        match negotiated {
            Ok(negotiated) => device.negotiated = negotiated,
            Err(e) => {
                let _ = device.close();
                return Err(e);
            }
        }
        device.pending = Some(sample);
        Ok(device)
    }

    fn frame_from_sample(&self, sample: &gst::Sample) -> CamrecResult<Frame> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| CamrecError::disconnected(self.camera_id, "sample without buffer"))?;
        let map = buffer
            .map_readable()
            .map_err(|e| CamrecError::disconnected(self.camera_id, format!("unreadable buffer: {e}")))?;
        let pixels = unpad_rows(map.as_slice(), self.negotiated.width, self.negotiated.height)
            .ok_or_else(|| {
                CamrecError::disconnected(
                    self.camera_id,
                    format!(
                        "buffer of {} bytes too small for {}",
                        map.size(),
                        self.negotiated
                    ),
                )
            })?;
        Ok(Frame::new(
            pixels,
            self.negotiated.width,
            self.negotiated.height,
            self.clock.now(),
            0,
        ))
    }
}

impl CaptureDevice for GstCaptureDevice {
    fn negotiated(&self) -> NegotiatedSettings {
        self.negotiated
    }

    fn read_frame(&mut self) -> CamrecResult<Frame> {
        if self.closed {
            return Err(CamrecError::disconnected(self.camera_id, "device closed"));
        }
        if let Some(sample) = self.pending.take() {
            return self.frame_from_sample(&sample);
        }

        match self.appsink.try_pull_sample(clock_time(self.read_timeout)) {
            Some(sample) => self.frame_from_sample(&sample),
            None => {
                if let Some(reason) = pending_bus_error(&self.pipeline) {
                    Err(CamrecError::disconnected(self.camera_id, reason))
                } else if self.appsink.is_eos() {
                    Err(CamrecError::disconnected(self.camera_id, "end of stream"))
                } else {
                    Err(CamrecError::ReadTimeout {
                        camera_id: self.camera_id,
                        timeout: self.read_timeout,
                    })
                }
            }
        }
    }

    fn close(&mut self) -> CamrecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending = None;
        self.pipeline.set_state(gst::State::Null).map_err(|e| {
            CamrecError::disconnected(
                self.camera_id,
                format!("failed to release capture pipeline: {e:?}"),
            )
        })?;
        Ok(())
    }
}

impl Drop for GstCaptureDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Encodes segments to H.264 in MP4.
#[derive(Debug, Clone)]
pub struct GstSinkFactory {
    pub speed_preset: String,
    pub bitrate_kbps: u32,
    pub drain_timeout: Duration,
}

impl Default for GstSinkFactory {
    fn default() -> Self {
        Self {
            speed_preset: "veryfast".to_string(),
            bitrate_kbps: 2500,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl SegmentSinkFactory for GstSinkFactory {
    fn create(
        &self,
        segment: &Segment,
        settings: &NegotiatedSettings,
    ) -> CamrecResult<Box<dyn SegmentSink>> {
        Ok(Box::new(GstSegmentSink::create(&segment.path, settings, self)?))
    }
}

/// One MP4 file fed through an appsrc.
pub struct GstSegmentSink {
    path: PathBuf,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    settings: NegotiatedSettings,
    frame_duration: gst::ClockTime,
    frames_pushed: u64,
    drain_timeout: Duration,
    closed: bool,
}

impl GstSegmentSink {
    pub fn create(
        path: &Path,
        settings: &NegotiatedSettings,
        factory: &GstSinkFactory,
    ) -> CamrecResult<Self> {
        init_gstreamer()?;

        // Surface permission, disk-space and name-collision problems as file
        // system errors before the encoder is involved.
        create_segment_file(path)?;

        let location = path.to_string_lossy().replace('"', "\\\"");
        let keyint = settings.fps.saturating_mul(2).max(2);
        let launch = format!(
            "appsrc name=src ! videoconvert ! x264enc tune=zerolatency speed-preset={} bitrate={} key-int-max={keyint} ! h264parse ! mp4mux ! filesink location=\"{location}\"",
            factory.speed_preset, factory.bitrate_kbps
        );
        let pipeline = gst::parse::launch(&launch)
            .map_err(|e| CamrecError::file_system(path, format!("failed to build encoder: {e}")))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| CamrecError::file_system(path, "launch string did not produce a pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.dynamic_cast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| CamrecError::file_system(path, "encoder pipeline has no appsrc"))?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", settings.width as i32)
            .field("height", settings.height as i32)
            .field("framerate", gst::Fraction::new(settings.fps as i32, 1))
            .build();
        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);
        appsrc.set_is_live(true);

        pipeline.set_state(gst::State::Playing).map_err(|e| {
            let reason = pending_bus_error(&pipeline).unwrap_or_else(|| format!("{e:?}"));
            let _ = pipeline.set_state(gst::State::Null);
            CamrecError::file_system(path, reason)
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            pipeline,
            appsrc,
            settings: *settings,
            frame_duration: clock_time(frame_interval(settings.fps)),
            frames_pushed: 0,
            drain_timeout: factory.drain_timeout,
            closed: false,
        })
    }

    /// Wait for EOS to reach the filesink so the MP4 trailer is written.
    fn drain(&self) -> Result<(), String> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= self.drain_timeout {
                return Err(format!("EOS drain timed out after {:?}", self.drain_timeout));
            }
            match bus.timed_pop(clock_time(self.drain_timeout - elapsed)) {
                Some(msg) => match msg.view() {
                    gst::MessageView::Eos(_) => return Ok(()),
                    gst::MessageView::Error(e) => return Err(e.error().to_string()),
                    _ => {}
                },
                None => {
                    return Err(format!("EOS drain timed out after {:?}", self.drain_timeout))
                }
            }
        }
    }
}

impl SegmentSink for GstSegmentSink {
    fn write(&mut self, frame: &Frame) -> CamrecResult<()> {
        if self.closed {
            return Err(CamrecError::write(&self.path, "segment already closed"));
        }
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(CamrecError::write(
                &self.path,
                format!(
                    "frame is {}x{} but segment was opened for {}",
                    frame.width, frame.height, self.settings
                ),
            ));
        }
        if let Some(reason) = pending_bus_error(&self.pipeline) {
            return Err(CamrecError::write(&self.path, reason));
        }

        let mut buffer = match pad_rows(&frame.pixels, frame.width, frame.height) {
            Some(padded) => gst::Buffer::from_slice(padded),
            None => gst::Buffer::from_slice(Arc::clone(&frame.pixels)),
        };
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(self.frame_duration * self.frames_pushed);
            buffer_ref.set_duration(self.frame_duration);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| CamrecError::write(&self.path, format!("push failed: {e:?}")))?;
        self.frames_pushed += 1;
        Ok(())
    }

    fn close(&mut self) -> CamrecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.appsrc.end_of_stream() {
            tracing::warn!(path = %self.path.display(), ?e, "Failed to send EOS; segment may be truncated");
        }
        let drained = self.drain();
        let _ = self.pipeline.set_state(gst::State::Null);

        drained.map_err(|reason| CamrecError::write(&self.path, reason))?;
        tracing::debug!(path = %self.path.display(), frames = self.frames_pushed, "Segment finalized");
        Ok(())
    }

    fn abandon(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for GstSegmentSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
