//! Synthetic cameras and a plain-text segment sink.
//!
//! Used for hardware-free runs (`camrec record --synthetic`) and by the
//! engine's tests. Synthetic frames are timestamped at
//! `open time + sequence * frame interval`, so with a manual clock every
//! timestamp is deterministic. Faults (open failure, disconnect, stall, hang,
//! panic) can be scripted per camera.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camrec_common::clock::{frame_interval, Clock};
use camrec_common::error::{CamrecError, CamrecResult};
use chrono::{DateTime, FixedOffset, Local};

use crate::device::{CaptureDevice, CaptureDeviceFactory};
use crate::frame::{CameraDescriptor, CameraId, Frame, NegotiatedSettings, BYTES_PER_PIXEL};
use crate::segment::Segment;
use crate::writer::{create_segment_file, SegmentSink, SegmentSinkFactory};

/// What synthetic frames look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyntheticPattern {
    /// Horizontal/vertical gradient with a blue channel that moves per frame.
    #[default]
    Gradient,
    /// Every pixel the same color.
    Solid([u8; 3]),
}

impl SyntheticPattern {
    fn render(&self, width: u32, height: u32, sequence: u64) -> Vec<u8> {
        let (w, h) = (width as usize, height as usize);
        let mut pixels = Vec::with_capacity(w * h * BYTES_PER_PIXEL);
        match *self {
            Self::Solid(rgb) => {
                for _ in 0..w * h {
                    pixels.extend_from_slice(&rgb);
                }
            }
            Self::Gradient => {
                let blue = (sequence.wrapping_mul(8) % 256) as u8;
                for y in 0..h {
                    let green = (y * 255 / h.max(1)) as u8;
                    for x in 0..w {
                        let red = (x * 255 / w.max(1)) as u8;
                        pixels.extend_from_slice(&[red, green, blue]);
                    }
                }
            }
        }
        pixels
    }
}

/// Scripted faults for one synthetic camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Script {
    unavailable: bool,
    disconnect_after: Option<u64>,
    idle_after: Option<u64>,
    hang_after: Option<u64>,
    panic_after: Option<u64>,
}

/// Open/close bookkeeping shared by a factory and the devices it opened.
#[derive(Debug, Default)]
pub struct SyntheticStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    hung: AtomicUsize,
    released: AtomicBool,
}

impl SyntheticStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cameras currently or previously stuck in a scripted hang.
    pub fn hung(&self) -> usize {
        self.hung.load(Ordering::SeqCst)
    }

    /// Let cameras stuck in a scripted hang return.
    pub fn release_hangs(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Opens synthetic cameras.
pub struct SyntheticCameraFactory {
    clock: Arc<dyn Clock>,
    realtime: bool,
    pattern: SyntheticPattern,
    native: NegotiatedSettings,
    scripts: HashMap<CameraId, Script>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticCameraFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            realtime: false,
            pattern: SyntheticPattern::default(),
            native: NegotiatedSettings {
                fps: 30,
                width: 64,
                height: 48,
            },
            scripts: HashMap::new(),
            stats: Arc::new(SyntheticStats::default()),
        }
    }

    /// Pace reads at the negotiated frame rate instead of returning at once.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn pattern(mut self, pattern: SyntheticPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// What the camera offers when the request leaves a value at 0.
    pub fn settings(mut self, fps: u32, width: u32, height: u32) -> Self {
        self.native = NegotiatedSettings { fps, width, height };
        self
    }

    /// Opening `camera` fails with `DeviceUnavailable`.
    pub fn unavailable(mut self, camera: CameraId) -> Self {
        self.scripts.entry(camera).or_default().unavailable = true;
        self
    }

    /// After `frames` frames the camera reports a disconnect.
    pub fn disconnect_after(mut self, camera: CameraId, frames: u64) -> Self {
        self.scripts.entry(camera).or_default().disconnect_after = Some(frames);
        self
    }

    /// After `frames` frames every read waits out the timeout and fails.
    pub fn idle_after(mut self, camera: CameraId, frames: u64) -> Self {
        self.scripts.entry(camera).or_default().idle_after = Some(frames);
        self
    }

    /// After `frames` frames the next read blocks until [`SyntheticStats::release_hangs`].
    pub fn hang_after(mut self, camera: CameraId, frames: u64) -> Self {
        self.scripts.entry(camera).or_default().hang_after = Some(frames);
        self
    }

    /// After `frames` frames the next read panics.
    pub fn panic_after(mut self, camera: CameraId, frames: u64) -> Self {
        self.scripts.entry(camera).or_default().panic_after = Some(frames);
        self
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        Arc::clone(&self.stats)
    }
}

impl CaptureDeviceFactory for SyntheticCameraFactory {
    fn open(
        &self,
        descriptor: &CameraDescriptor,
        read_timeout: Duration,
    ) -> CamrecResult<Box<dyn CaptureDevice>> {
        let script = self.scripts.get(&descriptor.id).copied().unwrap_or_default();
        if script.unavailable {
            return Err(CamrecError::device_unavailable(
                descriptor.id,
                "synthetic camera scripted as unavailable",
            ));
        }

        let pick = |requested: u32, native: u32| if requested > 0 { requested } else { native };
        let negotiated = NegotiatedSettings::resolve(
            descriptor,
            Some(self.native.fps),
            pick(descriptor.requested_width, self.native.width),
            pick(descriptor.requested_height, self.native.height),
        );

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticCamera {
            camera_id: descriptor.id,
            negotiated,
            pattern: self.pattern,
            script,
            read_timeout,
            interval: frame_interval(negotiated.fps),
            started_at: self.clock.now(),
            started: Instant::now(),
            realtime: self.realtime,
            produced: 0,
            closed: false,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct SyntheticCamera {
    camera_id: CameraId,
    negotiated: NegotiatedSettings,
    pattern: SyntheticPattern,
    script: Script,
    read_timeout: Duration,
    interval: Duration,
    started_at: DateTime<Local>,
    started: Instant,
    realtime: bool,
    produced: u64,
    closed: bool,
    stats: Arc<SyntheticStats>,
}

impl SyntheticCamera {
    fn reached(limit: Option<u64>, produced: u64) -> bool {
        limit.is_some_and(|n| produced >= n)
    }
}

impl CaptureDevice for SyntheticCamera {
    fn negotiated(&self) -> NegotiatedSettings {
        self.negotiated
    }

    fn read_frame(&mut self) -> CamrecResult<Frame> {
        if self.closed {
            return Err(CamrecError::disconnected(self.camera_id, "device closed"));
        }
        if Self::reached(self.script.panic_after, self.produced) {
            panic!("synthetic camera {} fault injected", self.camera_id);
        }
        if Self::reached(self.script.hang_after, self.produced) {
            self.stats.hung.fetch_add(1, Ordering::SeqCst);
            while !self.stats.released.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(20));
            }
            return Err(CamrecError::disconnected(self.camera_id, "released from hang"));
        }
        if Self::reached(self.script.disconnect_after, self.produced) {
            return Err(CamrecError::disconnected(
                self.camera_id,
                "synthetic camera unplugged",
            ));
        }
        if Self::reached(self.script.idle_after, self.produced) {
            thread::sleep(self.read_timeout);
            return Err(CamrecError::ReadTimeout {
                camera_id: self.camera_id,
                timeout: self.read_timeout,
            });
        }

        let offset = self.interval * self.produced as u32;
        if self.realtime {
            let due = self.started + offset;
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        let captured_at = self.started_at
            + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
        let pixels = self
            .pattern
            .render(self.negotiated.width, self.negotiated.height, self.produced);
        self.produced += 1;
        Ok(Frame::new(
            pixels,
            self.negotiated.width,
            self.negotiated.height,
            captured_at,
            0,
        ))
    }

    fn close(&mut self) -> CamrecResult<()> {
        if !self.closed {
            self.closed = true;
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Marker line written when a ledger segment is finalized.
pub const LEDGER_CLOSED_MARKER: &str = "# closed";

/// Writes each segment as a text ledger: one `"<sequence> <rfc3339>"` line
/// per frame, then [`LEDGER_CLOSED_MARKER`] on close.
#[derive(Debug, Default)]
pub struct LedgerSinkFactory {
    fail_after: Option<u64>,
    written: Arc<AtomicU64>,
}

impl LedgerSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write after `frames` frames in total have been written.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

impl SegmentSinkFactory for LedgerSinkFactory {
    fn create(
        &self,
        segment: &Segment,
        settings: &NegotiatedSettings,
    ) -> CamrecResult<Box<dyn SegmentSink>> {
        let file = create_segment_file(&segment.path)?;
        let mut out = BufWriter::new(file);
        writeln!(
            out,
            "# camera {} segment {} {}",
            segment.camera_id, segment.segment_index, settings
        )
        .and_then(|_| out.flush())
        .map_err(|e| CamrecError::file_system(&segment.path, e.to_string()))?;
        Ok(Box::new(LedgerSink {
            path: segment.path.clone(),
            out: Some(out),
            fail_after: self.fail_after,
            written: Arc::clone(&self.written),
        }))
    }
}

struct LedgerSink {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    fail_after: Option<u64>,
    written: Arc<AtomicU64>,
}

impl SegmentSink for LedgerSink {
    fn write(&mut self, frame: &Frame) -> CamrecResult<()> {
        let Some(out) = self.out.as_mut() else {
            return Err(CamrecError::write(&self.path, "segment already closed"));
        };
        if let Some(limit) = self.fail_after {
            if self.written.load(Ordering::SeqCst) >= limit {
                return Err(CamrecError::write(&self.path, "scripted write failure"));
            }
        }
        writeln!(out, "{} {}", frame.sequence, frame.captured_at.to_rfc3339())
            .and_then(|_| out.flush())
            .map_err(|e| CamrecError::write(&self.path, e.to_string()))?;
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> CamrecResult<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        writeln!(out, "{LEDGER_CLOSED_MARKER}")
            .and_then(|_| out.flush())
            .map_err(|e| CamrecError::write(&self.path, e.to_string()))
    }

    fn abandon(&mut self) {
        self.out = None;
    }
}

/// A parsed ledger file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    pub frames: Vec<(u64, DateTime<FixedOffset>)>,
    pub closed: bool,
}

impl Ledger {
    pub fn sequences(&self) -> Vec<u64> {
        self.frames.iter().map(|(seq, _)| *seq).collect()
    }
}

pub fn read_ledger(path: &Path) -> CamrecResult<Ledger> {
    let file = File::open(path).map_err(|e| CamrecError::file_system(path, e.to_string()))?;
    let mut ledger = Ledger {
        frames: Vec::new(),
        closed: false,
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line == LEDGER_CLOSED_MARKER {
            ledger.closed = true;
            continue;
        }
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let (seq, ts) = line
            .split_once(' ')
            .ok_or_else(|| CamrecError::file_system(path, format!("malformed line: {line}")))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|e| CamrecError::file_system(path, format!("bad sequence {seq:?}: {e}")))?;
        let ts = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| CamrecError::file_system(path, format!("bad timestamp {ts:?}: {e}")))?;
        ledger.frames.push((seq, ts));
    }
    Ok(ledger)
}

#[cfg(test)]
mod tests {
    use camrec_common::clock::ManualClock;
    use chrono::TimeZone;

    use super::*;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Local.with_ymd_and_hms(2025, 1, 21, 12, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn frames_are_spaced_by_frame_interval() {
        let factory = SyntheticCameraFactory::new(clock()).settings(10, 4, 2);
        let mut cam = factory
            .open(&CameraDescriptor::device_default(0), Duration::from_millis(5))
            .unwrap();
        let a = cam.read_frame().unwrap();
        let b = cam.read_frame().unwrap();
        assert_eq!((b.captured_at - a.captured_at).num_milliseconds(), 100);
        assert!(a.is_well_formed());
        assert_eq!(a.pixels.len(), 4 * 2 * 3);
    }

    #[test]
    fn requested_values_override_native_settings() {
        let factory = SyntheticCameraFactory::new(clock()).settings(30, 64, 48);
        let cam = factory
            .open(
                &CameraDescriptor::device_default(0).with_request(5, 16, 0),
                Duration::from_millis(5),
            )
            .unwrap();
        assert_eq!(
            cam.negotiated(),
            NegotiatedSettings {
                fps: 5,
                width: 16,
                height: 48
            }
        );
    }

    #[test]
    fn scripted_faults_fire_in_order() {
        let factory = SyntheticCameraFactory::new(clock())
            .unavailable(1)
            .disconnect_after(2, 1)
            .idle_after(3, 0);
        assert!(matches!(
            factory
                .open(&CameraDescriptor::device_default(1), Duration::from_millis(1))
                .err()
                .unwrap(),
            CamrecError::DeviceUnavailable { camera_id: 1, .. }
        ));

        let mut two = factory
            .open(&CameraDescriptor::device_default(2), Duration::from_millis(1))
            .unwrap();
        assert!(two.read_frame().is_ok());
        assert!(matches!(
            two.read_frame().unwrap_err(),
            CamrecError::DeviceDisconnected { .. }
        ));

        let mut three = factory
            .open(&CameraDescriptor::device_default(3), Duration::from_millis(1))
            .unwrap();
        assert!(three.read_frame().unwrap_err().is_transient());

        two.close().unwrap();
        two.close().unwrap();
        assert_eq!(factory.stats().opened(), 2);
        assert_eq!(factory.stats().closed(), 1);
    }

    #[test]
    fn ledger_records_frames_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let start = Local.with_ymd_and_hms(2025, 1, 21, 12, 0, 0).unwrap();
        let segment = Segment::new(dir.path(), 0, 0, start);
        let settings = NegotiatedSettings {
            fps: 10,
            width: 1,
            height: 1,
        };
        let mut sink = LedgerSinkFactory::new().create(&segment, &settings).unwrap();
        sink.write(&Frame::new(vec![0u8; 3], 1, 1, start, 0)).unwrap();
        sink.write(&Frame::new(vec![0u8; 3], 1, 1, start, 1)).unwrap();

        let partial = read_ledger(&segment.path).unwrap();
        assert_eq!(partial.sequences(), vec![0, 1]);
        assert!(!partial.closed);

        sink.close().unwrap();
        sink.close().unwrap();
        let done = read_ledger(&segment.path).unwrap();
        assert!(done.closed);
        assert_eq!(done.frames[0].1, start.fixed_offset());
    }

    #[test]
    fn ledger_fail_after_limits_writes() {
        let dir = tempfile::tempdir().unwrap();
        let start = Local.with_ymd_and_hms(2025, 1, 21, 12, 0, 0).unwrap();
        let segment = Segment::new(dir.path(), 0, 0, start);
        let settings = NegotiatedSettings {
            fps: 10,
            width: 1,
            height: 1,
        };
        let mut sink = LedgerSinkFactory::new()
            .fail_after(1)
            .create(&segment, &settings)
            .unwrap();
        sink.write(&Frame::new(vec![0u8; 3], 1, 1, start, 0)).unwrap();
        assert!(matches!(
            sink.write(&Frame::new(vec![0u8; 3], 1, 1, start, 1)),
            Err(CamrecError::Write { .. })
        ));
    }

    #[test]
    fn existing_segment_file_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let start = Local.with_ymd_and_hms(2025, 1, 21, 12, 0, 0).unwrap();
        let segment = Segment::new(dir.path(), 0, 0, start);
        let settings = NegotiatedSettings {
            fps: 10,
            width: 1,
            height: 1,
        };
        let factory = LedgerSinkFactory::new();
        let mut first = factory.create(&segment, &settings).unwrap();
        first.write(&Frame::new(vec![0u8; 3], 1, 1, start, 0)).unwrap();
        first.close().unwrap();

        assert!(matches!(
            factory.create(&segment, &settings).err().unwrap(),
            CamrecError::FileSystem { .. }
        ));
        let kept = read_ledger(&segment.path).unwrap();
        assert_eq!(kept.sequences(), vec![0]);
        assert!(kept.closed);
    }
}
