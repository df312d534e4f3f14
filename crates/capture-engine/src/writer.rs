//! Time-chunked segment writing.
//!
//! [`SegmentWriter`] owns at most one open [`SegmentSink`] per camera and
//! decides when to rotate. Rotation is frame-aligned: the first frame whose
//! capture time is at least one chunk past the segment start closes the
//! current file, opens the next one at that frame's timestamp, and is written
//! into the new file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use camrec_common::clock::{frame_interval, DriftMeasurement};
use camrec_common::error::{CamrecError, CamrecResult};
use chrono::{DateTime, Local};

use crate::frame::{CameraId, Frame, NegotiatedSettings};
use crate::segment::Segment;

/// One open container file.
pub trait SegmentSink: Send {
    /// Append one frame, encoding it at the negotiated settings.
    fn write(&mut self, frame: &Frame) -> CamrecResult<()>;

    /// Finalize the file so it plays on its own. Safe to call twice.
    fn close(&mut self) -> CamrecResult<()>;

    /// Release the file without writing anything more to it.
    fn abandon(&mut self);
}

/// Creates the container file for a segment.
pub trait SegmentSinkFactory: Send + Sync {
    /// Fails with `FileSystem` when the file cannot be created.
    fn create(
        &self,
        segment: &Segment,
        settings: &NegotiatedSettings,
    ) -> CamrecResult<Box<dyn SegmentSink>>;
}

/// Create a segment file, refusing to replace one that already exists.
pub fn create_segment_file(path: &Path) -> CamrecResult<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => {
                CamrecError::file_system(path, "segment file already exists")
            }
            _ => CamrecError::file_system(path, e.to_string()),
        })
}

struct OpenSegment {
    segment: Segment,
    sink: Box<dyn SegmentSink>,
    frames: u64,
}

/// Writes one camera's frames into consecutive segments.
pub struct SegmentWriter {
    camera_id: CameraId,
    output_dir: PathBuf,
    chunk: Duration,
    settings: NegotiatedSettings,
    sinks: Arc<dyn SegmentSinkFactory>,
    current: Option<OpenSegment>,
    next_index: u64,
    frames_total: u64,
    segments_closed: u64,
}

impl SegmentWriter {
    pub fn new(
        camera_id: CameraId,
        output_dir: impl Into<PathBuf>,
        chunk: Duration,
        settings: NegotiatedSettings,
        sinks: Arc<dyn SegmentSinkFactory>,
    ) -> Self {
        Self {
            camera_id,
            output_dir: output_dir.into(),
            chunk,
            settings,
            sinks,
            current: None,
            next_index: 0,
            frames_total: 0,
            segments_closed: 0,
        }
    }

    /// Open the next segment starting at `timestamp`, closing the current one first.
    pub fn open(&mut self, timestamp: DateTime<Local>) -> CamrecResult<&Segment> {
        self.close()?;

        let segment = Segment::new(&self.output_dir, self.camera_id, self.next_index, timestamp);
        let sink = self.sinks.create(&segment, &self.settings)?;
        tracing::info!(
            camera_id = self.camera_id,
            segment_index = segment.segment_index,
            path = %segment.path.display(),
            settings = %self.settings,
            "Starting new segment"
        );

        self.next_index += 1;
        let open = self.current.insert(OpenSegment {
            segment,
            sink,
            frames: 0,
        });
        Ok(&open.segment)
    }

    /// Whether a frame captured at `at` belongs in a new segment.
    ///
    /// A frame stamped more than one frame interval before the segment start
    /// means the wall clock stepped backwards; the next segment re-anchors to
    /// the new time.
    pub fn rotation_due(&self, at: &DateTime<Local>) -> bool {
        let Some(open) = &self.current else {
            return false;
        };
        let start = open.segment.start_timestamp;
        if let Ok(elapsed) = (*at - start).to_std() {
            return elapsed >= self.chunk;
        }
        let behind = (start - *at).to_std().unwrap_or_default();
        if behind <= frame_interval(self.settings.fps) {
            return false;
        }
        tracing::warn!(
            camera_id = self.camera_id,
            segment_index = open.segment.segment_index,
            behind_ms = behind.as_millis() as u64,
            "Clock stepped backwards, starting a new segment"
        );
        true
    }

    /// Write `frame`, rotating first when the chunk boundary has passed.
    ///
    /// Returns the segment that was closed by rotation, if any.
    pub fn write(&mut self, frame: Frame) -> CamrecResult<Option<Segment>> {
        let mut rotated = None;
        if self.rotation_due(&frame.captured_at) {
            let previous = self.close()?;
            if let Some(previous) = &previous {
                self.log_boundary_drift(previous, &frame.captured_at);
            }
            self.open(frame.captured_at)?;
            rotated = previous;
        }

        let open = self
            .current
            .as_mut()
            .ok_or_else(|| CamrecError::session("no open segment to write to"))?;
        open.sink.write(&frame)?;
        open.frames += 1;
        self.frames_total += 1;
        Ok(rotated)
    }

    /// Finalize the open segment, if any. Later calls return `Ok(None)`.
    /// Drop the open segment without finalizing it.
    pub fn abandon(&mut self) -> Option<Segment> {
        let mut open = self.current.take()?;
        open.sink.abandon();
        tracing::warn!(
            camera_id = self.camera_id,
            segment_index = open.segment.segment_index,
            path = %open.segment.path.display(),
            "Segment abandoned unfinalized"
        );
        Some(open.segment)
    }

    pub fn close(&mut self) -> CamrecResult<Option<Segment>> {
        let Some(mut open) = self.current.take() else {
            return Ok(None);
        };
        let result = open.sink.close();
        self.segments_closed += 1;
        match result {
            Ok(()) => {
                tracing::debug!(
                    camera_id = self.camera_id,
                    segment_index = open.segment.segment_index,
                    frames = open.frames,
                    "Segment closed"
                );
                Ok(Some(open.segment))
            }
            Err(e) => {
                tracing::error!(
                    camera_id = self.camera_id,
                    segment_index = open.segment.segment_index,
                    path = %open.segment.path.display(),
                    error = %e,
                    "Segment failed to finalize"
                );
                Err(e)
            }
        }
    }

    pub fn current(&self) -> Option<&Segment> {
        self.current.as_ref().map(|o| &o.segment)
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|o| o.segment.path.as_path())
    }

    /// Frames written across all segments.
    pub fn frames_written(&self) -> u64 {
        self.frames_total
    }

    pub fn segments_closed(&self) -> u64 {
        self.segments_closed
    }

    pub fn settings(&self) -> NegotiatedSettings {
        self.settings
    }

    fn log_boundary_drift(&self, closed: &Segment, next_start: &DateTime<Local>) {
        let Ok(span) = (*next_start - closed.start_timestamp).to_std() else {
            return;
        };
        let drift = DriftMeasurement::between(self.chunk, span);
        let tolerance_ms = frame_interval(self.settings.fps).as_secs_f64() * 1000.0;
        if drift.exceeds_threshold_ms(tolerance_ms) {
            tracing::warn!(
                camera_id = self.camera_id,
                segment_index = closed.segment_index,
                drift_ms = drift.drift_ms(),
                "Segment boundary drifted more than one frame interval"
            );
        } else {
            tracing::debug!(
                camera_id = self.camera_id,
                segment_index = closed.segment_index,
                drift_ms = drift.drift_ms(),
                "Segment rotated"
            );
        }
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.current.is_some() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;

    #[derive(Default)]
    struct Journal {
        // (segment_index, event)
        events: Mutex<Vec<(u64, String)>>,
    }

    struct JournalSink {
        index: u64,
        journal: Arc<Journal>,
        closed: bool,
        fail_writes: bool,
    }

    impl SegmentSink for JournalSink {
        fn write(&mut self, frame: &Frame) -> CamrecResult<()> {
            assert!(!self.closed, "write after close");
            if self.fail_writes {
                return Err(CamrecError::write("/tmp/x.mp4", "disk full"));
            }
            self.journal
                .events
                .lock()
                .unwrap()
                .push((self.index, format!("frame {}", frame.sequence)));
            Ok(())
        }

        fn close(&mut self) -> CamrecResult<()> {
            if !self.closed {
                self.closed = true;
                self.journal
                    .events
                    .lock()
                    .unwrap()
                    .push((self.index, "close".to_string()));
            }
            Ok(())
        }

        fn abandon(&mut self) {
            self.closed = true;
        }
    }

    struct JournalFactory {
        journal: Arc<Journal>,
        fail_writes: bool,
    }

    impl SegmentSinkFactory for JournalFactory {
        fn create(
            &self,
            segment: &Segment,
            _settings: &NegotiatedSettings,
        ) -> CamrecResult<Box<dyn SegmentSink>> {
            self.journal
                .events
                .lock()
                .unwrap()
                .push((segment.segment_index, "open".to_string()));
            Ok(Box::new(JournalSink {
                index: segment.segment_index,
                journal: Arc::clone(&self.journal),
                closed: false,
                fail_writes: self.fail_writes,
            }))
        }
    }

    fn start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 1, 21, 12, 0, 0).unwrap()
    }

    fn writer(journal: &Arc<Journal>, chunk: Duration, fail_writes: bool) -> SegmentWriter {
        SegmentWriter::new(
            0,
            "/rec",
            chunk,
            NegotiatedSettings {
                fps: 10,
                width: 1,
                height: 1,
            },
            Arc::new(JournalFactory {
                journal: Arc::clone(journal),
                fail_writes,
            }),
        )
    }

    fn frame_at(sequence: u64, millis: i64) -> Frame {
        Frame::new(
            vec![0u8; 3],
            1,
            1,
            start() + chrono::Duration::milliseconds(millis),
            sequence,
        )
    }

    #[test]
    fn triggering_frame_lands_in_new_segment() {
        let journal = Arc::new(Journal::default());
        let mut writer = writer(&journal, Duration::from_secs(1), false);
        writer.open(start()).unwrap();

        assert!(writer.write(frame_at(0, 0)).unwrap().is_none());
        assert!(writer.write(frame_at(1, 900)).unwrap().is_none());
        let rotated = writer.write(frame_at(2, 1000)).unwrap().unwrap();
        assert_eq!(rotated.segment_index, 0);
        writer.close().unwrap();

        let events = journal.events.lock().unwrap().clone();
        let expected: Vec<(u64, String)> = vec![
            (0, "open".into()),
            (0, "frame 0".into()),
            (0, "frame 1".into()),
            (0, "close".into()),
            (1, "open".into()),
            (1, "frame 2".into()),
            (1, "close".into()),
        ];
        assert_eq!(events, expected);
        assert_eq!(writer.frames_written(), 3);
        assert_eq!(writer.segments_closed(), 2);
    }

    #[test]
    fn new_segment_starts_at_triggering_frame_time() {
        let journal = Arc::new(Journal::default());
        let mut writer = writer(&journal, Duration::from_secs(60), false);
        writer.open(start()).unwrap();
        writer.write(frame_at(0, 60_050)).unwrap();
        let current = writer.current().unwrap();
        assert_eq!(current.segment_index, 1);
        assert_eq!(
            current.path,
            PathBuf::from("/rec/camera_0_segment1_20250121_120100.mp4")
        );
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_writes() {
        let journal = Arc::new(Journal::default());
        let mut writer = writer(&journal, Duration::from_secs(60), false);
        writer.open(start()).unwrap();
        assert_eq!(writer.close().unwrap().map(|s| s.segment_index), Some(0));
        assert!(writer.close().unwrap().is_none());
        assert!(writer.write(frame_at(0, 0)).is_err());
    }

    #[test]
    fn write_failure_surfaces_to_caller() {
        let journal = Arc::new(Journal::default());
        let mut writer = writer(&journal, Duration::from_secs(60), true);
        writer.open(start()).unwrap();
        let err = writer.write(frame_at(0, 0)).unwrap_err();
        assert!(matches!(err, CamrecError::Write { .. }));
        assert_eq!(writer.frames_written(), 0);
    }

    #[test]
    fn indices_continue_across_explicit_reopen() {
        let journal = Arc::new(Journal::default());
        let mut writer = writer(&journal, Duration::from_secs(60), false);
        assert_eq!(writer.open(start()).unwrap().segment_index, 0);
        assert_eq!(writer.open(start()).unwrap().segment_index, 1);
        assert_eq!(writer.segments_closed(), 1);
    }

    #[test]
    fn clock_stepping_backwards_starts_a_new_segment() {
        let journal = Arc::new(Journal::default());
        let mut writer = writer(&journal, Duration::from_secs(60), false);
        writer.open(start()).unwrap();
        writer.write(frame_at(0, 30_000)).unwrap();

        // Jitter within one frame interval stays in the segment.
        assert!(writer.write(frame_at(1, -50)).unwrap().is_none());

        let rotated = writer.write(frame_at(2, -3_600_000)).unwrap().unwrap();
        assert_eq!(rotated.segment_index, 0);
        let current = writer.current().unwrap();
        assert_eq!(current.segment_index, 1);
        assert_eq!(
            current.path,
            PathBuf::from("/rec/camera_0_segment1_20250121_110000.mp4")
        );

        // Chunk timing resumes from the new anchor.
        assert!(writer.write(frame_at(3, -3_540_000)).unwrap().is_some());
        assert_eq!(writer.current().unwrap().segment_index, 2);
    }
}
