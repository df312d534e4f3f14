use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camrec_capture_engine::ipc::{decode_preview, read_event, WorkerEvent};
use camrec_capture_engine::process::run_worker_with_io;
use camrec_capture_engine::segment::list_segments;
use camrec_capture_engine::synthetic::{read_ledger, LedgerSinkFactory, SyntheticCameraFactory};
use camrec_capture_engine::{
    CameraDescriptor, WorkerBackends, WorkerSnapshot, WorkerSpec, WorkerStatus,
};
use camrec_common::clock::{Clock, SystemClock};
use camrec_common::config::EngineTuning;
use camrec_common::error::CamrecResult;

/// Supervisor-to-worker command stream fed one chunk at a time.
struct CommandPipe {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for CommandPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(bytes) => self.pending = bytes,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

fn command_pipe() -> (Sender<Vec<u8>>, BufReader<CommandPipe>) {
    let (tx, rx) = mpsc::channel();
    let pipe = CommandPipe {
        rx,
        pending: Vec::new(),
    };
    (tx, BufReader::new(pipe))
}

/// Everything the worker wrote, shared with the test.
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<u8>>>);

impl Write for EventLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EventLog {
    /// Complete events written so far; a half-written trailing event is skipped.
    fn events(&self) -> Vec<(WorkerEvent, Vec<u8>)> {
        let mut input = Cursor::new(self.0.lock().unwrap().clone());
        let mut events = Vec::new();
        while let Ok(Some(event)) = read_event(&mut input) {
            events.push(event);
        }
        events
    }

    fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.events()
            .into_iter()
            .filter_map(|(event, _)| match event {
                WorkerEvent::Snapshot { snapshot } => Some(snapshot),
                _ => None,
            })
            .collect()
    }
}

/// A supervisor that goes away after reading `remaining` bytes.
struct VanishingPipe {
    remaining: usize,
}

impl Write for VanishingPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.remaining {
            self.remaining = 0;
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.remaining -= buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.remaining == 0 {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        Ok(())
    }
}

fn spec(dir: &Path) -> WorkerSpec {
    let tuning = EngineTuning {
        read_timeout_ms: 200,
        preview_interval_ms: 10,
        ..EngineTuning::default()
    };
    WorkerSpec::new(
        CameraDescriptor::device_default(3),
        dir,
        Duration::from_secs(60),
        &tuning,
    )
}

fn backends() -> WorkerBackends {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let devices = SyntheticCameraFactory::new(Arc::clone(&clock))
        .realtime(true)
        .settings(20, 16, 12);
    WorkerBackends::new(Arc::new(devices), Arc::new(LedgerSinkFactory::new()), clock)
}

fn wait_for(what: &str, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn join_within(worker: JoinHandle<CamrecResult<WorkerStatus>>) -> WorkerStatus {
    wait_for("worker to exit", || worker.is_finished());
    worker.join().unwrap().unwrap()
}

/// The single segment in `dir`, checked to be finalized with contiguous frames.
fn finalized_frames(dir: &Path) -> usize {
    let entries = list_segments(dir).unwrap();
    assert_eq!(entries.len(), 1);
    let ledger = read_ledger(&entries[0].path).unwrap();
    assert!(ledger.closed);
    let sequences = ledger.sequences();
    assert_eq!(sequences, (0..sequences.len() as u64).collect::<Vec<_>>());
    sequences.len()
}

#[test]
fn relays_status_and_previews_then_stops_on_command() {
    let dir = tempfile::tempdir().unwrap();
    let (commands, input) = command_pipe();
    let log = EventLog::default();

    let worker = {
        let spec = spec(dir.path());
        let out = log.clone();
        thread::spawn(move || run_worker_with_io(spec, backends(), input, out))
    };

    wait_for("streaming status and a preview", || {
        let events = log.events();
        let streaming = events.iter().any(|(e, _)| {
            matches!(e, WorkerEvent::Snapshot { snapshot } if snapshot.status == WorkerStatus::Streaming)
        });
        let preview = events
            .iter()
            .any(|(e, _)| matches!(e, WorkerEvent::Preview { .. }));
        streaming && preview
    });

    commands.send(b"stop\n".to_vec()).unwrap();
    assert_eq!(join_within(worker), WorkerStatus::Stopped);

    let events = log.events();
    let (event, jpeg) = events
        .iter()
        .find(|(e, _)| matches!(e, WorkerEvent::Preview { .. }))
        .unwrap();
    let frame = decode_preview(event, jpeg).unwrap();
    assert_eq!((frame.width, frame.height), (16, 12));
    assert_eq!(frame.pixels.len(), 16 * 12 * 3);

    let last = log.snapshots().pop().unwrap();
    assert_eq!(last.camera_id, 3);
    assert_eq!(last.status, WorkerStatus::Stopped);
    assert!(last.open_segment.is_none());
    assert_eq!(last.frames_written as usize, finalized_frames(dir.path()));
}

#[test]
fn closed_command_stream_stops_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (commands, input) = command_pipe();
    let log = EventLog::default();

    let worker = {
        let spec = spec(dir.path());
        let out = log.clone();
        thread::spawn(move || run_worker_with_io(spec, backends(), input, out))
    };
    wait_for("frames to be written", || {
        log.snapshots().iter().any(|s| s.frames_written > 0)
    });

    drop(commands);
    assert_eq!(join_within(worker), WorkerStatus::Stopped);
    assert_eq!(log.snapshots().pop().unwrap().status, WorkerStatus::Stopped);
    assert!(finalized_frames(dir.path()) > 0);
}

#[test]
fn lost_supervisor_stops_recording_and_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    // Held open so only the broken event stream can end the worker.
    let (_commands, input) = command_pipe();

    let worker = {
        let spec = spec(dir.path());
        let out = VanishingPipe { remaining: 4096 };
        thread::spawn(move || run_worker_with_io(spec, backends(), input, out))
    };

    assert_eq!(join_within(worker), WorkerStatus::Stopped);
    assert!(finalized_frames(dir.path()) > 0);
}
