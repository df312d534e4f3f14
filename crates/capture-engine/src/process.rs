//! Per-camera worker processes.
//!
//! ```text
//!  supervisor                          camrec worker --spec <json>
//!  ──────────                          ───────────────────────────
//!  stdin  ── "stop" / EOF ───────────▶ stdin watcher ─▶ stop flag
//!  relay thread ◀── NDJSON events ──── stdout ◀── relay thread ◀── PreviewSlot
//!     │                                                 ◀── status channel
//!     ├─▶ StatusPublisher (parent copy)
//!     └─▶ PreviewSlot (parent copy, JPEG-decoded)
//! ```
//!
//! Both sides hand previews off through a single-slot mailbox, so neither a
//! slow pipe nor a slow display ever backs up into the capture loop.

use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camrec_common::error::{CamrecError, CamrecResult, WorkerError};
use tokio::sync::watch;

use crate::frame::CameraId;
use crate::ipc::{
    decode_preview, encode_preview, read_event, write_event, write_preview, WorkerEvent,
    STOP_COMMAND,
};
use crate::launcher::{
    mark_unresponsive, panic_message, run_contained, WorkerHandle, WorkerLauncher,
};
use crate::preview::PreviewSlot;
use crate::status::{StatusPublisher, WorkerSnapshot, WorkerStatus};
use crate::worker::{CameraWorker, WorkerBackends, WorkerSpec};

/// Launches each worker as `<program> <args_prefix...> --spec <json>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args_prefix: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args_prefix: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args_prefix,
        }
    }

    /// Re-run the current executable's `worker` subcommand.
    pub fn current_exe() -> CamrecResult<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["worker".to_string()]))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: WorkerSpec) -> CamrecResult<Box<dyn WorkerHandle>> {
        let camera_id = spec.camera.id;
        let spec_json = serde_json::to_string(&spec)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args_prefix)
            .arg("--spec")
            .arg(&spec_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        own_process_group(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| {
                CamrecError::session(format!(
                    "failed to spawn {} for camera {camera_id}: {e}",
                    self.program.display()
                ))
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CamrecError::session(format!(
                    "worker for camera {camera_id} has no stdio pipes"
                )));
            }
        };

        let (status, _) = StatusPublisher::new(camera_id);
        let preview = Arc::new(PreviewSlot::new());
        let relay_status = status.clone();
        let relay_preview = Arc::clone(&preview);
        let relay = thread::Builder::new()
            .name(format!("camrec-relay-{camera_id}"))
            .spawn(move || relay_from_child(stdout, &relay_status, &relay_preview))
            .map_err(|e| CamrecError::session(format!("failed to spawn relay thread: {e}")));
        let relay = match relay {
            Ok(relay) => relay,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        tracing::debug!(camera_id, pid = child.id(), "Launched worker process");
        Ok(Box::new(ProcessHandle {
            camera_id,
            child,
            stdin: Some(stdin),
            status,
            preview,
            relay: Some(relay),
        }))
    }
}

/// Keep terminal interrupts away from workers. A Ctrl+C reaches only the
/// supervisor, which then stops each worker through its stdin so the open
/// segment is finalized.
#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn own_process_group(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn own_process_group(_command: &mut Command) {}

/// Parent-side reader of a worker's stdout.
fn relay_from_child(stdout: ChildStdout, status: &StatusPublisher, preview: &PreviewSlot) {
    let camera_id = status.snapshot().camera_id;
    let mut input = BufReader::new(stdout);
    loop {
        match read_event(&mut input) {
            Ok(Some((WorkerEvent::Snapshot { snapshot }, _))) => {
                if snapshot.camera_id != camera_id {
                    tracing::warn!(camera_id, reported = snapshot.camera_id, "Ignoring snapshot for another camera");
                    continue;
                }
                status.replace(snapshot);
            }
            Ok(Some((event @ WorkerEvent::Preview { .. }, jpeg))) => {
                match decode_preview(&event, &jpeg) {
                    Ok(frame) => preview.publish(frame),
                    Err(e) => tracing::debug!(camera_id, error = %e, "Dropping undecodable preview"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(camera_id, error = %e, "Worker output stream corrupted");
                break;
            }
        }
    }

    if !status.snapshot().status.is_terminal() {
        status.transition(WorkerStatus::Errored(WorkerError::Exited(
            "output closed before a final status was reported".to_string(),
        )));
    }
}

struct ProcessHandle {
    camera_id: CameraId,
    child: Child,
    stdin: Option<ChildStdin>,
    status: StatusPublisher,
    preview: Arc<PreviewSlot>,
    relay: Option<JoinHandle<()>>,
}

impl WorkerHandle for ProcessHandle {
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
        if let Some(mut stdin) = self.stdin.take() {
            // Dropping stdin closes the pipe, which the child also treats as stop.
            if let Err(e) = writeln!(stdin, "{STOP_COMMAND}").and_then(|_| stdin.flush()) {
                tracing::debug!(camera_id = self.camera_id, error = %e, "Stop command not delivered");
            }
        }
    }

    fn terminate(&mut self) {
        mark_unresponsive(&self.status);
        self.stdin = None;
        if let Err(e) = self.child.kill() {
            tracing::warn!(camera_id = self.camera_id, error = %e, "Failed to kill worker process");
        }
    }

    fn reap(mut self: Box<Self>) -> WorkerStatus {
        self.stdin = None;
        match self.child.wait() {
            Ok(exit) if !exit.success() => {
                tracing::debug!(camera_id = self.camera_id, %exit, "Worker process exited");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(camera_id = self.camera_id, error = %e, "Failed to wait for worker process");
            }
        }
        if let Some(relay) = self.relay.take() {
            let _ = relay.join();
        }
        self.status.snapshot().status
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}

/// Child side: run one worker and stream its status and previews to stdout.
///
/// Stops when [`STOP_COMMAND`] arrives on stdin or stdin closes.
pub fn run_worker_process(spec: WorkerSpec, backends: WorkerBackends) -> CamrecResult<WorkerStatus> {
    run_worker_with_io(spec, backends, BufReader::new(io::stdin()), io::stdout())
}

/// Run one worker, reading supervisor commands from `commands` and writing
/// events to `events`.
///
/// If `events` stops accepting writes the supervisor is gone, and the worker
/// stops rather than record unobserved.
pub fn run_worker_with_io<R, W>(
    spec: WorkerSpec,
    backends: WorkerBackends,
    commands: R,
    events: W,
) -> CamrecResult<WorkerStatus>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    let camera_id = spec.camera.id;
    let relay_interval = spec.preview_interval.max(Duration::from_millis(10));
    let quality = spec.preview_jpeg_quality;

    let (status, rx) = StatusPublisher::new(camera_id);
    let preview = Arc::new(PreviewSlot::new());
    let stop = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    {
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("camrec-worker-stdin".to_string())
            .spawn(move || watch_commands(commands, &stop))?;
    }

    let relay = {
        let preview = Arc::clone(&preview);
        let stop = Arc::clone(&stop);
        let done = Arc::clone(&done);
        thread::Builder::new()
            .name("camrec-worker-relay".to_string())
            .spawn(move || {
                relay_to_parent(events, rx, &preview, quality, relay_interval, &stop, &done)
            })?
    };

    let worker = CameraWorker::new(spec, backends, status.clone(), preview, stop);
    let final_status = run_contained(worker, &status);

    done.store(true, Ordering::SeqCst);
    match relay.join() {
        Ok(Some(mut out)) => {
            let snapshot = status.snapshot();
            if let Err(e) = write_event(&mut out, &WorkerEvent::Snapshot { snapshot }, None) {
                tracing::debug!(error = %e, "Final status not delivered");
            }
        }
        Ok(None) => tracing::debug!("Supervisor gone, final status not sent"),
        Err(payload) => {
            tracing::error!(message = %panic_message(payload.as_ref()), "Relay thread panicked");
        }
    }
    Ok(final_status)
}

fn watch_commands<R: BufRead>(mut input: R, stop: &AtomicBool) {
    let mut line = String::new();
    loop {
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) if line.trim() == STOP_COMMAND => break,
            Ok(_) => tracing::debug!(command = line.trim(), "Ignoring unknown command"),
        }
    }
    tracing::debug!("Stop requested by supervisor");
    stop.store(true, Ordering::SeqCst);
}

/// Forward status changes and previews until the worker is done. Hands the
/// writer back for the final status, or `None` once the supervisor is gone.
fn relay_to_parent<W: Write>(
    mut out: W,
    mut rx: watch::Receiver<WorkerSnapshot>,
    preview: &PreviewSlot,
    quality: u8,
    interval: Duration,
    stop: &AtomicBool,
    done: &AtomicBool,
) -> Option<W> {
    loop {
        let finishing = done.load(Ordering::SeqCst);

        let mut sent = Ok(());
        if rx.has_changed().unwrap_or(false) {
            let snapshot = rx.borrow_and_update().clone();
            sent = write_event(&mut out, &WorkerEvent::Snapshot { snapshot }, None);
        }
        if sent.is_ok() {
            if let Some(frame) = preview.try_take() {
                match encode_preview(&frame, quality) {
                    Ok(jpeg) => sent = write_preview(&mut out, &frame, &jpeg),
                    Err(e) => tracing::debug!(error = %e, "Skipping preview frame"),
                }
            }
        }

        if let Err(e) = sent {
            tracing::warn!(error = %e, "Lost connection to supervisor");
            stop.store(true, Ordering::SeqCst);
            return None;
        }
        if finishing {
            return Some(out);
        }
        thread::sleep(interval);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Instant;

    use camrec_common::config::EngineTuning;

    use super::*;
    use crate::frame::CameraDescriptor;

    fn snapshot_line(camera_id: CameraId, status: WorkerStatus) -> String {
        let mut snapshot = WorkerSnapshot::opening(camera_id);
        snapshot.status = status;
        serde_json::to_string(&WorkerEvent::Snapshot { snapshot }).unwrap()
    }

    /// A stand-in worker: `sh -c <script> sh --spec <json>`.
    fn shell_worker(script: String) -> ProcessLauncher {
        ProcessLauncher::new("sh", vec!["-c".to_string(), script, "sh".to_string()])
    }

    fn spec() -> WorkerSpec {
        WorkerSpec::new(
            CameraDescriptor::device_default(0),
            Path::new("/tmp"),
            Duration::from_secs(60),
            &EngineTuning::default(),
        )
    }

    fn wait_until(rx: &watch::Receiver<WorkerSnapshot>, done: impl Fn(&WorkerSnapshot) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&rx.borrow()) {
            assert!(Instant::now() < deadline, "timed out waiting for worker status");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn stop_command_round_trip() {
        let script = format!(
            "echo '{}'; read cmd; [ \"$cmd\" = stop ] && echo '{}'",
            snapshot_line(0, WorkerStatus::Streaming),
            snapshot_line(0, WorkerStatus::Stopped)
        );
        let mut handle = shell_worker(script).launch(spec()).unwrap();
        let rx = handle.subscribe();
        wait_until(&rx, |s| s.status == WorkerStatus::Streaming);

        handle.request_stop();
        assert_eq!(handle.reap(), WorkerStatus::Stopped);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn worker_leads_its_own_process_group() {
        // Field 5 of /proc/<pid>/stat is the process group id.
        let script = format!(
            "set -- $(cat /proc/$$/stat); [ \"$5\" = \"$$\" ] || exit 1; \
             echo '{}'; read cmd; [ \"$cmd\" = stop ] && echo '{}'",
            snapshot_line(0, WorkerStatus::Streaming),
            snapshot_line(0, WorkerStatus::Stopped)
        );
        let mut handle = shell_worker(script).launch(spec()).unwrap();
        let rx = handle.subscribe();
        wait_until(&rx, |s| s.status.is_terminal() || s.status == WorkerStatus::Streaming);

        handle.request_stop();
        assert_eq!(handle.reap(), WorkerStatus::Stopped);
    }

    #[test]
    fn silent_exit_is_reported_as_exited() {
        let handle = shell_worker("exit 3".to_string()).launch(spec()).unwrap();
        assert!(matches!(
            handle.reap(),
            WorkerStatus::Errored(WorkerError::Exited(_))
        ));
    }

    #[test]
    fn terminate_kills_a_worker_ignoring_stop() {
        let script = format!(
            "echo '{}'; trap '' TERM; while true; do sleep 1; done",
            snapshot_line(0, WorkerStatus::Streaming)
        );
        let mut handle = shell_worker(script).launch(spec()).unwrap();
        let rx = handle.subscribe();
        wait_until(&rx, |s| s.status == WorkerStatus::Streaming);

        handle.request_stop();
        handle.terminate();
        assert!(matches!(
            handle.reap(),
            WorkerStatus::Errored(WorkerError::Unresponsive { .. })
        ));
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let launcher = ProcessLauncher::new("/nonexistent/camrec", vec![]);
        assert!(matches!(
            launcher.launch(spec()),
            Err(CamrecError::Session { .. })
        ));
    }
}
