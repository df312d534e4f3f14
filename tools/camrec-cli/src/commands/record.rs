//! Record the selected cameras until Ctrl+C.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camrec_capture_engine::segment::{group_by_camera, list_segments};
use camrec_capture_engine::{
    CameraDescriptor, CameraId, ControlCommand, ControlOutcome, ProcessLauncher, Recorder,
    SessionConfig, SourceKind, ThreadLauncher, WorkerBackends, WorkerLauncher, WorkerSnapshot,
    WorkerStatus,
};
use camrec_common::config::AppConfig;

use crate::Isolation;

pub struct RecordArgs {
    pub cameras: Vec<u32>,
    pub fps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub chunk_minutes: Option<u32>,
    pub output: Option<PathBuf>,
    pub isolation: Isolation,
    pub synthetic: bool,
    pub status_every: u64,
}

pub async fn run(args: RecordArgs, config: &AppConfig) -> anyhow::Result<()> {
    let defaults = &config.recording;
    let fps = args.fps.unwrap_or(defaults.fps);
    let width = args.width.unwrap_or(defaults.width);
    let height = args.height.unwrap_or(defaults.height);
    let chunk_minutes = args.chunk_minutes.unwrap_or(defaults.chunk_minutes);
    let output = args.output.unwrap_or_else(|| defaults.output_dir.clone());
    let source = if args.synthetic {
        SourceKind::Synthetic
    } else {
        SourceKind::Device
    };

    let cameras = args
        .cameras
        .iter()
        .map(|id| CameraDescriptor::device_default(*id).with_request(fps, width, height))
        .collect();
    let session_config =
        SessionConfig::new(output.clone(), chunk_minutes, cameras).with_source(source);

    let launcher: Arc<dyn WorkerLauncher> = match args.isolation {
        Isolation::Process => Arc::new(ProcessLauncher::current_exe()?),
        Isolation::Thread => Arc::new(ThreadLauncher::new(WorkerBackends::for_source(source))),
    };
    let mut recorder = Recorder::new(launcher, config.tuning.clone());

    println!("Starting recording");
    println!("  Cameras: {:?}", args.cameras);
    println!("  Requested: {width}x{height} @ {fps} FPS");
    println!("  Chunk: {chunk_minutes} min");
    println!("  Output: {}", output.display());
    println!("  Isolation: {:?}", args.isolation);
    println!();

    match recorder
        .execute(ControlCommand::StartRecording(session_config))
        .await?
    {
        ControlOutcome::Started(snapshots) => {
            for snapshot in &snapshots {
                print_camera(snapshot);
            }
        }
        other => anyhow::bail!("Unexpected outcome from start: {other:?}"),
    }

    println!();
    println!("Press Ctrl+C to stop recording...");
    println!();

    let mut previews = PreviewTracker::default();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_every.max(1)));
    ticker.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                println!();
                println!("Stopping...");
                break;
            }
            _ = ticker.tick() => {
                previews.drain(&recorder);
                let snapshots = recorder.snapshots();
                let elapsed = recorder.session().map(|s| s.elapsed_secs()).unwrap_or(0.0);
                println!("{}", status_line(elapsed, &snapshots, &previews));
                if snapshots.iter().all(|s| s.status.is_terminal()) {
                    println!("Every camera has stopped; ending the session.");
                    break;
                }
            }
        }
    }

    let statuses = match recorder.execute(ControlCommand::CloseApplication).await? {
        ControlOutcome::Closed(Some(statuses)) => statuses,
        ControlOutcome::Closed(None) => BTreeMap::new(),
        other => anyhow::bail!("Unexpected outcome from close: {other:?}"),
    };

    let entries = list_segments(&output)?;
    let groups = group_by_camera(&entries);
    println!();
    println!("Recording finished");
    for (camera_id, status) in &statuses {
        let segments = groups.get(camera_id).map_or(0, Vec::len);
        println!("  Camera {camera_id}: {status}, {segments} segment(s) on disk");
    }
    println!("Segments saved to: {}", output.display());

    if !statuses.is_empty()
        && statuses
            .values()
            .all(|s| matches!(s, WorkerStatus::Errored(_)))
    {
        anyhow::bail!("No camera recorded successfully");
    }
    Ok(())
}

fn print_camera(snapshot: &WorkerSnapshot) {
    match (&snapshot.status, &snapshot.negotiated) {
        (WorkerStatus::Streaming, Some(negotiated)) => {
            println!("[OK]   Camera {}: {negotiated}", snapshot.camera_id)
        }
        (WorkerStatus::Errored(reason), _) => {
            println!("[FAIL] Camera {}: {reason}", snapshot.camera_id)
        }
        (status, _) => println!("[WARN] Camera {}: {status}", snapshot.camera_id),
    }
}

/// Newest preview sequence seen per camera.
#[derive(Default)]
struct PreviewTracker {
    latest: BTreeMap<CameraId, u64>,
}

impl PreviewTracker {
    fn drain(&mut self, recorder: &Recorder) {
        for snapshot in recorder.snapshots() {
            if let Some(frame) = recorder.try_take_preview(snapshot.camera_id) {
                self.latest.insert(snapshot.camera_id, frame.sequence);
            }
        }
    }
}

fn status_line(elapsed_secs: f64, snapshots: &[WorkerSnapshot], previews: &PreviewTracker) -> String {
    let total = elapsed_secs as u64;
    let mut line = format!(
        "[{:02}:{:02}:{:02}]",
        total / 3600,
        (total / 60) % 60,
        total % 60
    );
    for snapshot in snapshots {
        line.push_str(&format!(" | cam {} {}", snapshot.camera_id, snapshot.status.label()));
        if let Some(segment) = &snapshot.open_segment {
            line.push_str(&format!(" seg {}", segment.segment_index));
        }
        line.push_str(&format!(" {} frames", snapshot.frames_written));
        if let Some(sequence) = previews.latest.get(&snapshot.camera_id) {
            line.push_str(&format!(" preview #{sequence}"));
        }
    }
    line
}
