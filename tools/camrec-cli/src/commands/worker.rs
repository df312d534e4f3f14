//! Body of a worker child process.
//!
//! stdout carries the event stream back to the coordinator, so nothing
//! else may print to it here.

use camrec_capture_engine::{run_worker_process, WorkerBackends, WorkerSpec, WorkerStatus};

pub fn run(spec_json: &str) -> anyhow::Result<()> {
    let spec: WorkerSpec = serde_json::from_str(spec_json)?;
    let backends = WorkerBackends::for_source(spec.source);
    let camera_id = spec.camera.id;

    match run_worker_process(spec, backends)? {
        WorkerStatus::Errored(reason) => {
            tracing::warn!(camera_id, %reason, "Worker finished with an error");
            std::process::exit(2);
        }
        status => {
            tracing::debug!(camera_id, %status, "Worker finished");
            Ok(())
        }
    }
}
