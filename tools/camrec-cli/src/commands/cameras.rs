//! List cameras that can be opened.

use camrec_capture_engine::discovery::probe_cameras;
use camrec_capture_engine::{describe_camera, SourceKind, WorkerBackends};
use camrec_common::config::AppConfig;

pub fn run(config: &AppConfig, probe: Option<u32>, synthetic: bool) -> anyhow::Result<()> {
    let source = if synthetic {
        SourceKind::Synthetic
    } else {
        SourceKind::Device
    };
    let probe_count = probe.unwrap_or(config.tuning.probe_count);
    let backends = WorkerBackends::for_source(source);

    println!("Probing {probe_count} camera indices...");
    let found = probe_cameras(
        backends.devices.as_ref(),
        probe_count,
        config.tuning.read_timeout(),
    );

    if found.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("{}", "=".repeat(50));
    for (descriptor, negotiated) in &found {
        let info = describe_camera(descriptor.id);
        let name = info.name.as_deref().unwrap_or("(unnamed)");
        println!("Camera {}: {name}", descriptor.id);
        if let Some(path) = &info.device_path {
            println!("  Device: {}", path.display());
        }
        println!("  Default mode: {negotiated}");
        if !synthetic {
            println!("  Webcam score: {}", info.webcam_score);
        }
    }
    println!("{}", "=".repeat(50));
    println!("{} camera(s) available", found.len());

    Ok(())
}
