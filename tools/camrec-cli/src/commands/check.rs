//! Check system capabilities.

use camrec_capture_engine::discovery::probe_cameras;
use camrec_capture_engine::pipeline::check_elements;
use camrec_capture_engine::{describe_camera, SourceKind, WorkerBackends};
use camrec_common::config::{config_file_path, AppConfig};

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("camrec System Check");
    println!("{}", "=".repeat(50));

    let config_path = config_file_path();
    if config_path.exists() {
        println!("[OK] Config: {}", config_path.display());
    } else {
        println!("[OK] Config: defaults ({} not found)", config_path.display());
    }

    let elements = match check_elements() {
        Ok(elements) => elements,
        Err(e) => {
            println!("[FAIL] GStreamer: {e}");
            println!();
            println!("Install GStreamer 1.x to record.");
            return Ok(());
        }
    };
    println!("[OK] GStreamer initialized");
    for (name, available) in &elements {
        if *available {
            println!("[OK]   element {name}");
        } else {
            println!("[FAIL] element {name} not installed");
        }
    }

    let output_dir = &config.recording.output_dir;
    if output_dir.is_dir() {
        println!("[OK] Default output directory: {}", output_dir.display());
    } else {
        println!(
            "[WARN] Default output directory missing: {}",
            output_dir.display()
        );
    }

    let backends = WorkerBackends::for_source(SourceKind::Device);
    let cameras = probe_cameras(
        backends.devices.as_ref(),
        config.tuning.probe_count,
        config.tuning.read_timeout(),
    );
    if cameras.is_empty() {
        println!("[WARN] No cameras could be opened");
    } else {
        println!("[OK] Cameras: {}", cameras.len());
        for (descriptor, negotiated) in &cameras {
            let info = describe_camera(descriptor.id);
            println!(
                "     {} {} ({negotiated})",
                descriptor.id,
                info.name.as_deref().unwrap_or("(unnamed)")
            );
        }
    }

    let all_elements = elements.iter().all(|(_, available)| *available);
    println!();
    if all_elements && !cameras.is_empty() {
        println!("All required capabilities are available. camrec is ready.");
    } else {
        println!("Some capabilities are missing. See above for fixes.");
    }

    Ok(())
}
