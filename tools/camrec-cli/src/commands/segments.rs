//! List recorded segments per camera.

use std::path::PathBuf;

use camrec_capture_engine::segment::{group_by_camera, list_segments, missing_indices};

pub fn run(path: PathBuf) -> anyhow::Result<()> {
    let entries = list_segments(&path)?;
    println!("Segments in {}", path.display());
    println!("{}", "=".repeat(50));

    if entries.is_empty() {
        println!("No segment files found.");
        return Ok(());
    }

    for (camera_id, group) in group_by_camera(&entries) {
        let total_bytes: u64 = group.iter().map(|e| e.size_bytes).sum();
        println!(
            "Camera {camera_id}: {} segment(s), {:.1} MB",
            group.len(),
            total_bytes as f64 / (1024.0 * 1024.0)
        );
        for entry in &group {
            println!(
                "  #{:<4} {}  {:>10} bytes  {}",
                entry.name.segment_index,
                entry.name.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.size_bytes,
                entry.path.display()
            );
        }
        let missing = missing_indices(&group);
        if !missing.is_empty() {
            println!("  [WARN] Missing segment indices: {missing:?}");
        }
    }

    Ok(())
}
