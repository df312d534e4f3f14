//! Segment files: naming, parsing, and discovery.
//!
//! A segment is one time-bounded output file for one camera. There is no
//! manifest; the directory listing plus the file name is the whole record:
//!
//! ```text
//! <output_dir>/camera_<id>_segment<index>_<YYYYMMDD_HHMMSS>.mp4
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use camrec_common::error::{CamrecError, CamrecResult};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::frame::CameraId;

/// `strftime` layout of the timestamp embedded in segment file names.
pub const SEGMENT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Container extension of every segment.
pub const SEGMENT_EXTENSION: &str = "mp4";

/// One output file for one camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub camera_id: CameraId,
    pub segment_index: u64,
    pub start_timestamp: DateTime<Local>,
    pub path: PathBuf,
}

impl Segment {
    pub fn new(
        output_dir: &Path,
        camera_id: CameraId,
        segment_index: u64,
        start_timestamp: DateTime<Local>,
    ) -> Self {
        let path = output_dir.join(segment_file_name(camera_id, segment_index, &start_timestamp));
        Self {
            camera_id,
            segment_index,
            start_timestamp,
            path,
        }
    }
}

/// File name for a segment opened at `timestamp`.
pub fn segment_file_name(camera_id: CameraId, index: u64, timestamp: &DateTime<Local>) -> String {
    format!(
        "camera_{camera_id}_segment{index}_{}.{SEGMENT_EXTENSION}",
        timestamp.format(SEGMENT_TIMESTAMP_FORMAT)
    )
}

/// Fields recovered from a segment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub camera_id: CameraId,
    pub segment_index: u64,
    pub timestamp: NaiveDateTime,
}

/// Parse `camera_<id>_segment<index>_<YYYYMMDD_HHMMSS>.mp4`.
///
/// Returns `None` for anything else, so unrelated files in the output
/// directory are skipped rather than reported.
pub fn parse_segment_file_name(name: &str) -> Option<SegmentName> {
    let stem = name
        .strip_suffix(SEGMENT_EXTENSION)?
        .strip_suffix('.')?
        .strip_prefix("camera_")?;

    let (camera, rest) = stem.split_once("_segment")?;
    let (index, timestamp) = rest.split_once('_')?;

    if !is_ascii_number(camera) || !is_ascii_number(index) {
        return None;
    }

    Some(SegmentName {
        camera_id: camera.parse().ok()?,
        segment_index: index.parse().ok()?,
        timestamp: NaiveDateTime::parse_from_str(timestamp, SEGMENT_TIMESTAMP_FORMAT).ok()?,
    })
}

fn is_ascii_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// A segment file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub name: SegmentName,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// List every segment file in `dir`, ordered by `(camera_id, segment_index)`.
pub fn list_segments(dir: &Path) -> CamrecResult<Vec<SegmentEntry>> {
    let read_dir = std::fs::read_dir(dir)
        .map_err(|e| CamrecError::file_system(dir, format!("cannot list directory: {e}")))?;

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(parse_segment_file_name) else {
            continue;
        };
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        entries.push(SegmentEntry {
            name,
            path: entry.path(),
            size_bytes: metadata.len(),
        });
    }

    entries.sort_by(|a, b| {
        (a.name.camera_id, a.name.segment_index).cmp(&(b.name.camera_id, b.name.segment_index))
    });
    Ok(entries)
}

/// Segments grouped per camera, each group in index order.
pub fn group_by_camera(entries: &[SegmentEntry]) -> BTreeMap<CameraId, Vec<&SegmentEntry>> {
    let mut groups: BTreeMap<CameraId, Vec<&SegmentEntry>> = BTreeMap::new();
    for entry in entries {
        groups.entry(entry.name.camera_id).or_default().push(entry);
    }
    groups
}

/// Indices missing from a camera's run, assuming it started at 0.
pub fn missing_indices(group: &[&SegmentEntry]) -> Vec<u64> {
    let mut missing = Vec::new();
    let mut expected = 0;
    for entry in group {
        let index = entry.name.segment_index;
        while expected < index {
            missing.push(expected);
            expected += 1;
        }
        expected = index + 1;
    }
    missing
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 1, 21, 12, 0, 0).unwrap()
    }

    #[test]
    fn file_name_matches_layout() {
        assert_eq!(
            segment_file_name(0, 2, &noon()),
            "camera_0_segment2_20250121_120000.mp4"
        );
        let segment = Segment::new(Path::new("/rec"), 3, 0, noon());
        assert_eq!(
            segment.path,
            PathBuf::from("/rec/camera_3_segment0_20250121_120000.mp4")
        );
    }

    #[test]
    fn parse_recovers_fields() {
        let name = parse_segment_file_name("camera_12_segment104_20250121_235959.mp4").unwrap();
        assert_eq!(name.camera_id, 12);
        assert_eq!(name.segment_index, 104);
        assert_eq!(name.timestamp.format("%H:%M:%S").to_string(), "23:59:59");
    }

    #[test]
    fn parse_rejects_foreign_names() {
        for name in [
            "camera_0_segment0_20250121_120000.mkv",
            "camera_x_segment0_20250121_120000.mp4",
            "camera_0_segment_20250121_120000.mp4",
            "camera_0_segment0_2025-01-21.mp4",
            "notes.txt",
            "camera_-1_segment0_20250121_120000.mp4",
        ] {
            assert!(parse_segment_file_name(name).is_none(), "{name}");
        }
    }

    #[test]
    fn listing_orders_and_skips_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "camera_1_segment0_20250121_120000.mp4",
            "camera_0_segment10_20250121_121000.mp4",
            "camera_0_segment2_20250121_120200.mp4",
            "camera_0_segment0_20250121_120000.mp4",
            "thumbs.db",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let entries = list_segments(dir.path()).unwrap();
        let order: Vec<(u32, u64)> = entries
            .iter()
            .map(|e| (e.name.camera_id, e.name.segment_index))
            .collect();
        assert_eq!(order, vec![(0, 0), (0, 2), (0, 10), (1, 0)]);

        let groups = group_by_camera(&entries);
        assert_eq!(missing_indices(&groups[&0]), vec![1, 3, 4, 5, 6, 7, 8, 9]);
        assert!(missing_indices(&groups[&1]).is_empty());
    }
}
