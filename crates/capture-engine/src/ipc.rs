//! Wire format between a worker process and its supervisor.
//!
//! The child writes newline-delimited JSON [`WorkerEvent`]s to stdout. A
//! `Preview` event line is followed by exactly `len` bytes of JPEG. The
//! parent writes [`STOP_COMMAND`] to the child's stdin (or closes it) to
//! request a stop.

use std::io::{BufRead, Read, Write};

use camrec_common::error::{CamrecError, CamrecResult};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::status::WorkerSnapshot;

/// Line the parent sends to stop a worker process.
pub const STOP_COMMAND: &str = "stop";

/// Upper bound on a preview payload, to reject a corrupted length field.
const MAX_PREVIEW_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Snapshot {
        snapshot: WorkerSnapshot,
    },
    Preview {
        width: u32,
        height: u32,
        sequence: u64,
        captured_at: DateTime<Local>,
        len: usize,
    },
}

/// Write one event line, followed by `payload` if given.
pub fn write_event<W: Write>(
    out: &mut W,
    event: &WorkerEvent,
    payload: Option<&[u8]>,
) -> CamrecResult<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    if let Some(bytes) = payload {
        out.write_all(bytes)?;
    }
    out.flush()?;
    Ok(())
}

/// Read the next event and its payload. `Ok(None)` at end of stream.
pub fn read_event<R: BufRead>(input: &mut R) -> CamrecResult<Option<(WorkerEvent, Vec<u8>)>> {
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }

    let event: WorkerEvent = serde_json::from_str(line.trim())
        .map_err(|e| CamrecError::ipc(format!("malformed event line: {e}")))?;
    let mut payload = Vec::new();
    if let WorkerEvent::Preview { len, .. } = &event {
        if *len > MAX_PREVIEW_BYTES {
            return Err(CamrecError::ipc(format!("preview payload of {len} bytes")));
        }
        payload.resize(*len, 0);
        input
            .read_exact(&mut payload)
            .map_err(|e| CamrecError::ipc(format!("truncated preview payload: {e}")))?;
    }
    Ok(Some((event, payload)))
}

/// JPEG-encode a frame for relay.
pub fn encode_preview(frame: &Frame, quality: u8) -> CamrecResult<Vec<u8>> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(&frame.pixels, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| CamrecError::ipc(format!("preview encode failed: {e}")))?;
    Ok(jpeg)
}

/// Write a frame as a `Preview` event carrying its already-encoded JPEG.
pub fn write_preview<W: Write>(out: &mut W, frame: &Frame, jpeg: &[u8]) -> CamrecResult<()> {
    let event = WorkerEvent::Preview {
        width: frame.width,
        height: frame.height,
        sequence: frame.sequence,
        captured_at: frame.captured_at,
        len: jpeg.len(),
    };
    write_event(out, &event, Some(jpeg))
}

/// Rebuild a frame from a `Preview` event and its JPEG payload.
pub fn decode_preview(event: &WorkerEvent, jpeg: &[u8]) -> CamrecResult<Frame> {
    let WorkerEvent::Preview {
        sequence,
        captured_at,
        ..
    } = event
    else {
        return Err(CamrecError::ipc("not a preview event"));
    };
    let image = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map_err(|e| CamrecError::ipc(format!("preview decode failed: {e}")))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Ok(Frame::new(
        image.into_raw(),
        width,
        height,
        *captured_at,
        *sequence,
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use chrono::TimeZone;

    use super::*;
    use crate::status::WorkerStatus;

    fn frame() -> Frame {
        let (w, h) = (16u32, 8u32);
        let mut pixels = Vec::new();
        for y in 0..h {
            for x in 0..w {
                pixels.extend_from_slice(&[(x * 16) as u8, (y * 32) as u8, 128]);
            }
        }
        Frame::new(
            pixels,
            w,
            h,
            Local.with_ymd_and_hms(2025, 1, 21, 12, 0, 0).unwrap(),
            41,
        )
    }

    #[test]
    fn stream_carries_snapshots_and_previews() {
        let mut wire = Vec::new();
        let mut snapshot = WorkerSnapshot::opening(3);
        snapshot.status = WorkerStatus::Streaming;
        snapshot.frames_written = 12;
        write_event(&mut wire, &WorkerEvent::Snapshot { snapshot: snapshot.clone() }, None).unwrap();
        write_preview(&mut wire, &frame(), &encode_preview(&frame(), 80).unwrap()).unwrap();
        write_event(&mut wire, &WorkerEvent::Snapshot { snapshot: snapshot.clone() }, None).unwrap();

        let mut input = Cursor::new(wire);
        let (first, _) = read_event(&mut input).unwrap().unwrap();
        assert_eq!(first, WorkerEvent::Snapshot { snapshot: snapshot.clone() });

        let (preview, jpeg) = read_event(&mut input).unwrap().unwrap();
        let decoded = decode_preview(&preview, &jpeg).unwrap();
        assert_eq!((decoded.width, decoded.height, decoded.sequence), (16, 8, 41));
        assert!(decoded.is_well_formed());

        // The payload did not desynchronize the line stream.
        assert!(matches!(
            read_event(&mut input).unwrap(),
            Some((WorkerEvent::Snapshot { .. }, _))
        ));
        assert!(read_event(&mut input).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_an_ipc_error() {
        let mut wire = Vec::new();
        write_preview(&mut wire, &frame(), &encode_preview(&frame(), 80).unwrap()).unwrap();
        wire.truncate(wire.len() - 10);
        let err = read_event(&mut Cursor::new(wire)).err().unwrap();
        assert!(matches!(err, CamrecError::Ipc { .. }));
    }

    #[test]
    fn garbage_line_is_rejected() {
        let err = read_event(&mut Cursor::new(b"not json\n".to_vec()))
            .err()
            .unwrap();
        assert!(matches!(err, CamrecError::Ipc { .. }));
    }
}
