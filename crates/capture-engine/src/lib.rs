//! camrec Capture Engine
//!
//! Records any number of cameras at once, each into its own sequence of
//! fixed-duration segment files, while offering the newest frame of every
//! camera for live preview. Each camera runs in an isolated worker so a slow
//! disk, a stalled preview consumer, or a misbehaving camera never holds up
//! the others.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    RecordingSession                      │
//! │   start / stop / status / try_take_preview               │
//! │        │ WorkerLauncher (thread or process)              │
//! │        ▼                                                 │
//! │  ┌────────────────────────┐  ┌────────────────────────┐  │
//! │  │ CameraWorker (cam 0)   │  │ CameraWorker (cam 1)   │  │
//! │  │  CaptureUnit           │  │  CaptureUnit           │  │
//! │  │    │ read_frame        │  │    │                   │  │
//! │  │    ├─▶ PreviewSlot ────┼──┼────┼─▶ (display)       │  │
//! │  │    ▼                   │  │    ▼                   │  │
//! │  │  SegmentWriter         │  │  SegmentWriter         │  │
//! │  └────┬───────────────────┘  └────┬───────────────────┘  │
//! │       ▼                           ▼                      │
//! │  camera_0_segment{N}_*.mp4   camera_1_segment{N}_*.mp4   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod control;
pub mod device;
pub mod discovery;
pub mod frame;
pub mod ipc;
pub mod launcher;
pub mod pipeline;
pub mod preview;
pub mod process;
pub mod segment;
pub mod session;
pub mod status;
pub mod synthetic;
pub mod worker;
pub mod writer;

pub use control::{ControlCommand, ControlOutcome, Recorder};
pub use device::{CaptureDevice, CaptureDeviceFactory, CaptureUnit};
pub use discovery::{describe_camera, list_available_cameras, CameraInfo};
pub use frame::{CameraDescriptor, CameraId, Frame, NegotiatedSettings};
pub use launcher::{ThreadLauncher, WorkerHandle, WorkerLauncher};
pub use preview::PreviewSlot;
pub use process::{run_worker_process, run_worker_with_io, ProcessLauncher};
pub use segment::{list_segments, parse_segment_file_name, segment_file_name, Segment};
pub use session::{RecordingSession, SessionConfig};
pub use status::{WorkerSnapshot, WorkerStatus};
pub use worker::{CameraWorker, SourceKind, WorkerBackends, WorkerSpec};
pub use writer::{SegmentSink, SegmentSinkFactory, SegmentWriter};
