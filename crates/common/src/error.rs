//! Error types shared across camrec crates.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for camrec operations.
#[derive(Debug, thiserror::Error)]
pub enum CamrecError {
    #[error("Camera {camera_id} unavailable: {message}")]
    DeviceUnavailable { camera_id: u32, message: String },

    #[error("Camera {camera_id} produced no frame within {timeout:?}")]
    ReadTimeout { camera_id: u32, timeout: Duration },

    #[error("Camera {camera_id} disconnected: {message}")]
    DeviceDisconnected { camera_id: u32, message: String },

    #[error("File system error at {path}: {message}")]
    FileSystem { path: PathBuf, message: String },

    #[error("Failed to write frame to {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("No cameras selected")]
    NoCamerasSelected,

    #[error("Invalid output directory {path}: {reason}")]
    InvalidOutputDirectory { path: PathBuf, reason: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Worker protocol error: {message}")]
    Ipc { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using CamrecError.
pub type CamrecResult<T> = Result<T, CamrecError>;

impl CamrecError {
    pub fn device_unavailable(camera_id: u32, msg: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            camera_id,
            message: msg.into(),
        }
    }

    pub fn disconnected(camera_id: u32, msg: impl Into<String>) -> Self {
        Self::DeviceDisconnected {
            camera_id,
            message: msg.into(),
        }
    }

    pub fn file_system(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::FileSystem {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn invalid_output_dir(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidOutputDirectory {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session {
            message: msg.into(),
        }
    }

    pub fn ipc(msg: impl Into<String>) -> Self {
        Self::Ipc {
            message: msg.into(),
        }
    }

    /// Whether the failure is transient and the capture loop should carry on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReadTimeout { .. })
    }

    /// Reduce this error to the reason a worker reports when it gives up.
    pub fn worker_reason(&self) -> WorkerError {
        match self {
            Self::DeviceUnavailable { message, .. } => {
                WorkerError::DeviceUnavailable(message.clone())
            }
            Self::DeviceDisconnected { message, .. } => {
                WorkerError::DeviceDisconnected(message.clone())
            }
            Self::ReadTimeout { .. } => WorkerError::DeviceDisconnected(self.to_string()),
            Self::FileSystem { .. } | Self::Io(_) => WorkerError::FileSystem(self.to_string()),
            Self::Write { .. } => WorkerError::Write(self.to_string()),
            _ => WorkerError::Internal(self.to_string()),
        }
    }
}

/// Why a camera worker ended in the `Errored` state.
///
/// Plain data so it can be carried across the worker process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WorkerError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("file system error: {0}")]
    FileSystem(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("worker unresponsive, force-terminated")]
    Unresponsive {
        /// Segment that was open when the worker was terminated.
        possibly_truncated: Option<PathBuf>,
    },

    #[error("worker exited unexpectedly: {0}")]
    Exited(String),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}
