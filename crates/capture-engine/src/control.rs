//! The three commands a control surface issues, and the owned recorder that
//! executes them.

use std::collections::BTreeMap;
use std::sync::Arc;

use camrec_common::config::EngineTuning;
use camrec_common::error::{CamrecError, CamrecResult};

use crate::frame::{CameraId, Frame};
use crate::launcher::WorkerLauncher;
use crate::session::{RecordingSession, SessionConfig};
use crate::status::{WorkerSnapshot, WorkerStatus};

#[derive(Debug, Clone)]
pub enum ControlCommand {
    StartRecording(SessionConfig),
    StopRecording,
    /// Stop if recording, then refuse further commands.
    CloseApplication,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    /// Session started; per-camera state right after every worker left `Opening`.
    Started(Vec<WorkerSnapshot>),
    /// Session stopped with these final statuses.
    Stopped(BTreeMap<CameraId, WorkerStatus>),
    /// Stop requested while idle.
    NotRecording,
    /// Recorder closed; carries final statuses if a session was running.
    Closed(Option<BTreeMap<CameraId, WorkerStatus>>),
}

/// Holds at most one active session at a time.
pub struct Recorder {
    launcher: Arc<dyn WorkerLauncher>,
    tuning: EngineTuning,
    session: Option<RecordingSession>,
    closed: bool,
}

impl Recorder {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, tuning: EngineTuning) -> Self {
        Self {
            launcher,
            tuning,
            session: None,
            closed: false,
        }
    }

    pub async fn execute(&mut self, command: ControlCommand) -> CamrecResult<ControlOutcome> {
        if self.closed {
            return Err(CamrecError::session("recorder is closed"));
        }

        match command {
            ControlCommand::StartRecording(config) => {
                if self.session.is_some() {
                    return Err(CamrecError::session(
                        "already recording; stop before starting a new session",
                    ));
                }
                let session =
                    RecordingSession::start(config, &self.tuning, Arc::clone(&self.launcher))
                        .await?;
                let snapshots = session.snapshots();
                self.session = Some(session);
                Ok(ControlOutcome::Started(snapshots))
            }
            ControlCommand::StopRecording => match self.stop_session().await? {
                Some(statuses) => Ok(ControlOutcome::Stopped(statuses)),
                None => Ok(ControlOutcome::NotRecording),
            },
            ControlCommand::CloseApplication => {
                let statuses = self.stop_session().await?;
                self.closed = true;
                tracing::info!("Recorder closed");
                Ok(ControlOutcome::Closed(statuses))
            }
        }
    }

    async fn stop_session(&mut self) -> CamrecResult<Option<BTreeMap<CameraId, WorkerStatus>>> {
        let Some(mut session) = self.session.take() else {
            return Ok(None);
        };
        session.stop().await.map(Some)
    }

    /// Per-camera status of the active session, empty when idle.
    pub fn status(&self) -> BTreeMap<CameraId, WorkerStatus> {
        self.session
            .as_ref()
            .map(RecordingSession::status)
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.session
            .as_ref()
            .map(RecordingSession::snapshots)
            .unwrap_or_default()
    }

    pub fn try_take_preview(&self, camera_id: CameraId) -> Option<Frame> {
        self.session.as_ref()?.try_take_preview(camera_id)
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
