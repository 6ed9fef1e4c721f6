//! Units of work tracked in the persisted state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Waiting to run
    Do,
    /// Running, or waiting for a retry
    Doing,
    /// Finished successfully
    Done,
    /// Rolled back
    Undone,
    /// Finished with an error
    Error,
    /// Aborted before it could finish
    Hold,
}

impl Status {
    /// Whether no more work is expected for a change in this status
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Done | Status::Undone | Status::Error | Status::Hold)
    }
}

/// A change as stored in `state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub kind: String,
    pub summary: String,
    pub status: Status,
    #[serde(rename = "spawn-time")]
    pub spawn_time: DateTime<Utc>,
    #[serde(rename = "ready-time", default, skip_serializing_if = "Option::is_none")]
    pub ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default)]
    pub clean: bool,
}

impl Change {
    pub(crate) fn new(id: String, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            spawn_time: now,
            ready_time: None,
            err: None,
            clean: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    /// Whether post-completion cleanup already ran
    pub fn is_clean(&self) -> bool {
        self.clean
    }

    /// Move to `status`, stamping the ready time on the first transition to a ready status
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        if status.is_ready() {
            if self.ready_time.is_none() {
                self.ready_time = Some(Utc::now());
            }
        } else {
            self.ready_time = None;
        }
    }

    /// Finish with an error message
    pub fn fail(&mut self, message: impl Into<String>) {
        self.err = Some(message.into());
        self.set_status(Status::Error);
    }

    /// Hold a pending change; returns false if it was already ready
    pub fn abort(&mut self) -> bool {
        if self.is_ready() {
            return false;
        }
        self.err = Some("change was aborted".to_string());
        self.set_status(Status::Hold);
        true
    }

    pub fn mark_clean(&mut self) {
        self.clean = true;
    }
}
