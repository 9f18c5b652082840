//! Transient "who is on screen" state and the polled status snapshot.

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

/// How long recognised details stay on screen.
pub const DISPLAY_WINDOW_SECS: i64 = 3;

pub const READY_STATUS: &str = "Ready for Next Student";
pub const UNREGISTERED_STATUS: &str = "Unregistered User Detected";
pub const INITIALIZING_STATUS: &str = "Initializing";
pub const CAMERA_FAILED_STATUS: &str = "Camera Initialization Failed";
pub const CAMERA_DISCONNECTED_STATUS: &str = "Camera Disconnected";

const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PresenceStatus {
    Inactive,
    Active,
    Restricted,
    Unregistered,
}

/// The student currently on display.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentUser {
    pub name: String,
    pub id: String,
    pub status: PresenceStatus,
    pub major: String,
    pub attendance_message: String,
    /// When the details were put on screen; `None` for the baseline.
    pub shown_at: Option<NaiveDateTime>,
}

impl CurrentUser {
    /// The idle baseline.
    pub fn inactive() -> Self {
        Self {
            name: NOT_AVAILABLE.to_string(),
            id: NOT_AVAILABLE.to_string(),
            status: PresenceStatus::Inactive,
            major: NOT_AVAILABLE.to_string(),
            attendance_message: String::new(),
            shown_at: None,
        }
    }

    /// True once more than [`DISPLAY_WINDOW_SECS`] have passed since display.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        match self.shown_at {
            Some(shown) => now - shown > Duration::seconds(DISPLAY_WINDOW_SECS),
            None => false,
        }
    }
}

impl Default for CurrentUser {
    fn default() -> Self {
        Self::inactive()
    }
}

/// JSON body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: String,
    pub user: UserView,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserView {
    pub name: String,
    pub id: String,
    pub status: PresenceStatus,
    pub major: String,
    pub last_attendance: String,
    pub total_attendance: i64,
    pub attendance_message: String,
}

impl UserView {
    pub fn new(user: &CurrentUser, last_attendance: String, total_attendance: i64) -> Self {
        Self {
            name: user.name.clone(),
            id: user.id.clone(),
            status: user.status,
            major: user.major.clone(),
            last_attendance,
            total_attendance,
            attendance_message: user.attendance_message.clone(),
        }
    }
}
