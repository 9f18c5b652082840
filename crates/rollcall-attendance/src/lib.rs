//! rollcall-attendance — Student registry and live attendance engine.
//!
//! Students are registered with a face embedding into a [`RecordStore`].
//! The [`AttendanceEngine`] matches faces seen by the camera against a
//! [`RecognitionCache`] built from the archived enrollment images, and marks
//! attendance subject to a global detection cooldown and a per-student
//! attendance cooldown.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod format;
pub mod policy;
pub mod registry;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{KnownFace, RecognitionCache};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use engine::{AttendanceEngine, Recognition, RecognitionSettings, UpdateOutcome};
pub use registry::{BulkError, BulkFailure, BulkOutcome, Registry, StudentInfo, StudentSummary};
pub use status::{CurrentUser, PresenceStatus, StatusSnapshot, UserView};
pub use store::{MemoryStore, RecordStore, RedisStore, StoreError};
