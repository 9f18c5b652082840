//! The attendance engine: per-frame recognition, the detection and
//! attendance cooldowns, and the shared "current user" display state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{Duration, NaiveDateTime};
use image::RgbImage;
use rollcall_core::{Embedding, FaceBox, FaceModel, ModelError};
use rollcall_hw::frame::{self, Annotator, MATCHED_COLOR, UNKNOWN_COLOR};

use crate::cache::{display_name, reg_number_from_display_name, KnownFace, RecognitionCache};
use crate::clock::Clock;
use crate::format::{self, NEVER};
use crate::policy::evaluate_eligibility;
use crate::status::{
    CurrentUser, PresenceStatus, StatusSnapshot, UserView, INITIALIZING_STATUS, READY_STATUS,
    UNREGISTERED_STATUS,
};
use crate::store::{student_key, RecordStore};

const UNKNOWN_LABEL: &str = "Unknown";
const NOT_AVAILABLE: &str = "N/A";

/// Recognition and cooldown tuning.
#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    /// Downscale factor applied before detection, in (0, 1].
    pub resize_scale: f32,
    pub match_tolerance: f32,
    /// Minimum gap between any two attendance updates.
    pub detection_cooldown: Duration,
    /// Minimum gap between two marked attendances of one student.
    pub attendance_cooldown: Duration,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            resize_scale: 0.5,
            match_tolerance: 1.1,
            detection_cooldown: Duration::seconds(3),
            attendance_cooldown: Duration::hours(24),
        }
    }
}

/// What an attendance update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Inside the global detection cooldown; nothing changed.
    CoolingDown,
    /// No record for the matched face.
    Unregistered,
    /// Attendance counted; carries the new total.
    Marked { total_attendance: i64 },
    /// Inside the student's attendance cooldown.
    Restricted { message: String },
    /// Eligible, but the store rejected the write.
    MarkFailed,
}

/// One face found in a frame, in full-resolution coordinates.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub face: FaceBox,
    pub known: Option<KnownFace>,
}

impl Recognition {
    pub fn label(&self) -> &str {
        self.known.as_ref().map_or(UNKNOWN_LABEL, |k| k.display_name.as_str())
    }
}

struct EngineState {
    current_status: String,
    current_user: CurrentUser,
    last_detection: Option<NaiveDateTime>,
}

pub struct AttendanceEngine {
    store: Arc<dyn RecordStore>,
    model: Arc<dyn FaceModel>,
    clock: Arc<dyn Clock>,
    settings: RecognitionSettings,
    images_dir: PathBuf,
    known_faces: RwLock<RecognitionCache>,
    state: Mutex<EngineState>,
}

impl AttendanceEngine {
    /// Build the engine and load known faces from `images_dir`.
    pub fn new(
        store: Arc<dyn RecordStore>,
        model: Arc<dyn FaceModel>,
        clock: Arc<dyn Clock>,
        settings: RecognitionSettings,
        images_dir: impl Into<PathBuf>,
    ) -> Self {
        let engine = Self {
            store,
            model,
            clock,
            settings,
            images_dir: images_dir.into(),
            known_faces: RwLock::new(RecognitionCache::new()),
            state: Mutex::new(EngineState {
                current_status: INITIALIZING_STATUS.to_string(),
                current_user: CurrentUser::inactive(),
                last_detection: None,
            }),
        };
        if let Err(err) = std::fs::create_dir_all(&engine.images_dir) {
            tracing::warn!(dir = %engine.images_dir.display(), error = %err, "cannot create image archive");
        }
        let count = engine.reload_known_faces();
        engine.set_status(format!("Loaded {count} known faces"));
        engine
    }

    pub fn settings(&self) -> &RecognitionSettings {
        &self.settings
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Rebuild the recognition cache from the archive and swap it in.
    ///
    /// Leaves the status line alone; it may be reporting a camera fault or a
    /// displayed user.
    pub fn reload_known_faces(&self) -> usize {
        let cache = RecognitionCache::load(
            &self.images_dir,
            self.model.as_ref(),
            self.store.as_ref(),
            self.settings.resize_scale,
        );
        let count = cache.len();
        *self.known_faces.write().unwrap_or_else(PoisonError::into_inner) = cache;
        tracing::info!(count, "known faces reloaded");
        count
    }

    /// Add one freshly registered student to the cache from the embedding
    /// stored with their record, without rescanning the archive.
    ///
    /// Replaces any earlier entry for the same reg_number. Returns false when
    /// the record or its embedding cannot be read.
    pub fn learn_student(&self, reg_number: &str) -> bool {
        let record = match self.store.hash_get_all(&student_key(reg_number)) {
            Ok(record) if !record.is_empty() => record,
            Ok(_) => {
                tracing::warn!(reg_number, "no student record to learn from");
                return false;
            }
            Err(err) => {
                tracing::warn!(reg_number, error = %err, "student lookup failed");
                return false;
            }
        };
        let embedding = match record.get("face_embedding").map(|raw| Embedding::from_json(raw)) {
            Some(Ok(embedding)) => embedding,
            Some(Err(err)) => {
                tracing::warn!(reg_number, error = %err, "stored embedding unreadable");
                return false;
            }
            None => {
                tracing::warn!(reg_number, "student record has no embedding");
                return false;
            }
        };

        let name = record.get("name").map(String::as_str).unwrap_or(reg_number);
        let face = KnownFace {
            display_name: display_name(name, reg_number),
            reg_number: reg_number.to_string(),
        };
        tracing::debug!(name = %face.display_name, "known face added");
        self.known_faces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(face, embedding);
        true
    }

    pub fn known_face_count(&self) -> usize {
        self.known_faces.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Replace the coarse status line.
    pub fn set_status(&self, status: impl Into<String>) {
        self.lock_state().current_status = status.into();
    }

    pub fn current_status(&self) -> String {
        self.lock_state().current_status.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detect faces on a downscaled copy of `image` and match each against
    /// the cache. Boxes come back scaled to `image`.
    pub fn recognize(&self, image: &RgbImage) -> Result<Vec<Recognition>, ModelError> {
        let scale = self.settings.resize_scale;
        let small = frame::downscale(image, scale);
        let faces = self.model.encode_faces(&small)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let cache = self.known_faces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(faces
            .into_iter()
            .map(|(face, embedding)| Recognition {
                face: face.scaled(1.0 / scale),
                known: cache
                    .identify(self.model.as_ref(), &embedding, self.settings.match_tolerance)
                    .cloned(),
            })
            .collect())
    }

    /// Recognise, update attendance for every match, and draw the results
    /// onto `image`.
    pub fn process_frame(&self, image: &mut RgbImage, annotator: &Annotator) -> Result<Vec<Recognition>, ModelError> {
        let recognitions = self.recognize(image)?;
        for recognition in &recognitions {
            if let Some(known) = &recognition.known {
                self.update_current_user(&known.display_name);
            }
            let color = if recognition.known.is_some() { MATCHED_COLOR } else { UNKNOWN_COLOR };
            let face = &recognition.face;
            let bounds = (
                face.left as i32,
                face.top as i32,
                face.right as i32,
                face.bottom as i32,
            );
            annotator.draw(image, bounds, recognition.label(), color);
        }
        Ok(recognitions)
    }

    /// Apply the cooldowns for a matched display name and update the
    /// displayed user.
    ///
    /// The detection slot is claimed under the state lock before any store
    /// traffic, so concurrent callers inside the cooldown are turned away.
    /// The lock is not held across store calls.
    pub fn update_current_user(&self, display_name: &str) -> UpdateOutcome {
        let now = self.clock.now();
        {
            let mut state = self.lock_state();
            if let Some(last) = state.last_detection {
                if now - last <= self.settings.detection_cooldown {
                    return UpdateOutcome::CoolingDown;
                }
            }
            state.last_detection = Some(now);
        }

        let reg_number = reg_number_from_display_name(display_name).unwrap_or(display_name);
        let key = student_key(reg_number);
        let record = match self.store.hash_get_all(&key) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(reg_number, error = %err, "student lookup failed");
                Default::default()
            }
        };

        if record.is_empty() {
            tracing::info!(reg_number, display_name, "unregistered face detected");
            let mut state = self.lock_state();
            state.current_user = CurrentUser {
                name: display_name.to_string(),
                id: UNKNOWN_LABEL.to_string(),
                status: PresenceStatus::Unregistered,
                major: NOT_AVAILABLE.to_string(),
                attendance_message: String::new(),
                shown_at: Some(now),
            };
            state.current_status = UNREGISTERED_STATUS.to_string();
            return UpdateOutcome::Unregistered;
        }

        let name = record.get("name").cloned().unwrap_or_else(|| UNKNOWN_LABEL.to_string());
        let major = record.get("major").cloned().unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let eligibility = evaluate_eligibility(
            record.get("last_attendance").map(String::as_str),
            now,
            self.settings.attendance_cooldown,
        );

        let (status, message, outcome) = if eligibility.eligible {
            match self.mark_attendance(&key, now) {
                Ok(total) => {
                    tracing::info!(reg_number, total, reason = %eligibility.message, "attendance marked");
                    (
                        PresenceStatus::Active,
                        "Attendance Marked".to_string(),
                        UpdateOutcome::Marked { total_attendance: total },
                    )
                }
                Err(err) => {
                    tracing::error!(reg_number, error = %err, "failed to mark attendance");
                    (
                        PresenceStatus::Restricted,
                        "Attendance not recorded".to_string(),
                        UpdateOutcome::MarkFailed,
                    )
                }
            }
        } else {
            tracing::debug!(reg_number, reason = %eligibility.message, "attendance restricted");
            (
                PresenceStatus::Restricted,
                eligibility.message.clone(),
                UpdateOutcome::Restricted {
                    message: eligibility.message,
                },
            )
        };

        let mut state = self.lock_state();
        state.current_status = format!("Active: {name}");
        state.current_user = CurrentUser {
            name,
            id: reg_number.to_string(),
            status,
            major,
            attendance_message: message,
            shown_at: Some(now),
        };
        outcome
    }

    fn mark_attendance(&self, key: &str, now: NaiveDateTime) -> Result<i64, crate::StoreError> {
        self.store.hash_set_and_increment(
            key,
            &[("last_attendance", format::format_attendance(now))],
            "total_attendance",
            1,
        )
    }

    /// Snapshot for status polling.
    ///
    /// Resets the displayed user to the baseline once its display window has
    /// passed, then reads attendance counters fresh from the store.
    pub fn status(&self) -> StatusSnapshot {
        let now = self.clock.now();
        let (current_status, user) = {
            let mut state = self.lock_state();
            if state.current_user.is_expired(now) {
                state.current_user = CurrentUser::inactive();
                state.current_status = READY_STATUS.to_string();
            }
            (state.current_status.clone(), state.current_user.clone())
        };

        let (last_attendance, total_attendance) = match user.status {
            PresenceStatus::Active | PresenceStatus::Restricted => self.attendance_counters(&user.id),
            PresenceStatus::Inactive | PresenceStatus::Unregistered => (NEVER.to_string(), 0),
        };

        StatusSnapshot {
            status: current_status,
            user: UserView::new(&user, last_attendance, total_attendance),
        }
    }

    fn attendance_counters(&self, reg_number: &str) -> (String, i64) {
        match self.store.hash_get_all(&student_key(reg_number)) {
            Ok(record) => {
                let last = record
                    .get("last_attendance")
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .unwrap_or_else(|| NEVER.to_string());
                let total = record
                    .get("total_attendance")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                (last, total)
            }
            Err(err) => {
                tracing::warn!(reg_number, error = %err, "attendance lookup failed");
                ("Unable to retrieve".to_string(), 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::status::CAMERA_FAILED_STATUS;
    use crate::store::{MemoryStore, StoreError};
    use crate::testing::{write_face_image, ManualClock, StubFaceModel};
    use image::Rgb;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Barrier};

    /// Memory store with scripted faults: the next field write can fail, and
    /// the next lookup can block until released.
    struct ScriptedStore {
        inner: Arc<MemoryStore>,
        fail_next_write: AtomicBool,
        hold_next_lookup: AtomicBool,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl ScriptedStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                fail_next_write: AtomicBool::new(false),
                hold_next_lookup: AtomicBool::new(false),
                entered: Mutex::new(None),
                release: Mutex::new(None),
            }
        }

        /// Block the next lookup; returns (lookup entered, release lookup).
        fn hold_next_lookup(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            *self.entered.lock().unwrap() = Some(entered_tx);
            *self.release.lock().unwrap() = Some(release_rx);
            self.hold_next_lookup.store(true, Ordering::SeqCst);
            (entered_rx, release_tx)
        }
    }

    impl RecordStore for ScriptedStore {
        fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
            if self.hold_next_lookup.swap(false, Ordering::SeqCst) {
                if let Some(tx) = self.entered.lock().unwrap().as_ref() {
                    let _ = tx.send(());
                }
                if let Some(rx) = self.release.lock().unwrap().as_ref() {
                    let _ = rx.recv_timeout(std::time::Duration::from_secs(5));
                }
            }
            self.inner.hash_get_all(key)
        }

        fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
            self.inner.hash_get(key, field)
        }

        fn hash_set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
            if self.fail_next_write.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("write rejected".into()));
            }
            self.inner.hash_set_fields(key, fields)
        }

        fn hash_increment(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
            self.inner.hash_increment(key, field, by)
        }

        fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys_matching(pattern)
        }

        fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
            self.inner.publish(channel, message)
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        archive: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::at_start_of_term()),
                archive: tempfile::tempdir().unwrap(),
            }
        }

        fn registry(&self) -> Registry {
            Registry::new(
                self.store.clone(),
                Arc::new(StubFaceModel),
                self.clock.clone(),
                self.archive.path(),
            )
        }

        fn enroll(&self, name: &str, reg: &str, colour: Rgb<u8>) {
            let upload = tempfile::tempdir().unwrap();
            let path = upload.path().join(format!("{reg}.png"));
            write_face_image(&path, colour);
            assert!(self.registry().register(name, reg, "Mathematics", &path));
        }

        fn engine(&self) -> AttendanceEngine {
            AttendanceEngine::new(
                self.store.clone(),
                Arc::new(StubFaceModel),
                self.clock.clone(),
                RecognitionSettings::default(),
                self.archive.path(),
            )
        }

        fn engine_over(&self, store: Arc<dyn RecordStore>) -> AttendanceEngine {
            AttendanceEngine::new(
                store,
                Arc::new(StubFaceModel),
                self.clock.clone(),
                RecognitionSettings::default(),
                self.archive.path(),
            )
        }

        fn total(&self, reg: &str) -> i64 {
            self.store
                .hash_get(&student_key(reg), "total_attendance")
                .unwrap()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        }
    }

    #[test]
    fn test_end_to_end_attendance_cycle() {
        let f = Fixture::new();
        f.enroll("Ada Lovelace", "REG1", Rgb([255, 0, 0]));
        let info = f.registry().info("REG1").unwrap();
        assert_eq!(info.name, "Ada Lovelace");
        assert_eq!(info.total_attendance, 0);

        let engine = f.engine();
        assert_eq!(engine.known_face_count(), 1);

        assert_eq!(
            engine.update_current_user("Ada Lovelace (REG1)"),
            UpdateOutcome::Marked { total_attendance: 1 }
        );
        let status = engine.status();
        assert_eq!(status.status, "Active: Ada Lovelace");
        assert_eq!(status.user.status, PresenceStatus::Active);
        assert_eq!(status.user.attendance_message, "Attendance Marked");
        assert_eq!(status.user.total_attendance, 1);
        assert_eq!(status.user.last_attendance, "2024-09-02 08:00:00");

        f.clock.advance(Duration::hours(1));
        match engine.update_current_user("Ada Lovelace (REG1)") {
            UpdateOutcome::Restricted { message } => assert!(message.contains("23.0 hours"), "{message}"),
            other => panic!("expected restriction, got {other:?}"),
        }
        assert_eq!(engine.status().user.status, PresenceStatus::Restricted);
        assert_eq!(f.total("REG1"), 1);

        f.clock.advance(Duration::hours(24));
        assert_eq!(
            engine.update_current_user("Ada Lovelace (REG1)"),
            UpdateOutcome::Marked { total_attendance: 2 }
        );
        assert_eq!(engine.status().user.status, PresenceStatus::Active);
        assert_eq!(f.total("REG1"), 2);
    }

    #[test]
    fn test_global_detection_cooldown() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        f.enroll("Grace", "REG2", Rgb([0, 255, 0]));
        let engine = f.engine();

        assert!(matches!(engine.update_current_user("Ada (REG1)"), UpdateOutcome::Marked { .. }));
        f.clock.advance(Duration::seconds(2));
        assert_eq!(engine.update_current_user("Grace (REG2)"), UpdateOutcome::CoolingDown);
        assert_eq!(engine.status().user.id, "REG1");
        assert_eq!(f.total("REG2"), 0);

        // Exactly at the cooldown boundary is still cooling down.
        f.clock.advance(Duration::seconds(1));
        assert_eq!(engine.update_current_user("Grace (REG2)"), UpdateOutcome::CoolingDown);

        f.clock.advance(Duration::seconds(1));
        assert!(matches!(engine.update_current_user("Grace (REG2)"), UpdateOutcome::Marked { .. }));
        assert_eq!(f.total("REG2"), 1);
    }

    #[test]
    fn test_repeated_matches_within_attendance_cooldown_count_once() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let engine = f.engine();
        for _ in 0..10 {
            engine.update_current_user("Ada (REG1)");
            f.clock.advance(Duration::minutes(30));
        }
        assert_eq!(f.total("REG1"), 1);
    }

    #[test]
    fn test_display_expires_after_three_seconds() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let engine = f.engine();
        engine.update_current_user("Ada (REG1)");

        f.clock.advance(Duration::seconds(3));
        assert_eq!(engine.status().user.status, PresenceStatus::Active);

        f.clock.advance(Duration::milliseconds(1));
        let status = engine.status();
        assert_eq!(status.status, READY_STATUS);
        assert_eq!(status.user.status, PresenceStatus::Inactive);
        assert_eq!(status.user.name, "N/A");
        assert_eq!(status.user.total_attendance, 0);
    }

    #[test]
    fn test_unregistered_match() {
        let f = Fixture::new();
        let engine = f.engine();
        assert_eq!(engine.update_current_user("Ghost (REG404)"), UpdateOutcome::Unregistered);
        let status = engine.status();
        assert_eq!(status.status, UNREGISTERED_STATUS);
        assert_eq!(status.user.status, PresenceStatus::Unregistered);
        assert_eq!(status.user.id, "Unknown");
        assert_eq!(status.user.name, "Ghost (REG404)");
        assert!(f.store.hash_get_all("student:REG404").unwrap().is_empty());
    }

    #[test]
    fn test_store_outage_degrades() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let engine = f.engine();
        f.store.set_available(false);
        assert_eq!(engine.update_current_user("Ada (REG1)"), UpdateOutcome::Unregistered);
        f.store.set_available(true);
        assert_eq!(f.total("REG1"), 0);
    }

    #[test]
    fn test_malformed_last_attendance_is_restricted() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        f.store
            .hash_set_fields("student:REG1", &[("last_attendance", "someday".to_string())])
            .unwrap();
        let engine = f.engine();
        assert_eq!(
            engine.update_current_user("Ada (REG1)"),
            UpdateOutcome::Restricted {
                message: "Check failed".to_string()
            }
        );
        assert_eq!(f.total("REG1"), 0);
    }

    #[test]
    fn test_initial_status_reports_loaded_faces() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let engine = f.engine();
        let status = engine.status();
        assert_eq!(status.status, "Loaded 1 known faces");
        assert_eq!(status.user.status, PresenceStatus::Inactive);
    }

    #[test]
    fn test_registration_roundtrip_matches_fresh_embedding() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let engine = f.engine();
        let frame = RgbImage::from_pixel(40, 20, Rgb([255, 0, 0]));
        let found = engine.recognize(&frame).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].label(), "Ada (REG1)");
        // Box is mapped back to full resolution.
        assert_eq!(found[0].face.right, 40.0);
        assert_eq!(found[0].face.bottom, 20.0);
    }

    #[test]
    fn test_process_frame_marks_and_annotates() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let engine = f.engine();
        let mut frame = RgbImage::from_pixel(64, 64, Rgb([255, 0, 0]));
        let found = engine.process_frame(&mut frame, &Annotator::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(f.total("REG1"), 1);
        assert_eq!(*frame.get_pixel(0, 32), MATCHED_COLOR);
    }

    #[test]
    fn test_unknown_face_is_drawn_but_not_marked() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let engine = f.engine();
        let mut frame = RgbImage::from_pixel(64, 64, Rgb([0, 0, 255]));
        let found = engine.process_frame(&mut frame, &Annotator::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].known.is_none());
        assert_eq!(found[0].label(), "Unknown");
        assert_eq!(*frame.get_pixel(0, 32), UNKNOWN_COLOR);
        assert_eq!(engine.status().user.status, PresenceStatus::Inactive);
    }

    #[test]
    fn test_reload_picks_up_new_registrations() {
        let f = Fixture::new();
        let engine = f.engine();
        assert_eq!(engine.known_face_count(), 0);
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        assert_eq!(engine.reload_known_faces(), 1);
        let frame = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
        assert!(engine.recognize(&frame).unwrap()[0].known.is_some());
    }

    #[test]
    fn test_failed_mark_does_not_count() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let store = Arc::new(ScriptedStore::new(f.store.clone()));
        let engine = f.engine_over(store.clone());

        store.fail_next_write.store(true, Ordering::SeqCst);
        assert_eq!(engine.update_current_user("Ada (REG1)"), UpdateOutcome::MarkFailed);
        assert_eq!(engine.status().user.attendance_message, "Attendance not recorded");
        assert_eq!(f.total("REG1"), 0);
        assert_eq!(
            f.store.hash_get("student:REG1", "last_attendance").unwrap().as_deref(),
            Some("Never")
        );

        f.clock.advance(Duration::seconds(10));
        assert_eq!(
            engine.update_current_user("Ada (REG1)"),
            UpdateOutcome::Marked { total_attendance: 1 }
        );
        f.clock.advance(Duration::seconds(10));
        assert!(matches!(
            engine.update_current_user("Ada (REG1)"),
            UpdateOutcome::Restricted { .. }
        ));
        assert_eq!(f.total("REG1"), 1);
    }

    #[test]
    fn test_reload_keeps_status_line() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let engine = f.engine();

        engine.set_status(CAMERA_FAILED_STATUS);
        assert_eq!(engine.reload_known_faces(), 1);
        assert_eq!(engine.status().status, CAMERA_FAILED_STATUS);

        engine.update_current_user("Ada (REG1)");
        engine.reload_known_faces();
        let status = engine.status();
        assert_eq!(status.status, "Active: Ada");
        assert_eq!(status.user.id, "REG1");
    }

    #[test]
    fn test_learn_student_uses_stored_embedding() {
        let f = Fixture::new();
        let engine = f.engine();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        // The archive is not rescanned.
        std::fs::remove_file(f.archive.path().join("REG1.png")).unwrap();

        assert!(engine.learn_student("REG1"));
        assert_eq!(engine.known_face_count(), 1);
        let frame = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
        assert_eq!(engine.recognize(&frame).unwrap()[0].label(), "Ada (REG1)");

        assert!(!engine.learn_student("NOPE"));
        assert_eq!(engine.known_face_count(), 1);
    }

    #[test]
    fn test_learn_student_replaces_earlier_enrolment() {
        let f = Fixture::new();
        let engine = f.engine();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        assert!(engine.learn_student("REG1"));
        f.enroll("Ada King", "REG1", Rgb([0, 255, 0]));
        assert!(engine.learn_student("REG1"));

        assert_eq!(engine.known_face_count(), 1);
        let old = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
        assert!(engine.recognize(&old).unwrap()[0].known.is_none());
        let new = RgbImage::from_pixel(8, 8, Rgb([0, 255, 0]));
        assert_eq!(engine.recognize(&new).unwrap()[0].label(), "Ada King (REG1)");
    }

    #[test]
    fn test_concurrent_updates_claim_one_detection_slot() {
        let f = Fixture::new();
        let regs: Vec<String> = (0..8).map(|i| format!("REG{i}")).collect();
        for (i, reg) in regs.iter().enumerate() {
            f.enroll(&format!("Student {i}"), reg, Rgb([255, i as u8 * 20, 0]));
        }
        let engine = f.engine();
        let barrier = Barrier::new(regs.len());

        let outcomes: Vec<UpdateOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = regs
                .iter()
                .map(|reg| {
                    let (engine, barrier) = (&engine, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        engine.update_current_user(&format!("Student ({reg})"))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let marked = outcomes
            .iter()
            .filter(|o| matches!(o, UpdateOutcome::Marked { .. }))
            .count();
        let cooling = outcomes
            .iter()
            .filter(|o| **o == UpdateOutcome::CoolingDown)
            .count();
        assert_eq!(marked, 1, "{outcomes:?}");
        assert_eq!(cooling, regs.len() - 1, "{outcomes:?}");
        assert_eq!(regs.iter().map(|r| f.total(r)).sum::<i64>(), 1);
    }

    #[test]
    fn test_status_served_while_update_waits_on_store() {
        let f = Fixture::new();
        f.enroll("Ada", "REG1", Rgb([255, 0, 0]));
        let store = Arc::new(ScriptedStore::new(f.store.clone()));
        let engine = f.engine_over(store.clone());
        let (entered, release) = store.hold_next_lookup();

        std::thread::scope(|s| {
            let engine = &engine;
            let update = s.spawn(move || engine.update_current_user("Ada (REG1)"));
            entered.recv_timeout(std::time::Duration::from_secs(5)).unwrap();

            // The update is parked inside its store lookup.
            let (tx, rx) = mpsc::channel();
            s.spawn(move || tx.send(engine.status()).unwrap());
            let status = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
            assert_eq!(status.status, "Loaded 1 known faces");
            assert_eq!(status.user.status, PresenceStatus::Inactive);
            // The detection slot is already taken.
            assert_eq!(engine.update_current_user("Ada (REG1)"), UpdateOutcome::CoolingDown);

            release.send(()).unwrap();
            assert_eq!(update.join().unwrap(), UpdateOutcome::Marked { total_attendance: 1 });
        });
        assert_eq!(engine.status().status, "Active: Ada");
    }
}
