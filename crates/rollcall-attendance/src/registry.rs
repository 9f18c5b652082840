//! Student registration and record queries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rollcall_core::FaceModel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::is_supported_image;
use crate::clock::Clock;
use crate::format::{self, NEVER};
use crate::store::{student_key, RecordStore, DATA_UPDATE_CHANNEL, STUDENT_KEY_PATTERN, STUDENT_KEY_PREFIX};

const NOT_AVAILABLE: &str = "N/A";

/// Fields `info` normalises itself; everything else passes through, except
/// the embedding which is never echoed back.
const KNOWN_FIELDS: [&str; 8] = [
    "name",
    "major",
    "year",
    "last_attendance",
    "total_attendance",
    "registration_date",
    "reg_number",
    "face_embedding",
];

/// Normalised student record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentInfo {
    pub reg_number: String,
    pub name: String,
    pub major: String,
    pub year: String,
    pub last_attendance: String,
    pub total_attendance: i64,
    pub registration_date: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentSummary {
    pub reg_number: String,
    pub name: Option<String>,
    /// Relative time, e.g. "3 hours ago", or "Never".
    pub last_attendance: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOutcome {
    pub success: Vec<String>,
    pub failed: Vec<BulkFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    /// The entry as it appeared in the input file.
    pub student: serde_json::Value,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum BulkError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid bulk file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct BulkEntry {
    name: Option<String>,
    reg_number: Option<String>,
    major: Option<String>,
    image_path: Option<PathBuf>,
}

pub struct Registry {
    store: Arc<dyn RecordStore>,
    model: Arc<dyn FaceModel>,
    clock: Arc<dyn Clock>,
    images_dir: PathBuf,
}

impl Registry {
    pub fn new(
        store: Arc<dyn RecordStore>,
        model: Arc<dyn FaceModel>,
        clock: Arc<dyn Clock>,
        images_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            model,
            clock,
            images_dir: images_dir.into(),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Enroll a student from the first face found in `image_path`.
    ///
    /// Overwrites any existing record for `reg_number`. On success the image
    /// is moved to `{images_dir}/{reg_number}.{ext}` and a refresh is
    /// published. Returns false, with the store untouched, when no face is
    /// found.
    pub fn register(&self, name: &str, reg_number: &str, major: &str, image_path: &Path) -> bool {
        let embedding = match self.first_embedding(image_path) {
            Ok(Some(embedding)) => embedding,
            Ok(None) => {
                tracing::warn!(reg_number, path = %image_path.display(), "no face found, registration rejected");
                return false;
            }
            Err(err) => {
                tracing::warn!(reg_number, path = %image_path.display(), error = %err, "cannot encode registration image");
                return false;
            }
        };

        let now = self.clock.now();
        let fields = [
            ("name", name.to_string()),
            ("reg_number", reg_number.to_string()),
            ("major", major.to_string()),
            ("last_attendance", NEVER.to_string()),
            ("total_attendance", "0".to_string()),
            ("registration_date", format::format_registration(now)),
            ("face_embedding", embedding.to_json()),
        ];
        if let Err(err) = self.store.hash_set_fields(&student_key(reg_number), &fields) {
            tracing::error!(reg_number, error = %err, "failed to store student record");
            return false;
        }

        if let Err(err) = self.archive(reg_number, image_path) {
            tracing::error!(reg_number, path = %image_path.display(), error = %err, "failed to archive registration image");
            return false;
        }

        if let Err(err) = self.store.publish(DATA_UPDATE_CHANNEL, "refresh") {
            tracing::warn!(reg_number, error = %err, "refresh notification not published");
        }

        tracing::info!(reg_number, name, "student registered");
        true
    }

    fn first_embedding(&self, image_path: &Path) -> Result<Option<rollcall_core::Embedding>, rollcall_core::ModelError> {
        let image = self.model.load_image(image_path)?;
        Ok(self.model.encode_faces(&image)?.into_iter().next().map(|(_, e)| e))
    }

    /// Where `reg_number`'s archived image lives for a given extension.
    pub fn archive_path(&self, reg_number: &str, extension: Option<&str>) -> PathBuf {
        match extension {
            Some(ext) => self.images_dir.join(format!("{reg_number}.{ext}")),
            None => self.images_dir.join(reg_number),
        }
    }

    fn archive(&self, reg_number: &str, source: &Path) -> std::io::Result<PathBuf> {
        let target = self.archive_path(reg_number, source.extension().and_then(|e| e.to_str()));
        if source != target {
            std::fs::create_dir_all(&self.images_dir)?;
            // rename fails across filesystems
            if std::fs::rename(source, &target).is_err() {
                std::fs::copy(source, &target)?;
                std::fs::remove_file(source)?;
            }
            tracing::debug!(from = %source.display(), to = %target.display(), "image archived");
        }
        self.remove_stale_images(reg_number, &target);
        Ok(target)
    }

    /// Delete archive images of `reg_number` other than `keep`, so a
    /// re-registration under another extension leaves one image behind.
    fn remove_stale_images(&self, reg_number: &str, keep: &Path) {
        let Ok(entries) = std::fs::read_dir(&self.images_dir) else {
            return;
        };
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            let same_student = path.file_stem().and_then(|s| s.to_str()) == Some(reg_number);
            if !same_student || path == keep || !path.is_file() || !is_supported_image(&path) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(reg_number, path = %path.display(), "stale archive image removed"),
                Err(err) => tracing::warn!(reg_number, path = %path.display(), error = %err, "cannot remove stale archive image"),
            }
        }
    }

    /// Normalised record for `reg_number`, or `None` when absent or the store
    /// is unreachable.
    pub fn info(&self, reg_number: &str) -> Option<StudentInfo> {
        let raw = match self.store.hash_get_all(&student_key(reg_number)) {
            Ok(raw) if !raw.is_empty() => raw,
            Ok(_) => {
                tracing::debug!(reg_number, "no such student");
                return None;
            }
            Err(err) => {
                tracing::warn!(reg_number, error = %err, "student lookup failed");
                return None;
            }
        };

        let field = |key: &str| raw.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let registration_date = field("registration_date")
            .and_then(format::parse_timestamp)
            .map(|d| d.format(format::DISPLAY_DATE_FORMAT).to_string())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());

        let total_attendance = field("total_attendance")
            .filter(|v| v.chars().all(|c| c.is_ascii_digit()))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let extra = raw
            .iter()
            .filter(|(k, _)| !KNOWN_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(StudentInfo {
            reg_number: reg_number.to_string(),
            name: field("name").map(format::title_case).unwrap_or_else(|| "Unknown Name".to_string()),
            major: field("major").map(format::title_case).unwrap_or_else(|| "Undeclared".to_string()),
            year: field("year").unwrap_or(NOT_AVAILABLE).to_string(),
            last_attendance: field("last_attendance").unwrap_or(NEVER).to_string(),
            total_attendance,
            registration_date,
            extra,
        })
    }

    /// One summary per stored student, in store enumeration order.
    pub fn list_all(&self) -> Vec<StudentSummary> {
        let keys = match self.store.keys_matching(STUDENT_KEY_PATTERN) {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "cannot enumerate students");
                return Vec::new();
            }
        };

        let now = self.clock.now();
        keys.iter()
            .filter_map(|key| {
                let reg_number = key.strip_prefix(STUDENT_KEY_PREFIX)?;
                let record = match self.store.hash_get_all(key) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(reg_number, error = %err, "student lookup failed");
                        return None;
                    }
                };
                Some(StudentSummary {
                    reg_number: reg_number.to_string(),
                    name: record.get("name").cloned(),
                    last_attendance: format::relative_time(record.get("last_attendance").map(String::as_str), now),
                })
            })
            .collect()
    }

    /// Register every entry of a JSON array of
    /// `{name, reg_number, major, image_path}` objects.
    pub fn bulk_register(&self, json_path: &Path) -> Result<BulkOutcome, BulkError> {
        let raw = std::fs::read_to_string(json_path).map_err(|source| BulkError::Read {
            path: json_path.to_path_buf(),
            source,
        })?;
        let entries: Vec<serde_json::Value> = serde_json::from_str(&raw)?;

        let mut outcome = BulkOutcome::default();
        for value in entries {
            let entry = serde_json::from_value::<BulkEntry>(value.clone()).ok();
            let fields = entry.and_then(|e| Some((e.name?, e.reg_number?, e.major?, e.image_path?)));
            let Some((name, reg_number, major, image_path)) = fields else {
                tracing::warn!(entry = %value, "bulk entry missing required fields");
                outcome.failed.push(BulkFailure {
                    student: value,
                    reason: "Missing required fields".to_string(),
                });
                continue;
            };

            if self.register(&name, &reg_number, &major, &image_path) {
                outcome.success.push(reg_number);
            } else {
                outcome.failed.push(BulkFailure {
                    student: value,
                    reason: "Registration failed".to_string(),
                });
            }
        }

        tracing::info!(
            succeeded = outcome.success.len(),
            failed = outcome.failed.len(),
            "bulk registration finished"
        );
        Ok(outcome)
    }
}
