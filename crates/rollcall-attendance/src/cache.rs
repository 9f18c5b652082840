//! In-memory gallery of enrolled faces, rebuilt from the image archive.

use std::path::{Path, PathBuf};

use rollcall_core::{Embedding, FaceModel};
use rollcall_hw::frame;

use crate::store::{student_key, RecordStore};

/// Archive image extensions, lower-case.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// `"{name} ({reg_number})"`.
pub fn display_name(name: &str, reg_number: &str) -> String {
    format!("{name} ({reg_number})")
}

/// The text inside the last pair of parentheses.
pub fn reg_number_from_display_name(display: &str) -> Option<&str> {
    let open = display.rfind('(')?;
    let close = open + display[open..].find(')')?;
    let reg = display[open + 1..close].trim();
    (!reg.is_empty()).then_some(reg)
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnownFace {
    pub display_name: String,
    pub reg_number: String,
}

/// Display-name → embedding, in insertion order.
///
/// Matching walks entries in order and takes the first hit, so the order in
/// which faces were added decides ties.
#[derive(Debug, Clone, Default)]
pub struct RecognitionCache {
    faces: Vec<KnownFace>,
    embeddings: Vec<Embedding>,
}

impl RecognitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn faces(&self) -> &[KnownFace] {
        &self.faces
    }

    /// Add a face; an existing entry with the same display name keeps its
    /// position and takes the new embedding.
    pub fn insert(&mut self, face: KnownFace, embedding: Embedding) {
        match self.faces.iter().position(|f| f.display_name == face.display_name) {
            Some(i) => self.embeddings[i] = embedding,
            None => {
                self.faces.push(face);
                self.embeddings.push(embedding);
            }
        }
    }

    /// Add or refresh a student's face. An existing entry for the same
    /// reg_number keeps its position; its display name and embedding are
    /// replaced.
    pub fn upsert(&mut self, face: KnownFace, embedding: Embedding) {
        match self.faces.iter().position(|f| f.reg_number == face.reg_number) {
            Some(i) => {
                self.faces[i] = face;
                self.embeddings[i] = embedding;
            }
            None => self.insert(face, embedding),
        }
    }

    /// First cached face within `tolerance` of `query`.
    pub fn identify(&self, model: &dyn FaceModel, query: &Embedding, tolerance: f32) -> Option<&KnownFace> {
        if self.faces.is_empty() {
            return None;
        }
        let matches = model.compare_embeddings(&self.embeddings, query, tolerance);
        matches
            .iter()
            .position(|&hit| hit)
            .and_then(|i| self.faces.get(i))
    }

    /// Build the cache from every supported image in `images_dir`.
    ///
    /// Each file's stem is a reg_number. Files whose image has no face or
    /// whose student record is missing are skipped with a warning. The
    /// embedding stored at registration is used when it parses; otherwise
    /// the freshly computed one is.
    pub fn load(
        images_dir: &Path,
        model: &dyn FaceModel,
        store: &dyn RecordStore,
        resize_scale: f32,
    ) -> Self {
        let mut cache = Self::new();
        for path in archive_images(images_dir) {
            let Some(reg_number) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some((face, embedding)) = load_one(&path, reg_number, model, store, resize_scale) {
                tracing::debug!(name = %face.display_name, "loaded known face");
                cache.insert(face, embedding);
            }
        }
        tracing::info!(count = cache.len(), dir = %images_dir.display(), "known faces loaded");
        cache
    }
}

/// Supported images in `dir`, sorted by file name.
fn archive_images(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "cannot read image archive");
            return Vec::new();
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_supported_image(p))
        .collect();
    paths.sort();
    paths
}

fn load_one(
    path: &Path,
    reg_number: &str,
    model: &dyn FaceModel,
    store: &dyn RecordStore,
    resize_scale: f32,
) -> Option<(KnownFace, Embedding)> {
    let image = match model.load_image(path) {
        Ok(image) => frame::downscale(&image, resize_scale),
        Err(err) => {
            tracing::warn!(reg_number, path = %path.display(), error = %err, "cannot load archive image");
            return None;
        }
    };

    let fresh = match model.encode_faces(&image) {
        Ok(faces) => match faces.into_iter().next() {
            Some((_, embedding)) => embedding,
            None => {
                tracing::warn!(reg_number, path = %path.display(), "no face in archive image");
                return None;
            }
        },
        Err(err) => {
            tracing::warn!(reg_number, error = %err, "face encoding failed");
            return None;
        }
    };

    let record = match store.hash_get_all(&student_key(reg_number)) {
        Ok(record) if !record.is_empty() => record,
        Ok(_) => {
            tracing::warn!(reg_number, "no student record for archive image");
            return None;
        }
        Err(err) => {
            tracing::warn!(reg_number, error = %err, "student lookup failed");
            return None;
        }
    };

    let name = record.get("name").map(String::as_str).unwrap_or(reg_number);
    let embedding = record
        .get("face_embedding")
        .and_then(|raw| match Embedding::from_json(raw) {
            Ok(stored) => Some(stored),
            Err(err) => {
                tracing::warn!(reg_number, error = %err, "stored embedding unreadable, using archive image");
                None
            }
        })
        .unwrap_or(fresh);

    Some((
        KnownFace {
            display_name: display_name(name, reg_number),
            reg_number: reg_number.to_string(),
        },
        embedding,
    ))
}
