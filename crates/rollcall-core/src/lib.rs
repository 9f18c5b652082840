//! rollcall-core — Face model contract and the bundled ONNX backend.
//!
//! The attendance system consumes faces through [`FaceModel`]: load an
//! image, locate faces, embed them, and compare embeddings under a distance
//! tolerance. [`OnnxFaceModel`] implements it with SCRFD for detection and
//! ArcFace for recognition.

pub mod alignment;
pub mod detector;
pub mod model;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use model::{FaceModel, ModelError, OnnxFaceModel};
pub use types::{compare_embeddings, Embedding, FaceBox};

/// Default directory holding `det_10g.onnx` and `w600k_r50.onnx`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
