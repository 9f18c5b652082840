//! The face model contract consumed by registration and recognition.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{compare_embeddings, Embedding, FaceBox};
use image::RgbImage;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("model lock poisoned")]
    Poisoned,
}

/// Black-box face capability: locate faces, embed them, compare embeddings.
pub trait FaceModel: Send + Sync {
    /// Decode an image file into RGB.
    fn load_image(&self, path: &Path) -> Result<RgbImage, ModelError> {
        Ok(image::open(path)?.to_rgb8())
    }

    /// Face locations in `image`, most prominent first.
    fn detect_face_locations(&self, image: &RgbImage) -> Result<Vec<FaceBox>, ModelError>;

    /// One embedding per box, in the order of `boxes`.
    fn compute_embeddings(
        &self,
        image: &RgbImage,
        boxes: &[FaceBox],
    ) -> Result<Vec<Embedding>, ModelError>;

    /// One flag per `known` vector: does `query` lie within `tolerance` of it?
    fn compare_embeddings(&self, known: &[Embedding], query: &Embedding, tolerance: f32) -> Vec<bool> {
        compare_embeddings(known, query, tolerance)
    }

    /// Detect then embed every face in `image`.
    fn encode_faces(&self, image: &RgbImage) -> Result<Vec<(FaceBox, Embedding)>, ModelError> {
        let boxes = self.detect_face_locations(image)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.compute_embeddings(image, &boxes)?;
        Ok(boxes.into_iter().zip(embeddings).collect())
    }
}

/// SCRFD + ArcFace backend.
///
/// Both sessions need exclusive access while running, so each sits behind
/// its own mutex; detection for one frame never waits on embedding another.
pub struct OnnxFaceModel {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxFaceModel {
    pub const DETECTOR_FILE: &'static str = "det_10g.onnx";
    pub const RECOGNIZER_FILE: &'static str = "w600k_r50.onnx";

    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
        let detector_path = model_dir.join(Self::DETECTOR_FILE);
        let recognizer_path = model_dir.join(Self::RECOGNIZER_FILE);

        let detector = FaceDetector::load(&detector_path.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&recognizer_path.to_string_lossy())?;

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceModel for OnnxFaceModel {
    fn detect_face_locations(&self, image: &RgbImage) -> Result<Vec<FaceBox>, ModelError> {
        let mut detector = self.detector.lock().map_err(|_| ModelError::Poisoned)?;
        Ok(detector.detect(image)?)
    }

    fn compute_embeddings(
        &self,
        image: &RgbImage,
        boxes: &[FaceBox],
    ) -> Result<Vec<Embedding>, ModelError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let mut recognizer = self.recognizer.lock().map_err(|_| ModelError::Poisoned)?;
        boxes
            .iter()
            .map(|face| recognizer.extract(image, face).map_err(ModelError::from))
            .collect()
    }
}
