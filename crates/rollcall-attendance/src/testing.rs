//! Test doubles shared by the unit tests.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use image::{Rgb, RgbImage};
use rollcall_core::{Embedding, FaceBox, FaceModel, ModelError};

use crate::clock::Clock;

/// Sees one whole-image face whenever pixel (0, 0) is not black; the
/// embedding is that pixel's colour scaled to `[0, 1]`.
pub struct StubFaceModel;

impl FaceModel for StubFaceModel {
    fn detect_face_locations(&self, image: &RgbImage) -> Result<Vec<FaceBox>, ModelError> {
        if image.width() == 0 || image.get_pixel(0, 0).0 == [0, 0, 0] {
            return Ok(Vec::new());
        }
        Ok(vec![FaceBox {
            top: 0.0,
            right: image.width() as f32,
            bottom: image.height() as f32,
            left: 0.0,
            confidence: 1.0,
            landmarks: None,
        }])
    }

    fn compute_embeddings(&self, image: &RgbImage, boxes: &[FaceBox]) -> Result<Vec<Embedding>, ModelError> {
        Ok(boxes.iter().map(|_| colour_embedding(*image.get_pixel(0, 0))).collect())
    }
}

pub fn colour_embedding(colour: Rgb<u8>) -> Embedding {
    Embedding::new(colour.0.iter().map(|&c| c as f32 / 255.0).collect())
}

/// Solid-colour 16x16 PNG at `path`.
pub fn write_face_image(path: &Path, colour: Rgb<u8>) {
    RgbImage::from_pixel(16, 16, colour).save(path).unwrap();
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// 2024-09-02 08:00:00.
    pub fn at_start_of_term() -> Self {
        let start = NaiveDate::from_ymd_opt(2024, 9, 2)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .unwrap();
        Self::new(start)
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
