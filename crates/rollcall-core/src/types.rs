use serde::{Deserialize, Serialize};

/// Location of a detected face in pixel coordinates, with optional landmarks.
///
/// Edges follow the `(top, right, bottom, left)` convention of the capture
/// frame: `left < right`, `top < bottom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Multiply every coordinate (edges and landmarks) by `factor`.
    ///
    /// Used to map a detection on a downscaled frame back onto the
    /// full-resolution frame (`factor = 1 / resize_scale`).
    pub fn scaled(&self, factor: f32) -> FaceBox {
        FaceBox {
            top: self.top * factor,
            right: self.right * factor,
            bottom: self.bottom * factor,
            left: self.left * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|pts| pts.map(|(x, y)| (x * factor, y * factor))),
        }
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let inter_w = (self.right.min(other.right) - self.left.max(other.left)).max(0.0);
        let inter_h = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Fixed-length face embedding (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance. Vectors of different length never match:
    /// the distance is `f32::INFINITY`.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Serialize as a JSON number array, the stored `face_embedding` format.
    pub fn to_json(&self) -> String {
        // A Vec<f32> always serializes; non-finite values become `null`.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let values: Vec<f32> = serde_json::from_str(raw)?;
        Ok(Self { values })
    }
}

/// Compare `query` against every known embedding.
///
/// Returns one flag per entry of `known`, in order: `true` when the
/// Euclidean distance is within `tolerance`.
pub fn compare_embeddings(known: &[Embedding], query: &Embedding, tolerance: f32) -> Vec<bool> {
    known
        .iter()
        .map(|k| k.distance(query) <= tolerance)
        .collect()
}
