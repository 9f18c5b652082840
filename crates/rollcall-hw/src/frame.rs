//! Frame type and image operations — pixel decoding, downscaling,
//! annotation, JPEG encoding.

use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

/// Box colour for a recognised face.
pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Box colour for an unrecognised face.
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const LABEL_HEIGHT: u32 = 24;
const LABEL_SCALE: f32 = 20.0;
const BOX_THICKNESS: i32 = 2;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = (self.image.width() * self.image.height()) as usize;
        if pixels == 0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p) as f32).sum::<f32>() / pixels as f32
    }
}

fn luma(p: &Rgb<u8>) -> u8 {
    ((299 * p[0] as u32 + 587 * p[1] as u32 + 114 * p[2] as u32) / 1000) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
    #[error("font error: {0}")]
    Font(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert packed YUYV 4:2:2 to RGB (BT.601, studio range).
///
/// Every 4 bytes `[Y0, U, Y1, V]` carry two horizontally adjacent pixels
/// that share one chroma sample.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width as usize) * (height as usize) * 2;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (chunk[1] as i32 - 128, chunk[3] as i32 - 128);
        for y in [chunk[0], chunk[2]] {
            let c = 298 * (y as i32 - 16);
            let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
            rgb.push(clamp(c + 409 * v));
            rgb.push(clamp(c - 100 * u - 208 * v));
            rgb.push(clamp(c + 516 * u));
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Decode one MJPEG buffer.
pub fn decode_mjpeg(buf: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?.to_rgb8())
}

/// Shrink `image` by `scale` (0 < scale < 1). Other scales return a copy.
pub fn downscale(image: &RgbImage, scale: f32) -> RgbImage {
    if !(scale > 0.0 && scale < 1.0) {
        return image.clone();
    }
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}

/// Encode as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(out)
}

/// Draws face boxes and name labels onto frames.
///
/// Label text needs a font; without one only the box and label bar are
/// drawn.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self { font }
    }

    /// Load a TTF/OTF font from disk.
    pub fn with_font_file(path: &Path) -> Result<Self, FrameError> {
        let bytes = std::fs::read(path)?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| FrameError::Font(e.to_string()))?;
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Outline `(left, top, right, bottom)` and put `label` above it.
    pub fn draw(&self, image: &mut RgbImage, bounds: (i32, i32, i32, i32), label: &str, color: Rgb<u8>) {
        let (left, top, right, bottom) = bounds;
        if right <= left || bottom <= top {
            return;
        }

        for inset in 0..BOX_THICKNESS {
            let w = (right - left - 2 * inset).max(1) as u32;
            let h = (bottom - top - 2 * inset).max(1) as u32;
            draw_hollow_rect_mut(image, Rect::at(left + inset, top + inset).of_size(w, h), color);
        }

        let bar_top = (top - LABEL_HEIGHT as i32).max(0);
        let bar = Rect::at(left, bar_top).of_size((right - left) as u32, LABEL_HEIGHT);
        draw_filled_rect_mut(image, bar, color);

        if let Some(font) = &self.font {
            draw_text_mut(
                image,
                Rgb([255, 255, 255]),
                left + 4,
                bar_top + 2,
                PxScale::from(LABEL_SCALE),
                font,
                label,
            );
        }
    }
}
