//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::ops::ControlFlow;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 1280;
const REQUESTED_HEIGHT: u32 = 720;
const STREAM_BUFFERS: u32 = 4;
/// Undecodable buffers `capture_frame` tolerates before giving up.
pub const MAX_SKIPPED_BUFFERS: u32 = 30;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("no camera could be opened (tried indices {0:?})")]
    NoCamera(Vec<u32>),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG, one JPEG image per buffer.
    Mjpeg,
    /// YUYV 4:2:2 packed.
    Yuyv,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `/dev/video{index}` for each index in order; the first that
    /// opens wins.
    pub fn open_first(indices: &[u32]) -> Result<(u32, Self), CameraError> {
        for &index in indices {
            let path = format!("/dev/video{index}");
            match Camera::open(&path) {
                Ok(camera) => return Ok((index, camera)),
                Err(err) => tracing::warn!(index, error = %err, "camera open failed"),
            }
        }
        Err(CameraError::NoCamera(indices.to_vec()))
    }

    /// Open a V4L2 device by path, negotiating MJPEG or YUYV at 1280×720.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"MJPG");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need MJPG or YUYV)"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "camera opened"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture a single frame, skipping up to [`MAX_SKIPPED_BUFFERS`]
    /// undecodable buffers.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut captured = None;
        let mut skipped = 0;
        self.capture_loop(|result| match result {
            Ok(frame) => {
                captured = Some(Ok(frame));
                ControlFlow::Break(())
            }
            Err(err) => {
                skipped += 1;
                if skipped >= MAX_SKIPPED_BUFFERS {
                    captured = Some(Err(err));
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
        })?;
        captured.unwrap_or_else(|| Err(CameraError::CaptureFailed("stream yielded no frame".into())))
    }

    /// Stream frames into `on_frame` until it breaks or a read fails.
    ///
    /// One mmap stream stays open for the whole loop. Every dequeued buffer
    /// reaches `on_frame`, as a decoded frame or as the decode error, so the
    /// callback can stop even while the device sends garbage. A failed
    /// dequeue ends the loop with an error.
    pub fn capture_loop<F>(&self, on_frame: F) -> Result<(), CameraError>
    where
        F: FnMut(Result<Frame, CameraError>) -> ControlFlow<()>,
    {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        pump(
            || {
                let (buf, meta) = stream
                    .next()
                    .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
                let used = match meta.bytesused as usize {
                    0 => buf.len(),
                    n => n.min(buf.len()),
                };
                let sequence = meta.sequence;
                Ok(self.decode(&buf[..used]).map(|image| Frame {
                    image,
                    timestamp: std::time::Instant::now(),
                    sequence,
                }))
            },
            on_frame,
        )
    }

    fn decode(&self, buf: &[u8]) -> Result<RgbImage, CameraError> {
        let decoded = match self.pixel_format {
            PixelFormat::Mjpeg => frame::decode_mjpeg(buf),
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
        };
        decoded.map_err(|e| CameraError::CaptureFailed(format!("{:?} decode: {e}", self.pixel_format)))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card.clone(),
                    driver: caps.driver.clone(),
                    bus: caps.bus.clone(),
                })
            })
            .collect()
    }
}

/// Feed every buffer from `next` to `on_frame`. The outer error of `next` is
/// a failed read and ends the loop; the inner one is a buffer that did not
/// decode and is handed on.
fn pump<N, F>(mut next: N, mut on_frame: F) -> Result<(), CameraError>
where
    N: FnMut() -> Result<Result<Frame, CameraError>, CameraError>,
    F: FnMut(Result<Frame, CameraError>) -> ControlFlow<()>,
{
    loop {
        if on_frame(next()?).is_break() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-does-not-exist").err();
        assert!(matches!(err, Some(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_open_first_reports_tried_indices() {
        // Indices this high are never present on a test host.
        match Camera::open_first(&[250, 251]) {
            Err(CameraError::NoCamera(tried)) => assert_eq!(tried, vec![250, 251]),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("no camera expected"),
        }
    }

    #[test]
    fn test_open_first_with_no_indices() {
        assert!(matches!(
            Camera::open_first(&[]).err(),
            Some(CameraError::NoCamera(_))
        ));
    }

    fn garbage() -> Result<Frame, CameraError> {
        Err(CameraError::CaptureFailed("MJPEG decode: truncated".into()))
    }

    #[test]
    fn test_pump_hands_decode_errors_to_callback() {
        let mut reads = 0;
        let mut seen = 0;
        let result = pump(
            || {
                reads += 1;
                Ok(garbage())
            },
            |frame| {
                assert!(frame.is_err());
                seen += 1;
                if seen == 5 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        );
        assert!(result.is_ok());
        assert_eq!(reads, 5);
    }

    #[test]
    fn test_pump_stops_on_read_failure() {
        let mut calls = 0;
        let result = pump(
            || Err(CameraError::CaptureFailed("failed to dequeue buffer".into())),
            |_| {
                calls += 1;
                ControlFlow::Continue(())
            },
        );
        assert!(matches!(result, Err(CameraError::CaptureFailed(_))));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_pump_delivers_frames() {
        let mut sequence = 0;
        let mut delivered = Vec::new();
        pump(
            || {
                sequence += 1;
                Ok(Ok(Frame {
                    image: RgbImage::new(2, 2),
                    timestamp: std::time::Instant::now(),
                    sequence,
                }))
            },
            |frame| {
                delivered.push(frame.map(|f| f.sequence).unwrap_or(0));
                if delivered.len() == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )
        .unwrap();
        assert_eq!(delivered, vec![1, 2, 3]);
    }
}
