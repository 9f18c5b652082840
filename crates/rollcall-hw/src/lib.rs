//! rollcall-hw — Camera acquisition and frame processing.
//!
//! Provides V4L2 capture decoded to RGB, plus the frame operations the
//! recognition loop needs: downscaling, annotation, JPEG encoding.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Annotator, Frame, FrameError};
