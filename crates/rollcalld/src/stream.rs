//! Camera worker and the multipart JPEG video feed.
//!
//! One OS thread owns the camera. It captures only while at least one
//! client is subscribed, runs every frame through the attendance engine,
//! and fans the encoded parts out over a broadcast channel.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, Thread};
use std::time::Duration;

use axum::body::Bytes;
use rollcall_attendance::status::CAMERA_DISCONNECTED_STATUS;
use rollcall_attendance::AttendanceEngine;
use rollcall_hw::frame::{self, Annotator};
use rollcall_hw::{Camera, Frame};
use tokio::sync::broadcast;

/// Multipart boundary used by `/video_feed`.
pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const JPEG_QUALITY: u8 = 80;
/// Frames buffered per client before the slowest one starts skipping.
const CHANNEL_CAPACITY: usize = 4;
const IDLE_POLL: Duration = Duration::from_millis(500);

/// One multipart part carrying a JPEG frame.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// State shared between the worker thread and the HTTP handlers.
struct Shared {
    /// `None` once the camera has failed; dropping the sender ends every
    /// client stream.
    sender: Mutex<Option<broadcast::Sender<Bytes>>>,
    stop: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender: Mutex::new(Some(tx)),
            stop: AtomicBool::new(false),
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Bytes>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    fn subscribers(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn send(&self, part: Bytes) {
        if let Some(tx) = self.sender.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            // Err only means every client left since the last check.
            let _ = tx.send(part);
        }
    }

    fn close(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Handle to the camera worker.
pub struct VideoFeed {
    shared: Arc<Shared>,
    worker: Thread,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl VideoFeed {
    /// Move `camera` onto a dedicated `rollcall-camera` thread.
    pub fn spawn(camera: Camera, engine: Arc<AttendanceEngine>, annotator: Annotator) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::new());
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("rollcall-camera".into())
            .spawn(move || run_worker(&camera, &engine, &annotator, &worker_shared))?;

        Ok(Self {
            shared,
            worker: handle.thread().clone(),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Join the stream. `None` once the camera has failed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Bytes>> {
        let rx = self.shared.subscribe()?;
        self.worker.unpark();
        Some(rx)
    }

    /// Ask the worker to stop and end every client stream.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.close();
        self.worker.unpark();
    }

    /// Stop the worker and wait for it to release the camera.
    pub fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("camera worker panicked");
            }
        }
    }
}

fn run_worker(camera: &Camera, engine: &AttendanceEngine, annotator: &Annotator, shared: &Shared) {
    tracing::info!(device = %camera.device_path, "camera worker started");
    while !shared.stopping() {
        if shared.subscribers() == 0 {
            std::thread::park_timeout(IDLE_POLL);
            continue;
        }

        tracing::debug!(clients = shared.subscribers(), "streaming");
        let result = camera.capture_loop(|captured| {
            if shared.stopping() || shared.subscribers() == 0 {
                return ControlFlow::Break(());
            }
            match captured {
                Ok(frame) => {
                    if let Some(part) = render(engine, annotator, frame) {
                        shared.send(part);
                    }
                }
                Err(err) => tracing::debug!(error = %err, "skipping undecodable buffer"),
            }
            ControlFlow::Continue(())
        });

        if let Err(err) = result {
            tracing::error!(error = %err, "camera read failed, ending video stream");
            engine.set_status(CAMERA_DISCONNECTED_STATUS);
            shared.close();
            break;
        }
    }
    tracing::info!("camera worker exiting");
}

/// Recognise, annotate and encode one frame. Failures skip the frame.
fn render(engine: &AttendanceEngine, annotator: &Annotator, frame: Frame) -> Option<Bytes> {
    let sequence = frame.sequence;
    let mut image = frame.image;
    if let Err(err) = engine.process_frame(&mut image, annotator) {
        tracing::warn!(seq = sequence, error = %err, "frame processing failed, skipping");
        return None;
    }
    match frame::encode_jpeg(&image, JPEG_QUALITY) {
        Ok(jpeg) => Some(multipart_part(&jpeg)),
        Err(err) => {
            tracing::warn!(seq = sequence, error = %err, "frame encoding failed, skipping");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let expected: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n";
        assert_eq!(&part[..], expected);
        assert!(CONTENT_TYPE.ends_with(&format!("boundary={BOUNDARY}")));
    }

    #[tokio::test]
    async fn test_subscribers_receive_parts() {
        let shared = Shared::new();
        assert_eq!(shared.subscribers(), 0);
        let mut rx = shared.subscribe().unwrap();
        assert_eq!(shared.subscribers(), 1);

        shared.send(multipart_part(b"jpeg"));
        let part = rx.recv().await.unwrap();
        assert!(part.starts_with(b"--frame\r\n"));

        drop(rx);
        assert_eq!(shared.subscribers(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let shared = Shared::new();
        let mut rx = shared.subscribe().unwrap();
        shared.close();
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert!(shared.subscribe().is_none());
        assert_eq!(shared.subscribers(), 0);
    }
}
