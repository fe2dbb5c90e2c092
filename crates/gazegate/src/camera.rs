//! Device-side collaborators: camera shutter, raw frame acquisition, face detection.
//!
//! Real implementations wrap the platform camera stack and a landmark/pose
//! model. The runtime only depends on these traits.

use std::future::Future;
use std::path::PathBuf;

use gazegate_core::FaceObservation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera is not ready to take a photo")]
    NotReady,
    #[error("photo capture failed: {0}")]
    Capture(String),
    #[error("frame acquisition failed: {0}")]
    Frame(String),
    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("face detection failed: {0}")]
    Failed(String),
    #[error("malformed detection result: {0}")]
    Malformed(String),
}

/// One raw frame, opaque to everything except the detector.
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaceBounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A detector result. Only `observation` ever leaves the frame-processing thread.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bounds: FaceBounds,
    pub observation: FaceObservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

/// Produces raw frames on the frame-processing thread.
pub trait FrameSource: Send + 'static {
    /// Next frame, or `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}

/// Face landmark/pose detection. Called synchronously, once per sampled frame.
pub trait FaceDetector: Send + 'static {
    /// Faces in `frame`, primary face first.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectError>;
}

/// Front camera shutter and activation toggle.
pub trait Camera: Send + Sync + 'static {
    fn request_permission(&self) -> impl Future<Output = Permission> + Send;

    /// Take a photo and return the local path it was written to.
    ///
    /// Must fail with [`CameraError::NotReady`] rather than silently returning
    /// when the device cannot shoot.
    fn capture_photo(&self) -> impl Future<Output = Result<PathBuf, CameraError>> + Send;

    fn set_active(&self, active: bool);
}
