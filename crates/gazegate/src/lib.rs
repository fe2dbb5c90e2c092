//! gazegate — runtime for gaze-triggered identity verification.
//!
//! A frame pipeline thread samples the camera and runs face detection; the
//! capture controller consumes those samples, fires the shutter once the user
//! has been looking at the camera long enough, and hands the photo to a
//! [`verify::Verifier`]. The candidate verifier compares it against a
//! server-held gallery one candidate at a time.

pub mod camera;
pub mod config;
pub mod imaging;
pub mod janitor;
pub mod matcher;
pub mod pipeline;
pub mod remote;
pub mod session;
pub mod verify;

pub use camera::{Camera, CameraError, DetectError, DetectedFace, FaceDetector, Frame, FrameSource, Permission};
pub use config::{Config, ConfigError};
pub use matcher::{CandidateFailurePolicy, CandidateMatcher, MatchError, MatchOutcome, MatchProgress};
pub use pipeline::{spawn_pipeline, FrameSample, PipelineGate, PipelineHandle, PipelineOptions};
pub use remote::{HttpRemote, Location, RemoteError, Verdict};
pub use session::{CaptureController, ScreenEvent, SessionEnd, SessionEvent};
pub use verify::{Alert, CandidateOrigin, CandidateVerifier, VerificationOutcome, Verifier, VerifyError};
