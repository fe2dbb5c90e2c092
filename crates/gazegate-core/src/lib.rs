//! gazegate-core — gaze classification and capture logic.
//!
//! Pure, I/O-free building blocks of the verification flow: the per-frame gaze
//! classifier, the debounced capture state machine that consumes it, and the
//! identifier policy applied to server-held candidate galleries.

pub mod candidates;
pub mod capture;
pub mod gaze;
pub mod reference;

pub use candidates::{parse_candidate_id, CandidateFilter, CandidateList};
pub use capture::{CaptureMachine, CaptureSession, CaptureState, CaptureTicket};
pub use gaze::{classify, evaluate, FaceObservation, GazeCheck, GazeThresholds, ThresholdError};
pub use reference::{reference_file_name, RegistrationError};
