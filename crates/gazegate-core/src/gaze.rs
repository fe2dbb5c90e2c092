//! Gaze classification: is the detected face looking attentively at the lens?
//!
//! A face passes when its head pose is within symmetric angular bounds around
//! zero on all three axes and both eyes are reported open with at least the
//! configured probability. Bounds are inclusive: a value exactly at the limit
//! passes.
//!
//! The thresholds are deployment policy. Observed profiles range from a strict
//! 3° pitch limit with 0.7 eye-open probability to a lenient 10° limit with 0.5,
//! so nothing here is hard-coded beyond the [`Default`] profile.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One detected face in one frame, as reported by the face-detection collaborator.
///
/// Field names serialise in camelCase to match the detector's native output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceObservation {
    /// Up/down head tilt in signed degrees.
    pub pitch_angle: f32,
    /// Sideways (shoulder) head tilt in signed degrees.
    pub roll_angle: f32,
    /// Left/right head rotation in signed degrees.
    pub yaw_angle: f32,
    pub left_eye_open_probability: f32,
    pub right_eye_open_probability: f32,
}

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("{name} must be a finite, non-negative angle in degrees (got {value})")]
    InvalidAngle { name: &'static str, value: f32 },
    #[error("min_eye_open_probability must be within [0, 1] (got {0})")]
    InvalidProbability(f32),
}

/// Immutable gaze thresholds for a session.
///
/// Construct with [`GazeThresholds::new`], which enforces that every angular
/// bound is non-negative and the eye-open probability lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GazeThresholds {
    max_pitch_deg: f32,
    max_roll_deg: f32,
    max_yaw_deg: f32,
    min_eye_open_probability: f32,
}

impl GazeThresholds {
    pub fn new(
        max_pitch_deg: f32,
        max_roll_deg: f32,
        max_yaw_deg: f32,
        min_eye_open_probability: f32,
    ) -> Result<Self, ThresholdError> {
        check_angle("max_pitch_deg", max_pitch_deg)?;
        check_angle("max_roll_deg", max_roll_deg)?;
        check_angle("max_yaw_deg", max_yaw_deg)?;
        if !(0.0..=1.0).contains(&min_eye_open_probability) {
            return Err(ThresholdError::InvalidProbability(min_eye_open_probability));
        }

        Ok(Self {
            max_pitch_deg,
            max_roll_deg,
            max_yaw_deg,
            min_eye_open_probability,
        })
    }

    pub fn max_pitch_deg(&self) -> f32 {
        self.max_pitch_deg
    }

    pub fn max_roll_deg(&self) -> f32 {
        self.max_roll_deg
    }

    pub fn max_yaw_deg(&self) -> f32 {
        self.max_yaw_deg
    }

    pub fn min_eye_open_probability(&self) -> f32 {
        self.min_eye_open_probability
    }
}

impl Default for GazeThresholds {
    /// The strict capture-screen profile: 3° pitch, 10° roll and yaw, eyes 70% open.
    fn default() -> Self {
        Self {
            max_pitch_deg: 3.0,
            max_roll_deg: 10.0,
            max_yaw_deg: 10.0,
            min_eye_open_probability: 0.7,
        }
    }
}

fn check_angle(name: &'static str, value: f32) -> Result<(), ThresholdError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ThresholdError::InvalidAngle { name, value })
    }
}

/// Breakdown of a single classification, useful for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GazeCheck {
    pub pose_ok: bool,
    pub eyes_open: bool,
}

impl GazeCheck {
    pub fn passed(&self) -> bool {
        self.pose_ok && self.eyes_open
    }
}

/// Evaluate both gaze conditions separately.
pub fn evaluate(observation: &FaceObservation, thresholds: &GazeThresholds) -> GazeCheck {
    // NaN compares false against every bound, so a garbage pose never passes.
    let pose_ok = observation.pitch_angle.abs() <= thresholds.max_pitch_deg
        && observation.roll_angle.abs() <= thresholds.max_roll_deg
        && observation.yaw_angle.abs() <= thresholds.max_yaw_deg;

    let eyes_open = observation.left_eye_open_probability >= thresholds.min_eye_open_probability
        && observation.right_eye_open_probability >= thresholds.min_eye_open_probability;

    GazeCheck { pose_ok, eyes_open }
}

/// Returns true iff the face is looking at the lens with both eyes open.
pub fn classify(observation: &FaceObservation, thresholds: &GazeThresholds) -> bool {
    evaluate(observation, thresholds).passed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenient() -> GazeThresholds {
        GazeThresholds::new(10.0, 10.0, 10.0, 0.5).unwrap()
    }

    fn face(pitch: f32, roll: f32, yaw: f32, left: f32, right: f32) -> FaceObservation {
        FaceObservation {
            pitch_angle: pitch,
            roll_angle: roll,
            yaw_angle: yaw,
            left_eye_open_probability: left,
            right_eye_open_probability: right,
        }
    }

    #[test]
    fn test_centered_open_eyes_passes() {
        assert!(classify(&face(5.0, -5.0, 0.0, 0.9, 0.9), &lenient()));
    }

    #[test]
    fn test_pitch_out_of_bounds_fails() {
        assert!(!classify(&face(15.0, -5.0, 0.0, 0.9, 0.9), &lenient()));
    }

    #[test]
    fn test_each_single_bound_violation_fails() {
        let t = lenient();
        let violations = [
            face(-10.5, 0.0, 0.0, 0.9, 0.9),
            face(0.0, 10.5, 0.0, 0.9, 0.9),
            face(0.0, 0.0, -10.5, 0.9, 0.9),
            face(0.0, 0.0, 0.0, 0.49, 0.9),
            face(0.0, 0.0, 0.0, 0.9, 0.49),
        ];
        for obs in violations {
            assert!(!classify(&obs, &t), "expected fail for {obs:?}");
        }
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let t = lenient();
        assert!(classify(&face(10.0, -10.0, 10.0, 0.5, 0.5), &t));
        assert!(classify(&face(-10.0, 10.0, -10.0, 0.5, 0.5), &t));
    }

    #[test]
    fn test_evaluate_reports_which_condition_failed() {
        let t = lenient();
        let check = evaluate(&face(0.0, 0.0, 30.0, 0.9, 0.9), &t);
        assert!(!check.pose_ok);
        assert!(check.eyes_open);

        let check = evaluate(&face(0.0, 0.0, 0.0, 0.1, 0.9), &t);
        assert!(check.pose_ok);
        assert!(!check.eyes_open);
    }

    #[test]
    fn test_nan_pose_fails() {
        assert!(!classify(&face(f32::NAN, 0.0, 0.0, 0.9, 0.9), &lenient()));
    }

    #[test]
    fn test_default_profile_is_strict_on_pitch() {
        let t = GazeThresholds::default();
        assert!(classify(&face(3.0, 0.0, 0.0, 0.7, 0.7), &t));
        assert!(!classify(&face(5.0, 0.0, 0.0, 0.9, 0.9), &t));
    }

    #[test]
    fn test_rejects_invalid_thresholds() {
        assert_eq!(
            GazeThresholds::new(-1.0, 10.0, 10.0, 0.5),
            Err(ThresholdError::InvalidAngle {
                name: "max_pitch_deg",
                value: -1.0
            })
        );
        assert!(GazeThresholds::new(10.0, f32::INFINITY, 10.0, 0.5).is_err());
        assert_eq!(
            GazeThresholds::new(10.0, 10.0, 10.0, 1.5),
            Err(ThresholdError::InvalidProbability(1.5))
        );
        assert!(GazeThresholds::new(10.0, 10.0, 10.0, f32::NAN).is_err());
    }

    #[test]
    fn test_observation_uses_detector_field_names() {
        let json = r#"{"pitchAngle":1.0,"rollAngle":2.0,"yawAngle":-3.0,
            "leftEyeOpenProbability":0.8,"rightEyeOpenProbability":0.75}"#;
        let obs: FaceObservation = serde_json::from_str(json).unwrap();
        assert_eq!(obs, face(1.0, 2.0, -3.0, 0.8, 0.75));
    }
}
