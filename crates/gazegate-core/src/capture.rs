//! Debounced auto-capture state machine.
//!
//! ```text
//!            N consecutive passes          focused, idle shutter,
//!   Idle ──────────────────────────▶ Gazing ─── precondition ready ──▶ Capturing
//!    ▲  ◀── any failed sample ──────┘                                     │
//!    └──────────────────── finish(ticket) ◀───────────────────────────────┘
//!
//!   any state ── blur / permission revoked ──▶ Suspended ── focus ──▶ Idle
//! ```
//!
//! The machine is synchronous and owns no I/O. Each trigger hands out a
//! [`CaptureTicket`] stamped with the current generation; every focus, blur
//! or teardown bumps the generation, so a result that comes back for an
//! abandoned cycle is recognised as stale and discarded instead of being
//! applied to a session that no longer exists.

use std::num::NonZeroU32;
use std::path::PathBuf;

use serde::Serialize;

use crate::gaze::{classify, FaceObservation, GazeThresholds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Gazing,
    Capturing,
    Suspended,
}

/// Transient flags of one capture screen session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSession {
    pub is_gazing: bool,
    /// Mutual exclusion for the shutter. Set before any async step begins.
    pub is_capturing: bool,
    pub is_camera_live: bool,
    pub captured_photo_path: Option<PathBuf>,
}

/// Permission to run one capture cycle, valid only for the generation that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTicket {
    generation: u64,
}

impl CaptureTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct CaptureMachine {
    debounce_window: NonZeroU32,
    streak: u32,
    state: CaptureState,
    focused: bool,
    permission_granted: bool,
    generation: u64,
    session: CaptureSession,
}

impl CaptureMachine {
    /// A freshly mounted, focused screen with camera permission assumed.
    ///
    /// `debounce_window` is the number of consecutive passing samples needed
    /// before the subject counts as gazing. A window of one triggers on a
    /// single frame.
    pub fn new(debounce_window: NonZeroU32) -> Self {
        Self {
            debounce_window,
            streak: 0,
            state: CaptureState::Idle,
            focused: true,
            permission_granted: true,
            generation: 0,
            session: CaptureSession {
                is_camera_live: true,
                ..CaptureSession::default()
            },
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// Whether frame samples are currently being consumed.
    pub fn accepts_samples(&self) -> bool {
        matches!(self.state, CaptureState::Idle | CaptureState::Gazing)
    }

    /// Feed the latest sample. `None` (no face in frame) counts as not gazing.
    ///
    /// Samples arriving while capturing or suspended are dropped. Returns a
    /// ticket when the sample completes the debounce window and the capture
    /// may start immediately.
    pub fn observe(
        &mut self,
        face: Option<&FaceObservation>,
        thresholds: &GazeThresholds,
        precondition_ready: bool,
    ) -> Option<CaptureTicket> {
        if !self.accepts_samples() {
            tracing::trace!(state = ?self.state, "sample dropped");
            return None;
        }

        let passed = face.is_some_and(|f| classify(f, thresholds));
        if !passed {
            self.streak = 0;
            if self.state == CaptureState::Gazing {
                tracing::debug!("gaze lost");
                self.state = CaptureState::Idle;
            }
            self.session.is_gazing = false;
            return None;
        }

        self.streak = self.streak.saturating_add(1);
        if self.streak < self.debounce_window.get() {
            tracing::trace!(
                streak = self.streak,
                window = self.debounce_window.get(),
                "gaze sample passed, debouncing"
            );
            return None;
        }

        if self.state == CaptureState::Idle {
            tracing::debug!(streak = self.streak, "gazing");
            self.state = CaptureState::Gazing;
            self.session.is_gazing = true;
        }

        self.try_trigger(precondition_ready)
    }

    /// Re-check a pending trigger when the external precondition changes.
    pub fn precondition_changed(&mut self, ready: bool) -> Option<CaptureTicket> {
        if self.state == CaptureState::Gazing {
            self.try_trigger(ready)
        } else {
            None
        }
    }

    fn try_trigger(&mut self, precondition_ready: bool) -> Option<CaptureTicket> {
        if !self.focused || self.session.is_capturing {
            return None;
        }
        if !precondition_ready {
            tracing::debug!("gazing but precondition unavailable, waiting");
            return None;
        }

        self.state = CaptureState::Capturing;
        self.session.is_capturing = true;
        self.streak = 0;
        tracing::info!(generation = self.generation, "capture triggered");

        Some(CaptureTicket {
            generation: self.generation,
        })
    }

    fn is_current(&self, ticket: &CaptureTicket) -> bool {
        ticket.generation == self.generation && self.state == CaptureState::Capturing
    }

    /// Record the photo taken for `ticket` and pause the camera.
    ///
    /// Returns the previously held photo (now owned by the caller for
    /// deletion), or hands `path` back as `Err` when the ticket is stale.
    pub fn photo_captured(
        &mut self,
        ticket: &CaptureTicket,
        path: PathBuf,
    ) -> Result<Option<PathBuf>, PathBuf> {
        if !self.is_current(ticket) {
            return Err(path);
        }
        self.session.is_camera_live = false;
        Ok(self.session.captured_photo_path.replace(path))
    }

    /// Complete the cycle for `ticket`, whatever its outcome.
    ///
    /// Returns false, changing nothing, when the ticket belongs to an
    /// abandoned generation.
    pub fn finish(&mut self, ticket: &CaptureTicket) -> bool {
        if !self.is_current(ticket) {
            tracing::debug!(
                ticket = ticket.generation,
                current = self.generation,
                "stale capture result discarded"
            );
            return false;
        }

        self.state = CaptureState::Idle;
        self.streak = 0;
        self.session.is_gazing = false;
        self.session.is_capturing = false;
        self.session.is_camera_live = true;
        tracing::debug!("capture cycle finished");
        true
    }

    /// Screen lost focus: suspend and abandon any cycle in flight.
    pub fn blur(&mut self) {
        self.focused = false;
        self.suspend();
    }

    pub fn permission_revoked(&mut self) {
        self.permission_granted = false;
        self.suspend();
    }

    pub fn permission_granted(&mut self) {
        self.permission_granted = true;
        if self.focused && self.state == CaptureState::Suspended {
            self.state = CaptureState::Idle;
            self.session.is_camera_live = true;
        }
    }

    fn suspend(&mut self) {
        self.generation += 1;
        self.state = CaptureState::Suspended;
        self.streak = 0;
        self.session.is_gazing = false;
        self.session.is_capturing = false;
        self.session.is_camera_live = false;
        tracing::debug!(generation = self.generation, "suspended");
    }

    /// Screen regained focus: reset the session.
    ///
    /// Returns the photo left over from the previous session so the caller
    /// can delete it.
    pub fn focus(&mut self) -> Option<PathBuf> {
        self.focused = true;
        self.generation += 1;
        self.streak = 0;
        let leftover = self.session.captured_photo_path.take();
        self.session = CaptureSession::default();

        if self.permission_granted {
            self.state = CaptureState::Idle;
            self.session.is_camera_live = true;
        } else {
            self.state = CaptureState::Suspended;
        }
        tracing::debug!(generation = self.generation, state = ?self.state, "focused");
        leftover
    }

    /// Screen unmounted. Returns the photo still owned by the session.
    pub fn teardown(&mut self) -> Option<PathBuf> {
        self.focused = false;
        self.suspend();
        self.session.captured_photo_path.take()
    }
}
