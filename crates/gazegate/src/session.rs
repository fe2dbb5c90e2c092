//! Capture controller: the async consumer side of the capture screen.
//!
//! A single task owns the [`CaptureMachine`] and multiplexes frame samples,
//! screen lifecycle events, location updates and the completions of capture
//! cycles. Each cycle (photo, then downstream verification) runs on its own
//! task and reports back through one channel, tagged with the ticket it was
//! started under. Reports for an abandoned generation are discarded and their
//! files deleted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gazegate_core::{CaptureMachine, CaptureState, CaptureTicket, GazeThresholds};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::camera::{Camera, Permission};
use crate::config::Config;
use crate::janitor::discard;
use crate::matcher::MatchProgress;
use crate::pipeline::{FrameSample, PipelineGate};
use crate::remote::Location;
use crate::verify::{Alert, VerificationOutcome, Verifier, VerifyContext, VerifyError, VerifyNotice};

/// How long teardown waits for in-flight cycles to report back.
const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

/// Capture screen lifecycle, as reported by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenEvent {
    Focus,
    Blur,
    PermissionRevoked,
    PermissionGranted,
    Unmount,
}

/// What the presentation layer is told.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    State(CaptureState),
    Progress(MatchProgress),
    Alert(Alert),
    Outcome(VerificationOutcome),
}

/// Why [`CaptureController::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Unmounted,
    Cancelled,
    PermissionDenied,
    /// The frame pipeline stopped and no cycle was left in flight.
    SourceEnded,
}

enum CycleMessage {
    PhotoTaken {
        ticket: CaptureTicket,
        path: PathBuf,
    },
    Notice {
        ticket: CaptureTicket,
        notice: VerifyNotice,
    },
    Done {
        ticket: CaptureTicket,
        result: Result<VerificationOutcome, VerifyError>,
    },
}

pub struct CaptureController<C, V> {
    camera: Arc<C>,
    verifier: Arc<V>,
    gate: PipelineGate,
    thresholds: GazeThresholds,
    require_location: bool,
    machine: CaptureMachine,
    location: Option<Location>,
    /// Matched artifact retained from the last confirmed cycle of this session.
    artifact: Option<PathBuf>,
    in_flight: usize,
    camera_active: Option<bool>,
    published: Option<CaptureState>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl<C, V> CaptureController<C, V>
where
    C: Camera,
    V: Verifier,
{
    pub fn new(config: &Config, camera: C, verifier: V, gate: PipelineGate) -> Self {
        Self {
            camera: Arc::new(camera),
            verifier: Arc::new(verifier),
            gate,
            thresholds: config.thresholds,
            require_location: config.require_location,
            machine: CaptureMachine::new(config.debounce_window),
            location: None,
            artifact: None,
            in_flight: 0,
            camera_active: None,
            published: None,
            events: None,
        }
    }

    /// Drive the capture screen until it is unmounted, cancelled, denied
    /// camera access, or its frame source ends.
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<FrameSample>,
        mut screen: mpsc::Receiver<ScreenEvent>,
        mut location: watch::Receiver<Option<Location>>,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) -> SessionEnd {
        self.events = Some(events);
        let (cycle_tx, mut cycle_rx) = mpsc::unbounded_channel::<CycleMessage>();

        if self.camera.request_permission().await == Permission::Denied {
            tracing::warn!("camera permission denied");
            self.machine.permission_revoked();
            self.emit(SessionEvent::Alert(Alert::new(
                "Camera permission",
                "Camera access is required to verify your identity.",
            )));
            self.teardown(&mut cycle_rx).await;
            return SessionEnd::PermissionDenied;
        }

        self.location = *location.borrow_and_update();
        self.sync_devices();
        self.publish_state();
        tracing::info!(generation = self.machine.generation(), "capture session started");

        let mut samples_open = true;
        let mut screen_open = true;
        let mut location_open = true;

        let end = loop {
            if !samples_open && self.in_flight == 0 {
                tracing::info!("frame source ended");
                break SessionEnd::SourceEnded;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break SessionEnd::Cancelled,

                event = screen.recv(), if screen_open => match event {
                    Some(ScreenEvent::Unmount) => break SessionEnd::Unmounted,
                    Some(event) => self.on_screen(event).await,
                    None => screen_open = false,
                },

                Some(message) = cycle_rx.recv() => self.on_cycle(message).await,

                changed = location.changed(), if location_open => match changed {
                    Ok(()) => {
                        self.location = *location.borrow_and_update();
                        tracing::debug!(known = self.location.is_some(), "location updated");
                        if let Some(ticket) = self.machine.precondition_changed(self.precondition_ready()) {
                            self.start_cycle(ticket, &cycle_tx);
                        }
                    }
                    Err(_) => location_open = false,
                },

                sample = samples.recv(), if samples_open => match sample {
                    Some(sample) => self.on_sample(sample, &cycle_tx),
                    None => samples_open = false,
                },
            }
        };

        self.teardown(&mut cycle_rx).await;
        tracing::info!(reason = ?end, "capture session ended");
        end
    }

    fn precondition_ready(&self) -> bool {
        !self.require_location || self.location.is_some()
    }

    fn on_sample(&mut self, sample: FrameSample, cycle_tx: &mpsc::UnboundedSender<CycleMessage>) {
        tracing::trace!(seq = sample.seq, face = sample.face.is_some(), "sample");
        let ready = self.precondition_ready();
        let ticket = self
            .machine
            .observe(sample.face.as_ref(), &self.thresholds, ready);
        match ticket {
            Some(ticket) => self.start_cycle(ticket, cycle_tx),
            None => self.publish_state(),
        }
    }

    async fn on_screen(&mut self, event: ScreenEvent) {
        tracing::debug!(?event, "screen event");
        match event {
            ScreenEvent::Focus => {
                let leftover = self.machine.focus();
                self.release_session_files(leftover).await;
            }
            ScreenEvent::Blur => self.machine.blur(),
            ScreenEvent::PermissionRevoked => self.machine.permission_revoked(),
            ScreenEvent::PermissionGranted => self.machine.permission_granted(),
            ScreenEvent::Unmount => {}
        }
        self.sync_devices();
        self.publish_state();
    }

    fn start_cycle(&mut self, ticket: CaptureTicket, cycle_tx: &mpsc::UnboundedSender<CycleMessage>) {
        self.in_flight += 1;
        self.sync_devices();
        self.publish_state();

        let cycle = tokio::spawn(run_cycle(
            Arc::clone(&self.camera),
            Arc::clone(&self.verifier),
            self.location,
            ticket,
            cycle_tx.clone(),
        ));

        // Report completion even when the cycle task panics, after anything it sent.
        let done = cycle_tx.clone();
        tokio::spawn(async move {
            let result = match cycle.await {
                Ok(result) => result,
                Err(e) => Err(VerifyError::Aborted(e.to_string())),
            };
            let _ = done.send(CycleMessage::Done { ticket, result });
        });
    }

    async fn on_cycle(&mut self, message: CycleMessage) {
        match message {
            CycleMessage::PhotoTaken { ticket, path } => {
                match self.machine.photo_captured(&ticket, path) {
                    Ok(previous) => {
                        if let Some(previous) = previous {
                            discard(&previous).await;
                        }
                    }
                    Err(stale) => {
                        tracing::debug!(ticket = ticket.generation(), "photo from abandoned cycle");
                        discard(&stale).await;
                    }
                }
                self.sync_devices();
            }
            CycleMessage::Notice { ticket, notice } => {
                if ticket.generation() != self.machine.generation() {
                    return;
                }
                match notice {
                    VerifyNotice::Progress(progress) => self.emit(SessionEvent::Progress(progress)),
                    VerifyNotice::Alert(alert) => self.emit(SessionEvent::Alert(alert)),
                }
            }
            CycleMessage::Done { ticket, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if self.machine.finish(&ticket) {
                    self.complete(result).await;
                } else {
                    discard_result(result).await;
                }
                self.sync_devices();
                self.publish_state();
            }
        }
    }

    async fn complete(&mut self, result: Result<VerificationOutcome, VerifyError>) {
        match result {
            Ok(outcome) => {
                tracing::info!(
                    confirmed = outcome.confirmed(),
                    attempts = outcome.matched.attempts,
                    total = outcome.matched.total,
                    "verification finished"
                );
                if let Some(artifact) = outcome.matched.matched_artifact.clone() {
                    if let Some(previous) = self.artifact.replace(artifact) {
                        discard(&previous).await;
                    }
                }
                self.emit(SessionEvent::Outcome(outcome));
            }
            Err(e) => {
                tracing::error!(error = %e, "capture cycle failed");
                if !e.handled_upstream() {
                    self.emit(SessionEvent::Alert(Alert::new("Capture error", e.to_string())));
                }
            }
        }
    }

    /// Delete the files owned by the session being reset.
    async fn release_session_files(&mut self, photo: Option<PathBuf>) {
        if let Some(photo) = photo {
            discard(&photo).await;
        }
        if let Some(artifact) = self.artifact.take() {
            discard(&artifact).await;
        }
    }

    async fn teardown(&mut self, cycle_rx: &mut mpsc::UnboundedReceiver<CycleMessage>) {
        let leftover = self.machine.teardown();
        self.release_session_files(leftover).await;
        self.sync_devices();
        self.publish_state();

        let drain = async {
            while self.in_flight > 0 {
                let Some(message) = cycle_rx.recv().await else {
                    break;
                };
                match message {
                    CycleMessage::PhotoTaken { path, .. } => {
                        discard(&path).await;
                    }
                    CycleMessage::Notice { .. } => {}
                    CycleMessage::Done { result, .. } => {
                        self.in_flight -= 1;
                        discard_result(result).await;
                    }
                }
            }
        };
        if tokio::time::timeout(TEARDOWN_GRACE, drain).await.is_err() {
            tracing::warn!(
                in_flight = self.in_flight,
                "capture cycles still running at teardown, their files may leak"
            );
        }
    }

    /// Align the camera and the frame pipeline with the machine.
    fn sync_devices(&mut self) {
        let live = self.machine.session().is_camera_live && self.machine.is_focused();
        if self.camera_active != Some(live) {
            tracing::debug!(active = live, "camera");
            self.camera.set_active(live);
            self.camera_active = Some(live);
        }

        if live && self.machine.accepts_samples() {
            self.gate.open();
        } else {
            self.gate.close();
        }
    }

    fn publish_state(&mut self) {
        let state = self.machine.state();
        if self.published != Some(state) {
            self.published = Some(state);
            self.emit(SessionEvent::State(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Shutter, then downstream verification.
async fn run_cycle<C: Camera, V: Verifier>(
    camera: Arc<C>,
    verifier: Arc<V>,
    location: Option<Location>,
    ticket: CaptureTicket,
    tx: mpsc::UnboundedSender<CycleMessage>,
) -> Result<VerificationOutcome, VerifyError> {
    let photo = camera.capture_photo().await?;
    let _ = tx.send(CycleMessage::PhotoTaken {
        ticket,
        path: photo.clone(),
    });

    let ctx = VerifyContext::new(move |notice| {
        let _ = tx.send(CycleMessage::Notice { ticket, notice });
    });
    verifier.verify(&photo, location, &ctx).await
}

/// Clean up after a cycle whose generation was abandoned.
async fn discard_result(result: Result<VerificationOutcome, VerifyError>) {
    match result {
        Ok(outcome) => {
            tracing::debug!("stale verification outcome discarded");
            for artifact in outcome.artifacts() {
                discard(artifact).await;
            }
        }
        Err(e) => tracing::debug!(error = %e, "stale capture failure discarded"),
    }
}
