//! Frame pipeline: samples camera frames on a dedicated thread.
//!
//! At most `sample_fps` frames per second are run through the detector. The
//! primary face's observation is offered to the controller with `try_send`,
//! so a busy consumer costs dropped samples, never a stalled camera. Nothing
//! is sampled while the [`PipelineGate`] is closed.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gazegate_core::FaceObservation;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::camera::{FaceDetector, FrameSource};

/// How long a closed gate sleeps between checks.
const GATE_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to spawn frame pipeline thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// The observation handed from the frame-processing thread to the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSample {
    pub seq: u64,
    /// Primary face of the frame, `None` when no face was detected.
    pub face: Option<FaceObservation>,
}

/// Shared on/off switch for sampling.
///
/// The controller closes it while the screen is unfocused or the camera is
/// paused; a closed gate pulls no frames and runs no detection.
#[derive(Clone, Debug)]
pub struct PipelineGate(Arc<AtomicBool>);

impl PipelineGate {
    pub fn new(open: bool) -> Self {
        Self(Arc::new(AtomicBool::new(open)))
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Upper bound on detector invocations per second.
    pub sample_fps: NonZeroU32,
    /// Samples buffered for the controller before new ones are dropped.
    pub queue_depth: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            sample_fps: NonZeroU32::new(4).unwrap_or(NonZeroU32::MIN),
            queue_depth: 2,
        }
    }
}

/// Counters reported when the pipeline thread exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub sampled: u64,
    pub sent: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Owner of the frame pipeline thread.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<PipelineStats>>,
}

impl PipelineHandle {
    /// Stop sampling and wait for the thread to exit.
    pub fn shutdown(mut self) -> PipelineStats {
        self.stop.store(true, Ordering::Release);
        self.join_thread()
    }

    /// Wait for the thread to exit on its own (source exhausted or consumer gone).
    pub fn join(mut self) -> PipelineStats {
        self.join_thread()
    }

    fn join_thread(&mut self) -> PipelineStats {
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                tracing::error!("frame pipeline thread panicked");
                PipelineStats::default()
            }
            None => PipelineStats::default(),
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Spawn the frame pipeline on a dedicated OS thread.
///
/// The thread samples `source` at most `sample_fps` times per second while
/// `gate` is open, runs `detector` synchronously on each sampled frame and
/// pushes the primary face to the returned receiver without ever blocking:
/// when the controller is behind, the sample is dropped. A detection or
/// acquisition failure yields no sample for that tick.
///
/// The thread exits when the source is exhausted, the receiver is dropped,
/// or the handle is shut down.
pub fn spawn_pipeline<S, D>(
    mut source: S,
    mut detector: D,
    options: PipelineOptions,
    gate: PipelineGate,
) -> Result<(PipelineHandle, mpsc::Receiver<FrameSample>), PipelineError>
where
    S: FrameSource,
    D: FaceDetector,
{
    let (tx, rx) = mpsc::channel::<FrameSample>(options.queue_depth.max(1));
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let interval = Duration::from_secs(1) / options.sample_fps.get();

    let thread = std::thread::Builder::new()
        .name("gazegate-frames".into())
        .spawn(move || {
            tracing::info!(
                fps = options.sample_fps.get(),
                interval_ms = interval.as_millis() as u64,
                "frame pipeline started"
            );
            let mut stats = PipelineStats::default();
            let mut next_due = Instant::now();

            while !thread_stop.load(Ordering::Acquire) {
                if !gate.is_open() {
                    std::thread::sleep(GATE_POLL.min(interval));
                    continue;
                }

                let now = Instant::now();
                if now < next_due {
                    std::thread::sleep(next_due - now);
                    continue;
                }
                next_due = now + interval;

                let frame = match source.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        tracing::info!("frame source exhausted");
                        break;
                    }
                    Err(e) => {
                        stats.failed += 1;
                        tracing::trace!(error = %e, "frame acquisition failed, skipping");
                        continue;
                    }
                };

                let face = match detector.detect(&frame) {
                    Ok(faces) => faces.first().map(|f| f.observation),
                    Err(e) => {
                        stats.failed += 1;
                        tracing::trace!(error = %e, "detection failed, skipping frame");
                        continue;
                    }
                };

                stats.sampled += 1;
                let sample = FrameSample {
                    seq: stats.sampled,
                    face,
                };
                match tx.try_send(sample) {
                    Ok(()) => stats.sent += 1,
                    Err(TrySendError::Full(_)) => {
                        stats.dropped += 1;
                        tracing::trace!(seq = sample.seq, "controller busy, sample dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!("sample receiver closed");
                        break;
                    }
                }
            }

            tracing::info!(
                sampled = stats.sampled,
                sent = stats.sent,
                dropped = stats.dropped,
                failed = stats.failed,
                "frame pipeline exiting"
            );
            stats
        })
        .map_err(PipelineError::Spawn)?;

    Ok((
        PipelineHandle {
            stop,
            thread: Some(thread),
        },
        rx,
    ))
}
