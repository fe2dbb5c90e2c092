//! `gazegate replay` — a full capture session driven by recorded observations.
//!
//! Each line of the observations file is one frame: a face observation
//! object, `null` for a frame without a face, or anything else for a frame
//! the detector fails on.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use gazegate::camera::FaceBounds;
use gazegate::janitor::temp_artifact_path;
use gazegate::{
    spawn_pipeline, Camera, CameraError, CaptureController, Config, DetectError, DetectedFace,
    FaceDetector, Frame, FrameSource, Location, Permission, SessionEnd, SessionEvent,
};
use gazegate_core::FaceObservation;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Frames read from the recording, one per non-empty line.
struct RecordedFrames {
    lines: std::vec::IntoIter<String>,
}

impl RecordedFrames {
    fn new(text: &str) -> Self {
        let lines: Vec<String> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self {
            lines: lines.into_iter(),
        }
    }
}

impl FrameSource for RecordedFrames {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        Ok(self.lines.next().map(|line| Frame {
            width: 0,
            height: 0,
            data: line.into_bytes(),
        }))
    }
}

/// Decodes the recorded observation carried by each frame.
struct RecordedDetector;

impl FaceDetector for RecordedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectError> {
        let observation: Option<FaceObservation> = serde_json::from_slice(&frame.data)
            .map_err(|e| DetectError::Malformed(e.to_string()))?;
        Ok(observation
            .map(|observation| DetectedFace {
                bounds: FaceBounds::default(),
                observation,
            })
            .into_iter()
            .collect())
    }
}

/// Camera whose shutter copies a fixed photo into the temp directory.
struct FileCamera {
    photo: PathBuf,
    temp_dir: PathBuf,
}

impl Camera for FileCamera {
    async fn request_permission(&self) -> Permission {
        Permission::Granted
    }

    async fn capture_photo(&self) -> Result<PathBuf, CameraError> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let dest = temp_artifact_path(&self.temp_dir, "capture");
        tokio::fs::copy(&self.photo, &dest).await?;
        tracing::debug!(path = %dest.display(), "photo captured");
        Ok(dest)
    }

    fn set_active(&self, active: bool) {
        tracing::debug!(active, "camera");
    }
}

pub async fn run(
    mut config: Config,
    observations: &Path,
    photo: &Path,
    candidates: Vec<String>,
    location: Option<Location>,
    fps: Option<u32>,
) -> Result<()> {
    if !photo.is_file() {
        bail!("photo {} does not exist", photo.display());
    }
    if let Some(fps) = fps {
        config.sample_fps = NonZeroU32::new(fps).context("--fps must be at least 1")?;
    }
    let text = std::fs::read_to_string(observations)
        .with_context(|| format!("failed to read {}", observations.display()))?;

    let verifier = crate::matching::verifier(&config, candidates)?;
    let camera = FileCamera {
        photo: photo.to_path_buf(),
        temp_dir: config.temp_dir.clone(),
    };

    let gate = gazegate::PipelineGate::new(false);
    let (pipeline, samples) = spawn_pipeline(
        RecordedFrames::new(&text),
        RecordedDetector,
        config.pipeline_options(),
        gate.clone(),
    )?;
    let controller = CaptureController::new(&config, camera, verifier, gate);

    // The screen stays focused for the whole replay.
    let (_screen_tx, screen_rx) = mpsc::channel(1);
    let (_location_tx, location_rx) = watch::channel(location);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let cancel = CancellationToken::new();

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "unprintable session event"),
            }
        }
    });

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let end = controller
        .run(samples, screen_rx, location_rx, events_tx, cancel)
        .await;
    let stats = tokio::task::spawn_blocking(move || pipeline.shutdown()).await?;
    printer.await?;

    eprintln!(
        "session ended ({end:?}): {} sampled, {} dropped, {} undetectable",
        stats.sampled, stats.dropped, stats.failed
    );
    if end == SessionEnd::Cancelled {
        bail!("interrupted");
    }
    Ok(())
}
