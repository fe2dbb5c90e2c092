//! Sequential candidate matching.
//!
//! Candidates are tried strictly one after another, in list order: download,
//! normalise, write a temp artifact, ask the comparison service, then either
//! stop on the first confirmed match (keeping that artifact for the caller)
//! or delete the artifact before the next download begins. Only one candidate
//! artifact exists on disk at any time, plus the normalised captured photo,
//! which is deleted on every exit path.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use gazegate_core::CandidateList;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::imaging::{normalize_image_blocking, NormalizeError, NormalizeOptions};
use crate::janitor::{discard, temp_artifact_path};
use crate::remote::{CandidateSource, FaceComparator, RemoteError, Verdict};

/// What to do when one candidate's download, normalisation or comparison fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateFailurePolicy {
    /// Stop the run and return the error.
    #[default]
    Abort,
    /// Log, count the attempt, and move on to the next candidate.
    Skip,
}

impl FromStr for CandidateFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown candidate failure policy '{other}' (abort|skip)")),
        }
    }
}

#[derive(Error, Debug)]
pub enum AttemptError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("failed to create temp directory {path}: {source}")]
    TempDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("captured photo {path} could not be prepared: {source}")]
    Captured {
        path: PathBuf,
        #[source]
        source: AttemptError,
        /// Temp artifacts that could not be deleted on the way out.
        leaked: Vec<PathBuf>,
    },
    #[error("candidate {id} failed: {source}")]
    Candidate {
        id: String,
        #[source]
        source: AttemptError,
        leaked: Vec<PathBuf>,
    },
}

impl MatchError {
    /// The remote failure behind this error, if it was a network/service problem.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Candidate {
                source: AttemptError::Remote(e),
                ..
            } => Some(e),
            _ => None,
        }
    }

    /// Temp artifacts left on disk by the failed run.
    pub fn leaked(&self) -> &[PathBuf] {
        match self {
            Self::Captured { leaked, .. } | Self::Candidate { leaked, .. } => leaked.as_slice(),
            Self::TempDir { .. } => &[],
        }
    }

    fn leak(&mut self, path: PathBuf) {
        if let Self::Captured { leaked, .. } | Self::Candidate { leaked, .. } = self {
            leaked.push(path);
        }
    }
}

/// Progress after one candidate attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchProgress {
    /// 1-based index of the attempt just finished.
    pub current: usize,
    pub total: usize,
    pub confirmed: bool,
    pub matched_artifact: Option<PathBuf>,
}

/// Result of a completed matching run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub confirmed: bool,
    pub matched_id: Option<String>,
    /// Retained artifact of the confirmed candidate. The caller owns its deletion.
    pub matched_artifact: Option<PathBuf>,
    pub verdict: Option<Verdict>,
    pub attempts: usize,
    pub total: usize,
    /// Candidates that failed under [`CandidateFailurePolicy::Skip`].
    pub skipped: Vec<String>,
    /// Temp artifacts that could not be deleted.
    pub leaked: Vec<PathBuf>,
}

impl MatchOutcome {
    fn empty(total: usize) -> Self {
        Self {
            confirmed: false,
            matched_id: None,
            matched_artifact: None,
            verdict: None,
            attempts: 0,
            total,
            skipped: Vec::new(),
            leaked: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatcherOptions {
    pub normalize: NormalizeOptions,
    pub temp_dir: PathBuf,
    pub failure_policy: CandidateFailurePolicy,
}

pub struct CandidateMatcher<S, C> {
    source: S,
    comparator: C,
    options: MatcherOptions,
}

impl<S, C> CandidateMatcher<S, C>
where
    S: CandidateSource,
    C: FaceComparator,
{
    pub fn new(source: S, comparator: C, options: MatcherOptions) -> Self {
        Self {
            source,
            comparator,
            options,
        }
    }

    pub fn options(&self) -> &MatcherOptions {
        &self.options
    }

    /// Compare `captured` against `candidates` until the first match.
    ///
    /// `progress` is called exactly once per attempt, after the attempt and
    /// its cleanup are done. No retries are made.
    pub async fn run<F>(
        &self,
        captured: &Path,
        candidates: &CandidateList,
        mut progress: F,
    ) -> Result<MatchOutcome, MatchError>
    where
        F: FnMut(&MatchProgress) + Send,
    {
        let temp_dir = &self.options.temp_dir;
        tokio::fs::create_dir_all(temp_dir)
            .await
            .map_err(|source| MatchError::TempDir {
                path: temp_dir.clone(),
                source,
            })?;

        let prepared = temp_artifact_path(temp_dir, "captured");
        if let Err(source) = self.prepare_captured(captured, &prepared).await {
            let mut leaked = Vec::new();
            release(&prepared, &mut leaked).await;
            return Err(MatchError::Captured {
                path: captured.to_path_buf(),
                source,
                leaked,
            });
        }

        let result = self.try_candidates(&prepared, candidates, &mut progress).await;

        let mut leaked = Vec::new();
        release(&prepared, &mut leaked).await;
        match result {
            Ok(mut outcome) => {
                outcome.leaked.extend(leaked);
                Ok(outcome)
            }
            Err(mut e) => {
                leaked.into_iter().for_each(|path| e.leak(path));
                Err(e)
            }
        }
    }

    async fn prepare_captured(&self, captured: &Path, dest: &Path) -> Result<(), AttemptError> {
        let bytes = tokio::fs::read(captured)
            .await
            .map_err(|source| AttemptError::Io {
                path: captured.to_path_buf(),
                source,
            })?;
        let normalized = normalize_image_blocking(bytes, self.options.normalize).await?;
        write_artifact(dest, &normalized).await
    }

    async fn try_candidates<F>(
        &self,
        prepared: &Path,
        candidates: &CandidateList,
        progress: &mut F,
    ) -> Result<MatchOutcome, MatchError>
    where
        F: FnMut(&MatchProgress) + Send,
    {
        let total = candidates.len();
        let mut outcome = MatchOutcome::empty(total);

        for (index, id) in candidates.iter().enumerate() {
            let artifact = temp_artifact_path(&self.options.temp_dir, "candidate");
            let mut on_disk = false;
            tracing::debug!(candidate = id, index, total, "trying candidate");

            let attempt = self.attempt(id, prepared, &artifact, &mut on_disk).await;
            outcome.attempts = index + 1;
            let mut step = MatchProgress {
                current: index + 1,
                total,
                confirmed: false,
                matched_artifact: None,
            };

            match attempt {
                Ok(verdict) if verdict.verified => {
                    tracing::info!(
                        candidate = id,
                        attempt = index + 1,
                        total,
                        distance = ?verdict.distance,
                        "identity confirmed"
                    );
                    step.confirmed = true;
                    step.matched_artifact = Some(artifact.clone());
                    progress(&step);

                    outcome.confirmed = true;
                    outcome.matched_id = Some(id.to_string());
                    outcome.matched_artifact = Some(artifact);
                    outcome.verdict = Some(verdict);
                    return Ok(outcome);
                }
                Ok(verdict) => {
                    tracing::debug!(candidate = id, distance = ?verdict.distance, "candidate rejected");
                    release(&artifact, &mut outcome.leaked).await;
                    progress(&step);
                }
                Err(source) => {
                    if on_disk {
                        release(&artifact, &mut outcome.leaked).await;
                    }
                    progress(&step);
                    match self.options.failure_policy {
                        CandidateFailurePolicy::Abort => {
                            tracing::warn!(candidate = id, error = %source, "candidate failed, aborting run");
                            return Err(MatchError::Candidate {
                                id: id.to_string(),
                                source,
                                leaked: std::mem::take(&mut outcome.leaked),
                            });
                        }
                        CandidateFailurePolicy::Skip => {
                            tracing::warn!(candidate = id, error = %source, "candidate failed, skipping");
                            outcome.skipped.push(id.to_string());
                        }
                    }
                }
            }
        }

        tracing::info!(attempts = outcome.attempts, "no candidate matched");
        Ok(outcome)
    }

    /// Download, normalise and compare one candidate.
    ///
    /// `on_disk` is set once the artifact may exist, so the caller knows
    /// whether cleanup is owed on failure.
    async fn attempt(
        &self,
        id: &str,
        prepared: &Path,
        artifact: &Path,
        on_disk: &mut bool,
    ) -> Result<Verdict, AttemptError> {
        let original = self.source.fetch(id).await?;
        let normalized = normalize_image_blocking(original, self.options.normalize).await?;
        *on_disk = true;
        write_artifact(artifact, &normalized).await?;
        Ok(self.comparator.compare(prepared, artifact).await?)
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), AttemptError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| AttemptError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Delete `artifact`, recording it in `leaked` if it stays on disk.
async fn release(artifact: &Path, leaked: &mut Vec<PathBuf>) {
    if !discard(artifact).await {
        leaked.push(artifact.to_path_buf());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn jpeg() -> Vec<u8> {
        let img = RgbImage::from_pixel(320, 240, image::Rgb([90, 120, 150]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    /// Serves images by id, recording fetch order and how many temp files
    /// existed at the moment each download began.
    #[derive(Clone)]
    struct FakeSource {
        temp_dir: PathBuf,
        broken: HashSet<String>,
        garbage: HashSet<String>,
        fetched: Arc<Mutex<Vec<String>>>,
        files_at_fetch: Arc<Mutex<Vec<usize>>>,
    }

    impl FakeSource {
        fn new(temp_dir: &Path) -> Self {
            Self {
                temp_dir: temp_dir.to_path_buf(),
                broken: HashSet::new(),
                garbage: HashSet::new(),
                fetched: Arc::default(),
                files_at_fetch: Arc::default(),
            }
        }
    }

    impl CandidateSource for FakeSource {
        async fn fetch(&self, id: &str) -> Result<Vec<u8>, RemoteError> {
            self.fetched.lock().unwrap().push(id.to_string());
            self.files_at_fetch
                .lock()
                .unwrap()
                .push(files_in(&self.temp_dir));
            if self.broken.contains(id) {
                return Err(RemoteError::Status {
                    url: format!("https://photos.test/{id}"),
                    status: 503,
                });
            }
            if self.garbage.contains(id) {
                return Ok(b"<html>not an image</html>".to_vec());
            }
            Ok(jpeg())
        }
    }

    /// Returns scripted verdicts in call order and records the artifacts it saw.
    #[derive(Clone)]
    struct FakeComparator {
        verdicts: Arc<Mutex<VecDeque<bool>>>,
        seen: Arc<Mutex<Vec<PathBuf>>>,
        wedge_candidate: bool,
        wedge_captured: bool,
    }

    impl FakeComparator {
        fn new(verdicts: &[bool]) -> Self {
            Self {
                verdicts: Arc::new(Mutex::new(verdicts.iter().copied().collect())),
                seen: Arc::default(),
                wedge_candidate: false,
                wedge_captured: false,
            }
        }
    }

    /// Swap the file at `path` for a directory so deleting it fails.
    fn wedge(path: &Path) {
        if path.is_file() {
            std::fs::remove_file(path).unwrap();
            std::fs::create_dir(path).unwrap();
        }
    }

    impl FaceComparator for FakeComparator {
        async fn compare(&self, captured: &Path, candidate: &Path) -> Result<Verdict, RemoteError> {
            assert!(captured.exists(), "captured photo missing during compare");
            assert!(candidate.exists(), "candidate artifact missing during compare");
            self.seen.lock().unwrap().push(candidate.to_path_buf());
            if self.wedge_candidate {
                wedge(candidate);
            }
            if self.wedge_captured {
                wedge(captured);
            }
            let verified = self.verdicts.lock().unwrap().pop_front().unwrap_or(false);
            Ok(Verdict {
                verified,
                distance: Some(if verified { 0.2 } else { 0.8 }),
                threshold: Some(0.4),
                model: None,
            })
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        photo: PathBuf,
        temp_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let photo = root.path().join("shot.jpg");
        std::fs::write(&photo, jpeg()).unwrap();
        let temp_dir = root.path().join("cache");
        Fixture {
            photo,
            temp_dir,
            _root: root,
        }
    }

    fn options(temp_dir: &Path, policy: CandidateFailurePolicy) -> MatcherOptions {
        MatcherOptions {
            normalize: NormalizeOptions::default(),
            temp_dir: temp_dir.to_path_buf(),
            failure_policy: policy,
        }
    }

    fn list(ids: &[&str]) -> CandidateList {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_stops_at_first_match_and_keeps_its_artifact() {
        let fx = fixture();
        let source = FakeSource::new(&fx.temp_dir);
        let comparator = FakeComparator::new(&[false, true, false]);
        let matcher = CandidateMatcher::new(
            source.clone(),
            comparator.clone(),
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );

        let outcome = matcher
            .run(&fx.photo, &list(&["A", "B", "C"]), |_| {})
            .await
            .unwrap();

        assert!(outcome.confirmed);
        assert_eq!(outcome.matched_id.as_deref(), Some("B"));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(*source.fetched.lock().unwrap(), vec!["A", "B"]);

        let seen = comparator.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].exists(), "rejected artifact not cleaned up");
        let kept = outcome.matched_artifact.unwrap();
        assert_eq!(kept, seen[1]);
        assert!(kept.exists());
        // Only the retained match remains; the normalised capture is gone.
        assert_eq!(files_in(&fx.temp_dir), 1);
    }

    #[tokio::test]
    async fn test_no_match_leaves_no_artifacts() {
        let fx = fixture();
        let source = FakeSource::new(&fx.temp_dir);
        let comparator = FakeComparator::new(&[false; 5]);
        let matcher = CandidateMatcher::new(
            source.clone(),
            comparator.clone(),
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );

        let outcome = matcher
            .run(&fx.photo, &list(&["1", "2", "3", "4", "5"]), |_| {})
            .await
            .unwrap();

        assert!(!outcome.confirmed);
        assert_eq!(outcome.attempts, 5);
        assert!(outcome.matched_artifact.is_none());
        assert!(outcome.leaked.is_empty());

        let seen = comparator.seen.lock().unwrap().clone();
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 5);
        assert!(seen.iter().all(|p| !p.exists()));
        assert_eq!(files_in(&fx.temp_dir), 0);
        // Each download began with only the normalised capture on disk.
        assert_eq!(*source.files_at_fetch.lock().unwrap(), vec![1; 5]);
    }

    #[tokio::test]
    async fn test_progress_once_per_attempt() {
        let fx = fixture();
        let matcher = CandidateMatcher::new(
            FakeSource::new(&fx.temp_dir),
            FakeComparator::new(&[false, false, true]),
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );

        let mut steps = Vec::new();
        let outcome = matcher
            .run(&fx.photo, &list(&["x", "y", "z"]), |p| {
                steps.push((p.current, p.total, p.confirmed))
            })
            .await
            .unwrap();

        assert!(outcome.confirmed);
        assert_eq!(steps, vec![(1, 3, false), (2, 3, false), (3, 3, true)]);
    }

    #[tokio::test]
    async fn test_empty_list_is_not_confirmed() {
        let fx = fixture();
        let matcher = CandidateMatcher::new(
            FakeSource::new(&fx.temp_dir),
            FakeComparator::new(&[]),
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );

        let mut calls = 0;
        let outcome = matcher
            .run(&fx.photo, &CandidateList::default(), |_| calls += 1)
            .await
            .unwrap();
        assert!(!outcome.confirmed);
        assert_eq!(outcome.total, 0);
        assert_eq!(calls, 0);
        assert_eq!(files_in(&fx.temp_dir), 0);
    }

    #[tokio::test]
    async fn test_abort_policy_halts_and_cleans_up() {
        let fx = fixture();
        let mut source = FakeSource::new(&fx.temp_dir);
        source.broken.insert("B".to_string());
        let matcher = CandidateMatcher::new(
            source.clone(),
            FakeComparator::new(&[false, true, true]),
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );

        let mut steps = Vec::new();
        let err = matcher
            .run(&fx.photo, &list(&["A", "B", "C"]), |p| steps.push(p.current))
            .await
            .unwrap_err();

        assert!(matches!(&err, MatchError::Candidate { id, .. } if id == "B"));
        assert!(matches!(err.remote(), Some(RemoteError::Status { status: 503, .. })));
        assert_eq!(*source.fetched.lock().unwrap(), vec!["A", "B"]);
        assert_eq!(steps, vec![1, 2]);
        assert_eq!(files_in(&fx.temp_dir), 0);
    }

    #[tokio::test]
    async fn test_skip_policy_continues_past_failures() {
        let fx = fixture();
        let mut source = FakeSource::new(&fx.temp_dir);
        source.broken.insert("A".to_string());
        source.garbage.insert("B".to_string());
        let matcher = CandidateMatcher::new(
            source.clone(),
            FakeComparator::new(&[true]),
            options(&fx.temp_dir, CandidateFailurePolicy::Skip),
        );

        let outcome = matcher
            .run(&fx.photo, &list(&["A", "B", "C"]), |_| {})
            .await
            .unwrap();

        assert!(outcome.confirmed);
        assert_eq!(outcome.matched_id.as_deref(), Some("C"));
        assert_eq!(outcome.skipped, vec!["A", "B"]);
        assert_eq!(files_in(&fx.temp_dir), 1);
    }

    #[tokio::test]
    async fn test_unreadable_capture_fails_before_any_download() {
        let fx = fixture();
        let source = FakeSource::new(&fx.temp_dir);
        let matcher = CandidateMatcher::new(
            source.clone(),
            FakeComparator::new(&[true]),
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );

        let missing = fx.temp_dir.join("nope.jpg");
        let err = matcher
            .run(&missing, &list(&["A"]), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, MatchError::Captured { .. }));
        assert!(source.fetched.lock().unwrap().is_empty());
        assert_eq!(files_in(&fx.temp_dir), 0);
    }

    #[tokio::test]
    async fn test_undecodable_capture_is_cleaned_up() {
        let fx = fixture();
        std::fs::write(&fx.photo, b"not a jpeg").unwrap();
        let source = FakeSource::new(&fx.temp_dir);
        let matcher = CandidateMatcher::new(
            source.clone(),
            FakeComparator::new(&[true]),
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );

        let err = matcher
            .run(&fx.photo, &list(&["A"]), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            MatchError::Captured {
                source: AttemptError::Normalize(_),
                ..
            }
        ));
        assert!(err.leaked().is_empty());
        assert!(source.fetched.lock().unwrap().is_empty());
        assert_eq!(files_in(&fx.temp_dir), 0);
    }

    #[tokio::test]
    async fn test_abort_reports_undeletable_candidate_artifact() {
        let fx = fixture();
        let mut source = FakeSource::new(&fx.temp_dir);
        source.broken.insert("B".to_string());
        let mut comparator = FakeComparator::new(&[false]);
        comparator.wedge_candidate = true;
        let matcher = CandidateMatcher::new(
            source,
            comparator.clone(),
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );

        let err = matcher
            .run(&fx.photo, &list(&["A", "B"]), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(&err, MatchError::Candidate { id, .. } if id == "B"));
        let seen = comparator.seen.lock().unwrap().clone();
        assert_eq!(err.leaked(), seen.as_slice());
        assert!(seen[0].is_dir());
        // The normalised capture was still removed.
        assert_eq!(files_in(&fx.temp_dir), 1);
    }

    #[tokio::test]
    async fn test_undeletable_capture_reported_on_both_paths() {
        let fx = fixture();
        let mut comparator = FakeComparator::new(&[false]);
        comparator.wedge_captured = true;
        let matcher = CandidateMatcher::new(
            FakeSource::new(&fx.temp_dir),
            comparator,
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );
        let outcome = matcher
            .run(&fx.photo, &list(&["A"]), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.leaked.len(), 1);
        assert!(outcome.leaked[0].is_dir());

        let fx = fixture();
        let mut source = FakeSource::new(&fx.temp_dir);
        source.broken.insert("B".to_string());
        let mut comparator = FakeComparator::new(&[false]);
        comparator.wedge_captured = true;
        let matcher = CandidateMatcher::new(
            source,
            comparator,
            options(&fx.temp_dir, CandidateFailurePolicy::Abort),
        );
        let err = matcher
            .run(&fx.photo, &list(&["A", "B"]), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Candidate { .. }));
        assert_eq!(err.leaked().len(), 1);
        assert!(err.leaked()[0].is_dir());
        assert!(err.leaked()[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("captured-"));
    }

    #[test]
    fn test_policy_parses() {
        assert_eq!("Skip".parse(), Ok(CandidateFailurePolicy::Skip));
        assert_eq!(" abort ".parse(), Ok(CandidateFailurePolicy::Abort));
        assert!("retry".parse::<CandidateFailurePolicy>().is_err());
        let map: HashMap<&str, CandidateFailurePolicy> =
            serde_json::from_str(r#"{"policy": "skip"}"#).unwrap();
        assert_eq!(map["policy"], CandidateFailurePolicy::Skip);
    }
}
