//! Downstream verification of a captured photo.
//!
//! The capture controller only knows the [`Verifier`] trait. The candidate
//! mode lists the server gallery, applies the deployment filter and runs the
//! sequential matcher.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gazegate_core::CandidateFilter;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::camera::CameraError;
use crate::matcher::{CandidateMatcher, MatchError, MatchOutcome, MatchProgress};
use crate::remote::{CandidateListing, CandidateSource, FaceComparator, Location, RemoteError};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("device location is not available")]
    LocationUnavailable,
    #[error("candidate listing failed: {0}")]
    Listing(#[source] RemoteError),
    #[error(transparent)]
    Match(#[from] MatchError),
    /// An error the verifier already surfaced to the user with its own alert.
    #[error("{0}")]
    Reported(Box<VerifyError>),
    #[error("verification aborted: {0}")]
    Aborted(String),
}

impl VerifyError {
    /// Whether the user has already been told about this error.
    pub fn handled_upstream(&self) -> bool {
        matches!(self, Self::Reported(_))
    }

    /// Temp artifacts the failed run could not delete.
    pub fn leaked(&self) -> &[PathBuf] {
        match self {
            Self::Match(e) => e.leaked(),
            Self::Reported(inner) => inner.leaked(),
            _ => &[],
        }
    }
}

/// User-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyNotice {
    Progress(MatchProgress),
    Alert(Alert),
}

/// Sink for notices raised while verifying.
#[derive(Clone)]
pub struct VerifyContext {
    sink: Arc<dyn Fn(VerifyNotice) + Send + Sync>,
}

impl VerifyContext {
    pub fn new(sink: impl Fn(VerifyNotice) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Forward notices to `tx`. A closed receiver drops them.
    pub fn channel(tx: mpsc::UnboundedSender<VerifyNotice>) -> Self {
        Self::new(move |notice| {
            let _ = tx.send(notice);
        })
    }

    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    pub fn progress(&self, progress: MatchProgress) {
        (self.sink)(VerifyNotice::Progress(progress));
    }

    pub fn alert(&self, alert: Alert) {
        (self.sink)(VerifyNotice::Alert(alert));
    }
}

impl std::fmt::Debug for VerifyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyContext").finish_non_exhaustive()
    }
}

/// Result of one verification run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    #[serde(flatten)]
    pub matched: MatchOutcome,
    pub completed_at: DateTime<Utc>,
}

impl VerificationOutcome {
    pub fn confirmed(&self) -> bool {
        self.matched.confirmed
    }

    pub fn matched_artifact(&self) -> Option<&Path> {
        self.matched.matched_artifact.as_deref()
    }

    /// Every temp artifact this outcome still owns on disk.
    pub fn artifacts(&self) -> impl Iterator<Item = &PathBuf> {
        self.matched.matched_artifact.iter()
    }
}

/// Identity check for a captured photo.
pub trait Verifier: Send + Sync + 'static {
    fn verify(
        &self,
        photo: &Path,
        location: Option<Location>,
        ctx: &VerifyContext,
    ) -> impl Future<Output = Result<VerificationOutcome, VerifyError>> + Send;
}

/// Where the candidate gallery comes from.
pub enum CandidateOrigin<L> {
    /// Ask the server, scoped by location.
    Listing(L),
    /// A fixed set, for operator runs.
    Fixed(Vec<String>),
}

/// Verifier that matches the photo against a server-held candidate gallery.
pub struct CandidateVerifier<L, S, C> {
    origin: CandidateOrigin<L>,
    filter: CandidateFilter,
    require_location: bool,
    matcher: CandidateMatcher<S, C>,
}

impl<L, S, C> CandidateVerifier<L, S, C>
where
    L: CandidateListing,
    S: CandidateSource,
    C: FaceComparator,
{
    pub fn new(
        origin: CandidateOrigin<L>,
        filter: CandidateFilter,
        require_location: bool,
        matcher: CandidateMatcher<S, C>,
    ) -> Self {
        Self {
            origin,
            filter,
            require_location,
            matcher,
        }
    }

    async fn candidates(&self, location: Option<Location>) -> Result<Vec<String>, VerifyError> {
        match &self.origin {
            CandidateOrigin::Fixed(ids) => Ok(ids.clone()),
            CandidateOrigin::Listing(listing) => {
                if self.require_location && location.is_none() {
                    return Err(VerifyError::LocationUnavailable);
                }
                listing.list(location).await.map_err(VerifyError::Listing)
            }
        }
    }
}

impl<L, S, C> Verifier for CandidateVerifier<L, S, C>
where
    L: CandidateListing,
    S: CandidateSource,
    C: FaceComparator,
{
    async fn verify(
        &self,
        photo: &Path,
        location: Option<Location>,
        ctx: &VerifyContext,
    ) -> Result<VerificationOutcome, VerifyError> {
        let listed = match self.candidates(location).await {
            Ok(ids) => ids,
            Err(VerifyError::Listing(e)) => {
                ctx.alert(remote_alert(&e));
                return Err(VerifyError::Reported(Box::new(VerifyError::Listing(e))));
            }
            Err(e) => return Err(e),
        };
        let listed_count = listed.len();
        let candidates = self.filter.apply(listed);
        tracing::info!(
            listed = listed_count,
            candidates = candidates.len(),
            "matching captured photo"
        );

        match self
            .matcher
            .run(photo, &candidates, |p| ctx.progress(p.clone()))
            .await
        {
            Ok(matched) => Ok(VerificationOutcome {
                matched,
                completed_at: Utc::now(),
            }),
            Err(e) => match e.remote() {
                Some(remote) => {
                    ctx.alert(remote_alert(remote));
                    Err(VerifyError::Reported(Box::new(VerifyError::Match(e))))
                }
                None => Err(VerifyError::Match(e)),
            },
        }
    }
}

/// Network failures get their own wording so they are not mistaken for a
/// failed identity check.
fn remote_alert(error: &RemoteError) -> Alert {
    if error.is_timeout() {
        Alert::new("Server timeout", "The verification server did not respond in time.")
    } else {
        match error {
            RemoteError::Status { status, .. } => Alert::new(
                "Server error",
                format!("The verification server returned HTTP {status}."),
            ),
            RemoteError::Decode { .. } => Alert::new(
                "Server error",
                "The verification server sent an unreadable response.",
            ),
            _ => Alert::new("Connection error", error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::NormalizeOptions;
    use crate::matcher::{CandidateFailurePolicy, MatcherOptions};
    use crate::remote::{StaticListing, Verdict};
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::Mutex;

    fn jpeg() -> Vec<u8> {
        let img = RgbImage::from_pixel(64, 64, image::Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    struct Gallery {
        fetched: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl CandidateSource for Gallery {
        async fn fetch(&self, id: &str) -> Result<Vec<u8>, RemoteError> {
            self.fetched.lock().unwrap().push(id.to_string());
            if self.fail {
                Err(RemoteError::Status {
                    url: id.to_string(),
                    status: 500,
                })
            } else {
                Ok(jpeg())
            }
        }
    }

    /// Confirms only the candidate whose artifact is compared third.
    struct ThirdTime(Arc<Mutex<usize>>);

    impl FaceComparator for ThirdTime {
        async fn compare(&self, _: &Path, _: &Path) -> Result<Verdict, RemoteError> {
            let mut calls = self.0.lock().unwrap();
            *calls += 1;
            Ok(Verdict {
                verified: *calls == 3,
                distance: None,
                threshold: None,
                model: None,
            })
        }
    }

    struct LocatedListing {
        seen: Arc<Mutex<Vec<Option<Location>>>>,
    }

    impl CandidateListing for LocatedListing {
        async fn list(&self, location: Option<Location>) -> Result<Vec<String>, RemoteError> {
            self.seen.lock().unwrap().push(location);
            Ok(vec![
                "100_F_25.jpg".into(),
                "101_M_25.jpg".into(),
                "102_F_60.jpg".into(),
                "103_F_30.jpg".into(),
                "104_F_31.jpg".into(),
                "105_F_32.jpg".into(),
            ])
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        photo: PathBuf,
        fetched: Arc<Mutex<Vec<String>>>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("shot.jpg");
        std::fs::write(&photo, jpeg()).unwrap();
        Harness {
            dir,
            photo,
            fetched: Arc::default(),
        }
    }

    fn matcher(h: &Harness, fail: bool) -> CandidateMatcher<Gallery, ThirdTime> {
        CandidateMatcher::new(
            Gallery {
                fetched: Arc::clone(&h.fetched),
                fail,
            },
            ThirdTime(Arc::default()),
            MatcherOptions {
                normalize: NormalizeOptions::default(),
                temp_dir: h.dir.path().join("cache"),
                failure_policy: CandidateFailurePolicy::Abort,
            },
        )
    }

    fn context() -> (VerifyContext, mpsc::UnboundedReceiver<VerifyNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (VerifyContext::channel(tx), rx)
    }

    #[tokio::test]
    async fn test_filters_listing_and_reports_progress() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let verifier = CandidateVerifier::new(
            CandidateOrigin::Listing(LocatedListing {
                seen: Arc::clone(&seen),
            }),
            CandidateFilter {
                categories: Some(vec!["f".into()]),
                age_window: Some(20..=40),
            },
            true,
            matcher(&h, false),
        );
        let here = Location {
            latitude: -22.9,
            longitude: -43.2,
        };

        let (ctx, mut notices) = context();
        let outcome = verifier.verify(&h.photo, Some(here), &ctx).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Some(here)]);
        assert_eq!(
            *h.fetched.lock().unwrap(),
            vec!["100_F_25.jpg", "103_F_30.jpg", "104_F_31.jpg"]
        );
        assert!(outcome.confirmed());
        assert_eq!(outcome.matched.total, 4);
        assert!(outcome.matched_artifact().is_some_and(|p| p.exists()));

        let mut steps = Vec::new();
        while let Ok(VerifyNotice::Progress(p)) = notices.try_recv() {
            steps.push(p.current);
        }
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_location_fails_before_listing() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let verifier = CandidateVerifier::new(
            CandidateOrigin::Listing(LocatedListing {
                seen: Arc::clone(&seen),
            }),
            CandidateFilter::default(),
            true,
            matcher(&h, false),
        );

        let (ctx, _notices) = context();
        let err = verifier.verify(&h.photo, None, &ctx).await.unwrap_err();
        assert!(matches!(err, VerifyError::LocationUnavailable));
        assert!(!err.handled_upstream());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_alerts_and_is_marked_handled() {
        let h = harness();
        let verifier: CandidateVerifier<StaticListing, _, _> = CandidateVerifier::new(
            CandidateOrigin::Fixed(vec!["a".into(), "b".into()]),
            CandidateFilter::default(),
            false,
            matcher(&h, true),
        );

        let (ctx, mut notices) = context();
        let err = verifier.verify(&h.photo, None, &ctx).await.unwrap_err();
        assert!(err.handled_upstream());
        assert_eq!(*h.fetched.lock().unwrap(), vec!["a"]);
        assert!(err.leaked().is_empty());

        let mut alerts = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            if let VerifyNotice::Alert(alert) = notice {
                alerts.push(alert);
            }
        }
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "Server error");
        assert!(alerts[0].message.contains("500"));
    }

    #[test]
    fn test_outcome_serializes_flat() {
        let outcome = VerificationOutcome {
            matched: MatchOutcome {
                confirmed: true,
                matched_id: Some("x".into()),
                matched_artifact: Some(PathBuf::from("/cache/candidate-1.jpg")),
                verdict: None,
                attempts: 1,
                total: 1,
                skipped: Vec::new(),
                leaked: Vec::new(),
            },
            completed_at: Utc::now(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["confirmed"], true);
        assert_eq!(json["matched_artifact"], "/cache/candidate-1.jpg");
        assert!(json["completed_at"].is_string());
    }
}
