//! `gazegate match` — one verification run against the candidate gallery.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use gazegate::janitor::discard;
use gazegate::verify::{VerifyContext, VerifyNotice};
use gazegate::{
    CandidateMatcher, CandidateOrigin, CandidateVerifier, Config, HttpRemote, Location, Verifier,
};

/// Candidate origin for operator runs: explicit ids win over the listing.
pub fn origin(
    config: &Config,
    remote: &HttpRemote,
    candidates: Vec<String>,
) -> Result<CandidateOrigin<HttpRemote>> {
    if !candidates.is_empty() {
        return Ok(CandidateOrigin::Fixed(candidates));
    }
    if config.listing_url.is_none() {
        bail!("no candidates given and no listing URL configured (set GAZEGATE_LISTING_URL)");
    }
    Ok(CandidateOrigin::Listing(remote.clone()))
}

pub fn verifier(
    config: &Config,
    candidates: Vec<String>,
) -> Result<CandidateVerifier<HttpRemote, HttpRemote, HttpRemote>> {
    let remote = HttpRemote::new(config).context("failed to build HTTP client")?;
    let origin = origin(config, &remote, candidates)?;
    let matcher = CandidateMatcher::new(remote.clone(), remote, config.matcher_options());
    Ok(CandidateVerifier::new(
        origin,
        config.filter.clone(),
        config.require_location,
        matcher,
    ))
}

fn warn_leaked(paths: &[PathBuf]) {
    for path in paths {
        eprintln!("  warning: could not delete {}", path.display());
    }
}

pub async fn run(
    config: &Config,
    photo: &Path,
    candidates: Vec<String>,
    location: Option<Location>,
    json: bool,
    keep: bool,
) -> Result<()> {
    if !photo.is_file() {
        bail!("photo {} does not exist", photo.display());
    }
    let verifier = verifier(config, candidates)?;

    let ctx = VerifyContext::new(|notice| match notice {
        VerifyNotice::Progress(p) => {
            let mark = if p.confirmed { "match" } else { "no match" };
            eprintln!("  [{}/{}] {mark}", p.current, p.total);
        }
        VerifyNotice::Alert(alert) => eprintln!("  {}: {}", alert.title, alert.message),
    });

    let outcome = match verifier.verify(photo, location, &ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn_leaked(e.leaked());
            return Err(e).context("verification failed");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if outcome.confirmed() {
        println!(
            "Confirmed: {} (attempt {}/{})",
            outcome.matched.matched_id.as_deref().unwrap_or("?"),
            outcome.matched.attempts,
            outcome.matched.total
        );
    } else {
        println!(
            "Not confirmed after {}/{} candidate(s).",
            outcome.matched.attempts, outcome.matched.total
        );
    }
    for id in &outcome.matched.skipped {
        eprintln!("  skipped {id}");
    }
    warn_leaked(&outcome.matched.leaked);

    if let Some(artifact) = outcome.matched_artifact() {
        if keep {
            eprintln!("Matched image kept at {}", artifact.display());
        } else {
            discard(artifact).await;
        }
    }
    Ok(())
}
