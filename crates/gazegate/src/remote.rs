//! Server collaborators: candidate listing, candidate download, face comparison.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::janitor::discard;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("failed to prepare HTTP request: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("malformed response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http { source, .. } if source.is_timeout())
    }
}

/// Device position used to scope the candidate listing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Comparison service verdict for one pair of images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Same person.
    pub verified: bool,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Server listing of candidate identifiers, in server order.
pub trait CandidateListing: Send + Sync + 'static {
    fn list(
        &self,
        location: Option<Location>,
    ) -> impl Future<Output = Result<Vec<String>, RemoteError>> + Send;
}

/// Download of one candidate's original image.
pub trait CandidateSource: Send + Sync + 'static {
    fn fetch(&self, id: &str) -> impl Future<Output = Result<Vec<u8>, RemoteError>> + Send;
}

/// Remote same-person comparison of two local images.
pub trait FaceComparator: Send + Sync + 'static {
    fn compare(
        &self,
        captured: &Path,
        candidate: &Path,
    ) -> impl Future<Output = Result<Verdict, RemoteError>> + Send;
}

/// A fixed candidate list that ignores location.
#[derive(Debug, Clone)]
pub struct StaticListing(pub Vec<String>);

impl CandidateListing for StaticListing {
    async fn list(&self, _location: Option<Location>) -> Result<Vec<String>, RemoteError> {
        Ok(self.0.clone())
    }
}

/// HTTP implementation of every server collaborator, sharing one client.
///
/// No retries: a failed request is reported to the caller as is. The only
/// timeout is the client-wide one from the configuration.
#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    listing_url: Option<String>,
    candidate_url_template: String,
    compare_url: String,
    reference_url_template: String,
}

impl HttpRemote {
    pub fn new(config: &Config) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(RemoteError::Client)?;

        Ok(Self {
            client,
            listing_url: config.listing_url.clone(),
            candidate_url_template: config.candidate_url_template.clone(),
            compare_url: config.compare_url.clone(),
            reference_url_template: config.reference_url_template.clone(),
        })
    }

    async fn get_ok(&self, url: reqwest::Url) -> Result<reqwest::Response, RemoteError> {
        let url_str = url.to_string();
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| RemoteError::Http {
                url: url_str.clone(),
                source,
            })?;
        check_status(&url_str, resp)
    }

    /// Stream the reference image `file_name` to `dest`.
    ///
    /// Writes to `<dest>.part` and renames on completion, so a partial download
    /// never appears at `dest`. `on_progress` receives bytes so far and the
    /// announced length, if any.
    pub async fn download_reference(
        &self,
        file_name: &str,
        dest: &Path,
        mut on_progress: impl FnMut(u64, Option<u64>),
    ) -> Result<u64, RemoteError> {
        let url = expand_template(&self.reference_url_template, "{file}", file_name)?;
        let url_str = url.to_string();
        let resp = self.get_ok(url).await?;
        let content_length = resp.content_length();

        let part = dest.with_extension("part");
        let file = tokio::fs::File::create(&part)
            .await
            .map_err(|source| RemoteError::Io {
                path: part.clone(),
                source,
            })?;

        let result = match write_body(resp, file, &url_str, &part, content_length, &mut on_progress).await {
            Ok(total) => tokio::fs::rename(&part, dest)
                .await
                .map(|()| total)
                .map_err(|source| RemoteError::Io {
                    path: dest.to_path_buf(),
                    source,
                }),
            Err(e) => Err(e),
        };
        if result.is_err() {
            discard(&part).await;
        }
        result
    }
}

/// Stream the response body into `file`, returning the byte count.
async fn write_body(
    mut resp: reqwest::Response,
    mut file: tokio::fs::File,
    url: &str,
    path: &Path,
    content_length: Option<u64>,
    mut on_progress: impl FnMut(u64, Option<u64>),
) -> Result<u64, RemoteError> {
    let io_err = |source| RemoteError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut total: u64 = 0;
    while let Some(chunk) = resp.chunk().await.map_err(|source| RemoteError::Http {
        url: url.to_string(),
        source,
    })? {
        file.write_all(&chunk).await.map_err(io_err)?;
        total += chunk.len() as u64;
        on_progress(total, content_length);
    }
    file.flush().await.map_err(io_err)?;
    Ok(total)
}

impl CandidateListing for HttpRemote {
    async fn list(&self, location: Option<Location>) -> Result<Vec<String>, RemoteError> {
        let Some(listing_url) = &self.listing_url else {
            return Err(RemoteError::InvalidUrl {
                url: String::new(),
                reason: "no listing URL configured".to_string(),
            });
        };
        let mut url = parse_url(listing_url)?;
        if let Some(loc) = location {
            url.query_pairs_mut()
                .append_pair("lat", &loc.latitude.to_string())
                .append_pair("lon", &loc.longitude.to_string());
        }

        let url_str = url.to_string();
        let resp = self.get_ok(url).await?;
        let body = resp.bytes().await.map_err(|source| RemoteError::Http {
            url: url_str.clone(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|source| RemoteError::Decode {
            url: url_str,
            source,
        })
    }
}

impl CandidateSource for HttpRemote {
    async fn fetch(&self, id: &str) -> Result<Vec<u8>, RemoteError> {
        let url = expand_template(&self.candidate_url_template, "{id}", id)?;
        let url_str = url.to_string();
        let resp = self.get_ok(url).await?;
        let body = resp
            .bytes()
            .await
            .map_err(|source| RemoteError::Http { url: url_str, source })?;
        Ok(body.to_vec())
    }
}

impl FaceComparator for HttpRemote {
    async fn compare(&self, captured: &Path, candidate: &Path) -> Result<Verdict, RemoteError> {
        let url = self.compare_url.clone();
        let form = reqwest::multipart::Form::new()
            .part("source", image_part(captured).await?)
            .part("target", image_part(candidate).await?);

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|source| RemoteError::Http {
                url: url.clone(),
                source,
            })?;
        let resp = check_status(&url, resp)?;
        let body = resp.bytes().await.map_err(|source| RemoteError::Http {
            url: url.clone(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|source| RemoteError::Decode { url, source })
    }
}

async fn image_part(path: &Path) -> Result<reqwest::multipart::Part, RemoteError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| RemoteError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.jpg".to_string());

    reqwest::multipart::Part::bytes(bytes)
        .file_name(file_name)
        .mime_str("image/jpeg")
        .map_err(RemoteError::Client)
}

fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(RemoteError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn parse_url(url: &str) -> Result<reqwest::Url, RemoteError> {
    reqwest::Url::parse(url).map_err(|e| RemoteError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Substitute `value`, percent-encoded, for `placeholder` in `template`.
fn expand_template(template: &str, placeholder: &str, value: &str) -> Result<reqwest::Url, RemoteError> {
    let encoded: String = value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect();
    parse_url(&template.replace(placeholder, &encoded))
}
