use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use gazegate_core::{CandidateFilter, GazeThresholds, ThresholdError};
use serde::Deserialize;
use thiserror::Error;

use crate::imaging::NormalizeOptions;
use crate::matcher::{CandidateFailurePolicy, MatcherOptions};
use crate::pipeline::PipelineOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid gaze thresholds: {0}")]
    Thresholds(#[from] ThresholdError),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Runtime configuration.
///
/// Built from defaults, an optional TOML deployment profile and `GAZEGATE_*`
/// environment variables, in increasing order of precedence.
#[derive(Debug, Clone)]
pub struct Config {
    pub thresholds: GazeThresholds,
    /// Consecutive passing samples required before a capture triggers.
    pub debounce_window: NonZeroU32,
    /// Upper bound on detector invocations per second.
    pub sample_fps: NonZeroU32,
    /// Hold the capture until a device location is known.
    pub require_location: bool,
    /// Location-scoped candidate listing. Without it, candidates must be given explicitly.
    pub listing_url: Option<String>,
    /// Candidate download URL; `{id}` is replaced by the candidate identifier.
    pub candidate_url_template: String,
    pub compare_url: String,
    /// Reference image URL; `{file}` is replaced by the reference file name.
    pub reference_url_template: String,
    /// Timeout applied to every HTTP request.
    pub request_timeout_secs: u64,
    pub normalize_size: u32,
    pub normalize_quality: u8,
    /// Where captured photos and candidate artifacts are written.
    pub temp_dir: PathBuf,
    pub candidate_failure_policy: CandidateFailurePolicy,
    pub filter: CandidateFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thresholds: GazeThresholds::default(),
            debounce_window: NonZeroU32::new(2).unwrap_or(NonZeroU32::MIN),
            sample_fps: NonZeroU32::new(4).unwrap_or(NonZeroU32::MIN),
            require_location: false,
            listing_url: None,
            candidate_url_template: "http://127.0.0.1:8080/candidates/{id}".to_string(),
            compare_url: "http://127.0.0.1:5000/verify".to_string(),
            reference_url_template: "http://127.0.0.1:8080/reference/{file}".to_string(),
            request_timeout_secs: 30,
            normalize_size: 224,
            normalize_quality: 80,
            temp_dir: default_temp_dir(|key| std::env::var(key).ok()),
            candidate_failure_policy: CandidateFailurePolicy::Abort,
            filter: CandidateFilter::default(),
        }
    }
}

/// Deployment profile as written in TOML. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    gaze: GazeSection,
    #[serde(default)]
    remote: RemoteSection,
    #[serde(default)]
    matching: MatchingSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GazeSection {
    max_pitch_deg: Option<f32>,
    max_roll_deg: Option<f32>,
    max_yaw_deg: Option<f32>,
    min_eye_open_probability: Option<f32>,
    debounce_window: Option<u32>,
    sample_fps: Option<u32>,
    require_location: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemoteSection {
    listing_url: Option<String>,
    candidate_url_template: Option<String>,
    compare_url: Option<String>,
    reference_url_template: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatchingSection {
    normalize_size: Option<u32>,
    normalize_quality: Option<u8>,
    temp_dir: Option<PathBuf>,
    candidate_failure_policy: Option<CandidateFailurePolicy>,
    categories: Option<Vec<String>>,
    age_min: Option<u32>,
    age_max: Option<u32>,
}

impl Config {
    /// Load configuration from `GAZEGATE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        resolve(ConfigFile::default(), |key| std::env::var(key).ok())
    }

    /// Load a TOML deployment profile, ignoring the environment.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        resolve(read_file(path)?, |_| None)
    }

    /// Load the profile at `path`, when given, with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => read_file(path)?,
            None => ConfigFile::default(),
        };
        resolve(file, |key| std::env::var(key).ok())
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            size: self.normalize_size,
            quality: self.normalize_quality,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            sample_fps: self.sample_fps,
            ..PipelineOptions::default()
        }
    }

    pub fn matcher_options(&self) -> MatcherOptions {
        MatcherOptions {
            normalize: self.normalize_options(),
            temp_dir: self.temp_dir.clone(),
            failure_policy: self.candidate_failure_policy,
        }
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve<E>(file: ConfigFile, env: E) -> Result<Config, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();
    let ConfigFile {
        gaze,
        remote,
        matching,
    } = file;

    let thresholds = GazeThresholds::new(
        env_or(&env, "GAZEGATE_MAX_PITCH_DEG", gaze.max_pitch_deg)?
            .unwrap_or(defaults.thresholds.max_pitch_deg()),
        env_or(&env, "GAZEGATE_MAX_ROLL_DEG", gaze.max_roll_deg)?
            .unwrap_or(defaults.thresholds.max_roll_deg()),
        env_or(&env, "GAZEGATE_MAX_YAW_DEG", gaze.max_yaw_deg)?
            .unwrap_or(defaults.thresholds.max_yaw_deg()),
        env_or(
            &env,
            "GAZEGATE_MIN_EYE_OPEN_PROBABILITY",
            gaze.min_eye_open_probability,
        )?
        .unwrap_or(defaults.thresholds.min_eye_open_probability()),
    )?;

    let debounce_window = non_zero(
        "GAZEGATE_DEBOUNCE_WINDOW",
        env_or(&env, "GAZEGATE_DEBOUNCE_WINDOW", gaze.debounce_window)?,
        defaults.debounce_window,
    )?;
    let sample_fps = non_zero(
        "GAZEGATE_SAMPLE_FPS",
        env_or(&env, "GAZEGATE_SAMPLE_FPS", gaze.sample_fps)?,
        defaults.sample_fps,
    )?;
    let require_location = env_flag(&env, "GAZEGATE_REQUIRE_LOCATION")?
        .or(gaze.require_location)
        .unwrap_or(defaults.require_location);

    let listing_url = env("GAZEGATE_LISTING_URL")
        .or(remote.listing_url)
        .filter(|url| !url.trim().is_empty());
    let candidate_url_template = env("GAZEGATE_CANDIDATE_URL_TEMPLATE")
        .or(remote.candidate_url_template)
        .unwrap_or(defaults.candidate_url_template);
    require_placeholder("candidate_url_template", &candidate_url_template, "{id}")?;
    let compare_url = env("GAZEGATE_COMPARE_URL")
        .or(remote.compare_url)
        .unwrap_or(defaults.compare_url);
    let reference_url_template = env("GAZEGATE_REFERENCE_URL_TEMPLATE")
        .or(remote.reference_url_template)
        .unwrap_or(defaults.reference_url_template);
    require_placeholder("reference_url_template", &reference_url_template, "{file}")?;

    let request_timeout_secs = env_or(
        &env,
        "GAZEGATE_REQUEST_TIMEOUT_SECS",
        remote.request_timeout_secs,
    )?
    .unwrap_or(defaults.request_timeout_secs);
    if request_timeout_secs == 0 {
        return Err(ConfigError::Invalid {
            key: "request_timeout_secs",
            reason: "must be at least 1".to_string(),
        });
    }

    let normalize_size = env_or(&env, "GAZEGATE_NORMALIZE_SIZE", matching.normalize_size)?
        .unwrap_or(defaults.normalize_size);
    if normalize_size == 0 {
        return Err(ConfigError::Invalid {
            key: "normalize_size",
            reason: "must be at least 1".to_string(),
        });
    }
    let normalize_quality = env_or(&env, "GAZEGATE_NORMALIZE_QUALITY", matching.normalize_quality)?
        .unwrap_or(defaults.normalize_quality);
    if !(1..=100).contains(&normalize_quality) {
        return Err(ConfigError::Invalid {
            key: "normalize_quality",
            reason: format!("{normalize_quality} is outside 1..=100"),
        });
    }

    let temp_dir = env("GAZEGATE_TEMP_DIR")
        .map(PathBuf::from)
        .or(matching.temp_dir)
        .unwrap_or_else(|| default_temp_dir(&env));

    let candidate_failure_policy = env_or(
        &env,
        "GAZEGATE_FAILURE_POLICY",
        matching.candidate_failure_policy,
    )?
    .unwrap_or(defaults.candidate_failure_policy);

    let categories = env("GAZEGATE_CATEGORIES")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .or(matching.categories)
        .filter(|c| !c.is_empty());
    let age_min = env_or(&env, "GAZEGATE_AGE_MIN", matching.age_min)?;
    let age_max = env_or(&env, "GAZEGATE_AGE_MAX", matching.age_max)?;
    let age_window = match (age_min, age_max) {
        (None, None) => None,
        (min, max) => {
            let (min, max) = (min.unwrap_or(0), max.unwrap_or(u32::MAX));
            if min > max {
                return Err(ConfigError::Invalid {
                    key: "age_min",
                    reason: format!("{min} is greater than age_max {max}"),
                });
            }
            Some(min..=max)
        }
    };

    Ok(Config {
        thresholds,
        debounce_window,
        sample_fps,
        require_location,
        listing_url,
        candidate_url_template,
        compare_url,
        reference_url_template,
        request_timeout_secs,
        normalize_size,
        normalize_quality,
        temp_dir,
        candidate_failure_policy,
        filter: CandidateFilter {
            categories,
            age_window,
        },
    })
}

/// Environment value for `key` when set, else the profile value.
fn env_or<T, E>(env: &E, key: &'static str, file: Option<T>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    E: Fn(&str) -> Option<String>,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: format!("'{raw}': {e}"),
            }),
        None => Ok(file),
    }
}

/// Boolean environment value: `true`/`false` in any case, or `1`/`0`.
fn env_flag<E>(env: &E, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let Some(raw) = env(key) else {
        return Ok(None);
    };
    match raw.trim() {
        "1" => Ok(Some(true)),
        "0" => Ok(Some(false)),
        v => v
            .to_ascii_lowercase()
            .parse::<bool>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("'{raw}' is not a boolean (true|false|1|0)"),
            }),
    }
}

fn non_zero(
    key: &'static str,
    value: Option<u32>,
    default: NonZeroU32,
) -> Result<NonZeroU32, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => NonZeroU32::new(v).ok_or_else(|| ConfigError::Invalid {
            key,
            reason: "must be at least 1".to_string(),
        }),
    }
}

fn require_placeholder(
    key: &'static str,
    template: &str,
    placeholder: &str,
) -> Result<(), ConfigError> {
    if template.contains(placeholder) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: format!("'{template}' does not contain {placeholder}"),
        })
    }
}

/// `$XDG_CACHE_HOME/gazegate`, else `$HOME/.cache/gazegate`, else the system temp dir.
fn default_temp_dir<E>(env: E) -> PathBuf
where
    E: Fn(&str) -> Option<String>,
{
    env("XDG_CACHE_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            env("HOME")
                .filter(|v| !v.is_empty())
                .map(|home| PathBuf::from(home).join(".cache"))
        })
        .unwrap_or_else(std::env::temp_dir)
        .join("gazegate")
}
