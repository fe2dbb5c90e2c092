use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gazegate::{Config, Location};
use tracing_subscriber::EnvFilter;

mod classify;
mod matching;
mod reference;
mod replay;

#[derive(Parser, Debug)]
#[command(name = "gazegate", author, version, about)]
struct Cli {
    /// TOML deployment profile. `GAZEGATE_*` variables override it.
    #[arg(long, global = true, value_name = "FILE")]
    profile: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify recorded face observations (one JSON object per line).
    Classify {
        observations: PathBuf,
    },
    /// Match a photo against the candidate gallery.
    Match {
        photo: PathBuf,
        /// Candidate identifiers to try instead of the server listing.
        #[arg(long, num_args = 1..)]
        candidates: Vec<String>,
        #[command(flatten)]
        location: LocationArgs,
        /// Print the outcome as JSON.
        #[arg(long)]
        json: bool,
        /// Keep the matched candidate's artifact instead of deleting it.
        #[arg(long)]
        keep: bool,
    },
    /// Drive a full capture session from recorded observations.
    Replay {
        observations: PathBuf,
        /// Photo the simulated camera returns.
        #[arg(long)]
        photo: PathBuf,
        #[arg(long, num_args = 1..)]
        candidates: Vec<String>,
        #[command(flatten)]
        location: LocationArgs,
        /// Override the configured sampling rate.
        #[arg(long)]
        fps: Option<u32>,
    },
    /// Download the reference image for a registration number.
    Reference {
        registration: String,
        /// Destination file. Defaults to a fresh file in the temp directory.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct LocationArgs {
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,
}

impl LocationArgs {
    fn location(&self) -> Result<Option<Location>> {
        match (self.lat, self.lon) {
            (Some(latitude), Some(longitude)) => {
                if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                    bail!("location {latitude},{longitude} is out of range");
                }
                Ok(Some(Location {
                    latitude,
                    longitude,
                }))
            }
            _ => Ok(None),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.profile.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Command::Classify { observations } => classify::run(&config, &observations),
        Command::Match {
            photo,
            candidates,
            location,
            json,
            keep,
        } => {
            let location = location.location()?;
            matching::run(&config, &photo, candidates, location, json, keep).await
        }
        Command::Replay {
            observations,
            photo,
            candidates,
            location,
            fps,
        } => {
            let location = location.location()?;
            replay::run(config, &observations, &photo, candidates, location, fps).await
        }
        Command::Reference {
            registration,
            output,
        } => reference::run(&config, &registration, output).await,
    }
}
