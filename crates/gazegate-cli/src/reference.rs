//! `gazegate reference` — downloads the reference image for a registration number.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use gazegate::janitor::temp_artifact_path;
use gazegate::{Config, HttpRemote};
use gazegate_core::reference_file_name;

/// Print progress every 10% when the length is known.
fn report_progress(total: u64, len: Option<u64>, last_pct: &mut u64) {
    let Some(len) = len.filter(|&l| l > 0) else {
        return;
    };
    let pct = (total * 100) / len;
    if pct / 10 > *last_pct / 10 {
        print!("  {pct}%\r");
        io::stdout().flush().ok();
        *last_pct = pct;
    }
}

pub async fn run(config: &Config, registration: &str, output: Option<PathBuf>) -> Result<()> {
    let file_name = reference_file_name(registration)
        .with_context(|| format!("invalid registration number '{registration}'"))?;

    let dest = match output {
        Some(path) => path,
        None => {
            tokio::fs::create_dir_all(&config.temp_dir)
                .await
                .with_context(|| format!("failed to create {}", config.temp_dir.display()))?;
            temp_artifact_path(&config.temp_dir, "reference")
        }
    };

    println!("Reference image: {file_name}");
    println!("  downloading to {}...", dest.display());

    let remote = HttpRemote::new(config).context("failed to build HTTP client")?;
    let mut last_pct = 0;
    let total = remote
        .download_reference(&file_name, &dest, |total, len| {
            report_progress(total, len, &mut last_pct)
        })
        .await
        .with_context(|| format!("failed to download {file_name}"))?;

    println!("Saved {total} bytes to {}", dest.display());
    Ok(())
}
