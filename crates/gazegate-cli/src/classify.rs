//! `gazegate classify` — offline gaze classification of recorded observations.

use std::path::Path;

use anyhow::{Context, Result};
use gazegate::Config;
use gazegate_core::{evaluate, FaceObservation, GazeThresholds};

/// Classification of one input line.
fn classify_line(line: &str, thresholds: &GazeThresholds) -> String {
    let Ok(observation) = serde_json::from_str::<FaceObservation>(line) else {
        return "skip".to_string();
    };
    let check = evaluate(&observation, thresholds);
    match (check.pose_ok, check.eyes_open) {
        (true, true) => "pass".to_string(),
        (false, true) => "fail pose".to_string(),
        (true, false) => "fail eyes".to_string(),
        (false, false) => "fail pose,eyes".to_string(),
    }
}

pub fn run(config: &Config, observations: &Path) -> Result<()> {
    let text = std::fs::read_to_string(observations)
        .with_context(|| format!("failed to read {}", observations.display()))?;

    let mut passed = 0;
    let mut total = 0;
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let verdict = classify_line(line, &config.thresholds);
        if verdict == "pass" {
            passed += 1;
        }
        if verdict != "skip" {
            total += 1;
        }
        println!("{}\t{verdict}", index + 1);
    }

    eprintln!("{passed}/{total} observations passed");
    Ok(())
}
