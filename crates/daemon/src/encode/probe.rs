//! Resolution probing via ffprobe.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Length of the longer edge.
    pub fn long_edge(&self) -> u32 {
        self.width.max(self.height)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub width: Option<u32>,
        pub height: Option<u32>,
    }
}

/// Probes the first video stream's resolution.
///
/// Runs `ffprobe -v error -select_streams v:0 -show_entries stream=width,height -of json <path>`.
pub fn probe_resolution(ffprobe_path: &str, path: &Path) -> Result<Resolution, ProbeError> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "json",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_resolution(&stdout)
}

/// Parses ffprobe JSON output into a Resolution.
pub fn parse_ffprobe_resolution(json_str: &str) -> Result<Resolution, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let stream = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .next()
        .ok_or_else(|| ProbeError::ParseError("no video stream".to_string()))?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => Ok(Resolution { width, height }),
        _ => Err(ProbeError::ParseError(
            "video stream has no dimensions".to_string(),
        )),
    }
}
