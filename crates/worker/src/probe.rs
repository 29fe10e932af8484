//! Probing input videos with ffprobe.
//!
//! Only the first video stream matters: its dimensions pick the output
//! height floor and its frame rate drives re-assembly.

use crate::runner::{CommandRunner, ToolError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe itself failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),

    /// The input has no video stream.
    #[error("No video stream found in input")]
    NoVideoStream,

    /// The frame rate field is not a usable rate.
    #[error("Invalid frame rate: {0:?}")]
    InvalidFrameRate(String),
}

/// Properties of the first video stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
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
        pub r_frame_rate: Option<serde_json::Value>,
    }
}

/// Builds the ffprobe argv for the first video stream's size and rate.
pub fn build_probe_command(ffprobe: &str, input: &Path) -> Vec<String> {
    vec![
        ffprobe.to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-select_streams".to_string(),
        "v:0".to_string(),
        "-show_entries".to_string(),
        "stream=width,height,r_frame_rate".to_string(),
        "-of".to_string(),
        "json".to_string(),
        input.to_string_lossy().into_owned(),
    ]
}

/// Probes `input` and returns its first video stream's properties.
pub fn probe<R: CommandRunner + ?Sized>(
    runner: &R,
    ffprobe: &str,
    input: &Path,
) -> Result<VideoInfo, ProbeError> {
    let stdout = runner.run(&build_probe_command(ffprobe, input))?;
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a `VideoInfo`.
pub fn parse_ffprobe_output(json_str: &str) -> Result<VideoInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let stream = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .next()
        .ok_or(ProbeError::NoVideoStream)?;

    let width = stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| ProbeError::Parse("missing stream width".to_string()))?;
    let height = stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| ProbeError::Parse("missing stream height".to_string()))?;

    let fps = match stream.r_frame_rate {
        Some(serde_json::Value::String(rate)) => parse_frame_rate(&rate)?,
        Some(serde_json::Value::Number(n)) => {
            let rate = n.as_f64().unwrap_or(f64::NAN);
            validate_rate(rate, &n.to_string())?
        }
        Some(other) => return Err(ProbeError::InvalidFrameRate(other.to_string())),
        None => return Err(ProbeError::Parse("missing r_frame_rate".to_string())),
    };

    Ok(VideoInfo { width, height, fps })
}

/// Parses a frame rate given as a plain number (`"29.97"`) or a rational
/// (`"30000/1001"`).
pub fn parse_frame_rate(rate: &str) -> Result<f64, ProbeError> {
    let invalid = || ProbeError::InvalidFrameRate(rate.to_string());
    let trimmed = rate.trim();

    let value = match trimmed.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().map_err(|_| invalid())?;
            let den: f64 = den.trim().parse().map_err(|_| invalid())?;
            if den == 0.0 {
                return Err(invalid());
            }
            num / den
        }
        None => trimmed.parse().map_err(|_| invalid())?,
    };

    validate_rate(value, rate)
}

fn validate_rate(value: f64, raw: &str) -> Result<f64, ProbeError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ProbeError::InvalidFrameRate(raw.to_string()))
    }
}
