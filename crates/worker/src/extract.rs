//! Decomposing a video into numbered PNG frames.

use crate::runner::{CommandRunner, ToolError};
use std::fs;
use std::path::Path;
use tracing::debug;

/// ffmpeg image-sequence pattern shared by extraction and encoding.
///
/// Eight digits, zero padded, starting at 1, so name order is frame order.
pub const FRAME_PATTERN: &str = "%08d.png";

/// File name of the `index`-th (1-based) frame.
pub fn frame_file_name(index: usize) -> String {
    format!("{:08}.png", index)
}

/// Builds the ffmpeg argv that writes every decoded frame of `input` into
/// `frames_dir`.
pub fn build_extract_command(ffmpeg: &str, input: &Path, frames_dir: &Path) -> Vec<String> {
    vec![
        ffmpeg.to_string(),
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-vsync".to_string(),
        "0".to_string(),
        "-q:v".to_string(),
        "1".to_string(),
        frames_dir.join(FRAME_PATTERN).to_string_lossy().into_owned(),
    ]
}

/// Extracts all frames of `input` into `frames_dir`, creating it first.
pub fn extract_frames<R: CommandRunner + ?Sized>(
    runner: &R,
    ffmpeg: &str,
    input: &Path,
    frames_dir: &Path,
) -> Result<(), ToolError> {
    fs::create_dir_all(frames_dir)?;

    runner.run(&build_extract_command(ffmpeg, input, frames_dir))?;
    debug!(frames_dir = %frames_dir.display(), "Frame extraction finished");
    Ok(())
}
