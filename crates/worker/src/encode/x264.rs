//! H.264 encoder invocation.
//!
//! Builds the ffmpeg command that reads the upscaled image sequence at the
//! source frame rate, scales it to the target height and muxes in the
//! source's audio track when there is one.

use crate::extract::FRAME_PATTERN;
use crate::runner::{CommandRunner, ToolError};
use std::fs;
use std::path::PathBuf;
use tracing::debug;
use upscale_worker_config::EncodeConfig;

/// Inputs for one encode.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Original video; audio is taken from here
    pub input_path: PathBuf,
    /// Directory of upscaled `%08d.png` frames
    pub frames_dir: PathBuf,
    /// Final output file
    pub output_path: PathBuf,
    /// Frame rate of the source video
    pub fps: f64,
    /// Output height; width follows the aspect ratio, rounded to even
    pub target_height: u32,
}

impl EncodeParams {
    pub fn new(
        input_path: PathBuf,
        frames_dir: PathBuf,
        output_path: PathBuf,
        fps: f64,
        target_height: u32,
    ) -> Self {
        Self {
            input_path,
            frames_dir,
            output_path,
            fps,
            target_height,
        }
    }
}

/// Build the ffmpeg argv for an encode.
///
/// # Arguments
/// * `ffmpeg` - Program name or path
/// * `params` - Paths, frame rate and height for this job
/// * `settings` - Codec preset, CRF and audio bitrate
pub fn build_encode_command(
    ffmpeg: &str,
    params: &EncodeParams,
    settings: &EncodeConfig,
) -> Vec<String> {
    let mut args: Vec<String> = vec![ffmpeg.to_string(), "-y".to_string()];

    // Audio source
    args.push("-i".to_string());
    args.push(params.input_path.to_string_lossy().into_owned());

    // Image sequence at the source rate
    args.push("-framerate".to_string());
    args.push(params.fps.to_string());
    args.push("-i".to_string());
    args.push(
        params
            .frames_dir
            .join(FRAME_PATTERN)
            .to_string_lossy()
            .into_owned(),
    );

    // Video from the frames, audio (if any) from the source
    args.extend(["-map", "1:v:0", "-map", "0:a?"].map(String::from));

    args.push("-vf".to_string());
    args.push(format!(
        "scale=-2:{}:flags=lanczos,setsar=1",
        params.target_height
    ));

    args.extend(["-c:v", "libx264", "-preset"].map(String::from));
    args.push(settings.preset.clone());
    args.push("-crf".to_string());
    args.push(settings.crf.to_string());
    args.extend(["-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a"].map(String::from));
    args.push(settings.audio_bitrate.clone());

    args.push("-shortest".to_string());
    args.push(params.output_path.to_string_lossy().into_owned());
    args
}

/// Encode the upscaled frames, creating the output's directory first.
pub fn encode_video<R: CommandRunner + ?Sized>(
    runner: &R,
    ffmpeg: &str,
    params: &EncodeParams,
    settings: &EncodeConfig,
) -> Result<(), ToolError> {
    if let Some(parent) = params.output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    runner.run(&build_encode_command(ffmpeg, params, settings))?;
    debug!(output = %params.output_path.display(), "Encode finished");
    Ok(())
}
