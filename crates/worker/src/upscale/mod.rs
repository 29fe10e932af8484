//! Frame upscaling.
//!
//! An [`Upscaler`] is chosen once per job and then applied to every frame in
//! sequence order. Two strategies exist:
//!
//! - [`ResampleUpscaler`]: Lanczos3 resampling on the CPU, always available.
//! - `NeuralUpscaler`: Real-ESRGAN x4plus through ONNX Runtime on CUDA, only
//!   compiled with the `neural` feature.
//!
//! Both enlarge each linear dimension by exactly [`SCALE`].

mod resample;

#[cfg(feature = "neural")]
mod neural;

pub use resample::ResampleUpscaler;

#[cfg(feature = "neural")]
pub use neural::NeuralUpscaler;

use crate::job::UPSCALE_PROGRESS_CAP;
use crate::store::StoreError;
use image::DynamicImage;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};
use upscale_worker_config::{Accelerator, UpscaleConfig};

/// Linear enlargement factor of every strategy.
pub const SCALE: u32 = 4;

/// Message for a job whose extraction produced nothing.
pub const EMPTY_INPUT_MESSAGE: &str = "No frames extracted from input video.";

/// Error type for the upscale stage.
#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("{}", EMPTY_INPUT_MESSAGE)]
    EmptyInput,

    #[error("Failed to read frame {name}")]
    FrameRead { name: String },

    #[error("Failed to write frame {name}: {reason}")]
    FrameWrite { name: String, reason: String },

    /// Model weights are required but absent.
    #[error("Missing model weights at {}", .0.display())]
    MissingResource(PathBuf),

    /// The neural model failed to load or run.
    #[error("Model error: {0}")]
    Model(String),

    /// Persisting progress failed; the stage is aborted.
    #[error("Failed to record progress: {0}")]
    Progress(#[source] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Upscaling strategy for one job.
#[derive(Debug)]
pub enum Upscaler {
    Resample(ResampleUpscaler),
    #[cfg(feature = "neural")]
    Neural(NeuralUpscaler),
}

impl Upscaler {
    /// Picks the strategy for a job.
    ///
    /// The neural model is used only when it was compiled in, the
    /// accelerator setting allows it and CUDA is present. Its weights must
    /// then exist; a missing file fails the job rather than falling back.
    pub fn select(config: &UpscaleConfig) -> Result<Self, UpscaleError> {
        if config.accelerator == Accelerator::Cpu {
            debug!("Accelerator disabled by configuration");
            return Ok(Upscaler::Resample(ResampleUpscaler::new()));
        }

        #[cfg(feature = "neural")]
        {
            if neural::cuda_available() {
                ensure_model_present(&config.model_path)?;
                let model = NeuralUpscaler::load(&config.model_path)?;
                return Ok(Upscaler::Neural(model));
            }
            debug!("CUDA not available");
        }

        Ok(Upscaler::Resample(ResampleUpscaler::new()))
    }

    /// Short strategy name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Upscaler::Resample(_) => "resample",
            #[cfg(feature = "neural")]
            Upscaler::Neural(_) => "neural",
        }
    }

    /// Upscales one frame by [`SCALE`] in each dimension.
    pub fn upscale(&self, frame: &DynamicImage) -> Result<DynamicImage, UpscaleError> {
        match self {
            Upscaler::Resample(r) => Ok(r.upscale(frame)),
            #[cfg(feature = "neural")]
            Upscaler::Neural(n) => n.upscale(frame),
        }
    }
}

/// Fails with `MissingResource` unless `path` is an existing file.
pub fn ensure_model_present(path: &Path) -> Result<(), UpscaleError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(UpscaleError::MissingResource(path.to_path_buf()))
    }
}

/// Progress value after `processed` of `total` frames, capped at 90.
pub fn frame_progress(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (processed as f64 * UPSCALE_PROGRESS_CAP / total as f64).min(UPSCALE_PROGRESS_CAP)
}

/// The `*.png` files of `dir` in name order.
pub fn list_frames(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("png") {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Upscales every frame of `frames_dir` into `output_dir` under the same
/// file name, reporting progress after each one.
///
/// # Arguments
/// * `upscaler` - Strategy chosen for this job
/// * `frames_dir` - Extracted frames
/// * `output_dir` - Destination, created if missing
/// * `on_progress` - Receives the new progress value; an error aborts the stage
///
/// # Returns
/// The number of frames processed.
pub fn upscale_frames<F>(
    upscaler: &Upscaler,
    frames_dir: &Path,
    output_dir: &Path,
    mut on_progress: F,
) -> Result<usize, UpscaleError>
where
    F: FnMut(f64) -> Result<(), StoreError>,
{
    let frames = list_frames(frames_dir)?;
    if frames.is_empty() {
        return Err(UpscaleError::EmptyInput);
    }

    fs::create_dir_all(output_dir)?;
    let total = frames.len();
    info!(total, strategy = upscaler.name(), "Upscaling frames");

    for (index, frame_path) in frames.iter().enumerate() {
        let started = Instant::now();
        let name = frame_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let frame = image::open(frame_path).map_err(|_| UpscaleError::FrameRead {
            name: name.clone(),
        })?;
        let upscaled = upscaler.upscale(&frame)?;
        upscaled
            .save(output_dir.join(&name))
            .map_err(|e| UpscaleError::FrameWrite {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let processed = index + 1;
        on_progress(frame_progress(processed, total)).map_err(UpscaleError::Progress)?;

        debug!(
            frame = processed,
            total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscaled frame"
        );
    }

    Ok(total)
}
