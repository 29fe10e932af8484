//! Real-ESRGAN x4plus through ONNX Runtime.
//!
//! The model takes one `[1, 3, H, W]` RGB tensor in `[0, 1]` and returns
//! `[1, 3, 4H, 4W]`. Frames are run whole, without tiling.

use super::{UpscaleError, SCALE};
use image::{DynamicImage, Rgb, RgbImage};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Whether ONNX Runtime can use CUDA on this machine.
pub(super) fn cuda_available() -> bool {
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

/// Loaded super-resolution model; one per job.
pub struct NeuralUpscaler {
    session: Mutex<Session>,
}

impl fmt::Debug for NeuralUpscaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeuralUpscaler").finish_non_exhaustive()
    }
}

impl NeuralUpscaler {
    /// Loads the weights at `model_path` onto the CUDA execution provider.
    pub fn load(model_path: &Path) -> Result<Self, UpscaleError> {
        let model_bytes = std::fs::read(model_path)?;

        let session = Session::builder()
            .map_err(|e| UpscaleError::Model(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| UpscaleError::Model(format!("Failed to set optimization level: {}", e)))?
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .map_err(|e| UpscaleError::Model(format!("Failed to register CUDA: {}", e)))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| UpscaleError::Model(format!("Failed to load model: {}", e)))?;

        info!(model = %model_path.display(), "Loaded super-resolution model on CUDA");
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    pub fn upscale(&self, frame: &DynamicImage) -> Result<DynamicImage, UpscaleError> {
        let rgb = frame.to_rgb8();
        let (width, height) = rgb.dimensions();
        let input = to_nchw(&rgb)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| UpscaleError::Model("Session lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| UpscaleError::Model(format!("Inference failed: {}", e)))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| UpscaleError::Model(format!("Failed to extract tensor: {}", e)))?;

        let (out_w, out_h) = (width * SCALE, height * SCALE);
        let expected = [1, 3, out_h as i64, out_w as i64];
        if shape.len() != 4 || shape.iter().zip(expected.iter()).any(|(a, b)| a != b) {
            return Err(UpscaleError::Model(format!(
                "Unexpected output shape {:?}, wanted {:?}",
                shape.iter().collect::<Vec<_>>(),
                expected
            )));
        }

        Ok(DynamicImage::ImageRgb8(from_nchw(data, out_w, out_h)))
    }
}

/// HWC u8 pixels to a normalized `[1, 3, H, W]` tensor.
fn to_nchw(rgb: &RgbImage) -> Result<Value, UpscaleError> {
    let (w, h) = rgb.dimensions();
    let mut chw = Vec::with_capacity(3 * w as usize * h as usize);
    for c in 0..3 {
        chw.extend(rgb.pixels().map(|p| p[c] as f32 / 255.0));
    }

    let shape = vec![1usize, 3, h as usize, w as usize];
    Tensor::from_array((shape, chw.into_boxed_slice()))
        .map(Value::from)
        .map_err(|e| UpscaleError::Model(format!("Failed to create tensor: {}", e)))
}

fn from_nchw(data: &[f32], width: u32, height: u32) -> RgbImage {
    let plane = width as usize * height as usize;
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    RgbImage::from_fn(width, height, |x, y| {
        let i = y as usize * width as usize + x as usize;
        Rgb([
            to_u8(data[i]),
            to_u8(data[plane + i]),
            to_u8(data[2 * plane + i]),
        ])
    })
}
