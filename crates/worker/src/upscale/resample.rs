use super::SCALE;
use image::imageops::FilterType;
use image::DynamicImage;

/// Lanczos3 resampling, the path used whenever no accelerator is in play.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResampleUpscaler;

impl ResampleUpscaler {
    pub fn new() -> Self {
        ResampleUpscaler
    }

    pub fn upscale(&self, frame: &DynamicImage) -> DynamicImage {
        frame.resize_exact(
            frame.width() * SCALE,
            frame.height() * SCALE,
            FilterType::Lanczos3,
        )
    }
}
