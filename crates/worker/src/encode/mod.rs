//! Re-assembling upscaled frames into the deliverable video.

pub mod x264;

pub use x264::{build_encode_command, encode_video, EncodeParams};
