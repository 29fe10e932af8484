//! Upscale Worker
//!
//! Single-node batch worker that picks queued video jobs from a file-backed
//! store, upscales every frame 4x and re-encodes the result.

pub mod encode;
pub mod extract;
pub mod job;
pub mod pipeline;
pub mod probe;
pub mod runner;
pub mod scheduler;
pub mod startup;
pub mod stats;
pub mod status_server;
pub mod store;
pub mod upscale;

#[cfg(test)]
pub(crate) mod testing;

pub use encode::{build_encode_command, encode_video, EncodeParams};
pub use extract::{build_extract_command, extract_frames};
pub use job::{JobDescriptor, JobStatus, TransitionError};
pub use pipeline::{
    effective_target_height, JobError, JobOutcome, JobPipeline, PipelineSettings, Workspace,
};
pub use probe::{parse_ffprobe_output, parse_frame_rate, probe, ProbeError, VideoInfo};
pub use runner::{CommandRunner, SystemRunner, ToolError};
pub use scheduler::{Scheduler, Tick};
pub use startup::{check_tool_available, parse_tool_version, run_startup_checks, StartupError};
pub use stats::{new_shared_stats, SharedStats, WorkerStats};
pub use status_server::{create_status_router, run_status_server, ServerError, StatusState};
pub use store::{JobStore, StorageLayout, StoreError};
pub use upscale::{upscale_frames, UpscaleError, Upscaler};
pub use upscale_worker_config as config;
pub use upscale_worker_config::Config;
