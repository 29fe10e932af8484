//! Startup checks for the upscale worker
//!
//! Run once before the scheduler starts:
//! - Storage directories exist (jobs, tmp, outputs, uploads)
//! - ffprobe and ffmpeg can be executed

use crate::runner::CommandRunner;
use crate::store::StorageLayout;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};
use upscale_worker_config::Config;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to create storage directory under {}: {source}", .root.display())]
    Storage {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

/// Creates every storage directory under the layout's root.
pub fn prepare_storage(layout: &StorageLayout) -> Result<(), StartupError> {
    layout.ensure().map_err(|source| StartupError::Storage {
        root: layout.root().to_path_buf(),
        source,
    })
}

/// Extract the version token from `<tool> -version` output.
///
/// Handles release builds ("ffmpeg version 6.1.1 ...") and git builds
/// ("ffmpeg version n6.1-3-gabcdef ...", "ffmpeg version N-112345-g...").
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<String> {
    let marker = format!("{} version", tool.to_lowercase());
    version_output
        .lines()
        .map(str::trim)
        .find_map(|line| {
            let lower = line.to_lowercase();
            let start = lower.find(&marker)? + marker.len();
            line.get(start..)?.split_whitespace().next().map(String::from)
        })
}

/// Runs `<program> -version` and returns the parsed version, if any.
///
/// # Arguments
/// * `runner` - Executes the probe command
/// * `program` - Configured program name or path
/// * `tool` - Display name used in errors and for version parsing
pub fn check_tool_available<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    tool: &str,
) -> Result<Option<String>, StartupError> {
    let output = runner
        .run(&[program.to_string(), "-version".to_string()])
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version failed; is it installed and in PATH? {}", program, e),
        })?;

    Ok(parse_tool_version(&output, tool))
}

/// Run all startup checks in order
///
/// 1. Storage directories
/// 2. ffprobe and ffmpeg availability, unless `skip_tool_checks`
pub fn run_startup_checks<R: CommandRunner + ?Sized>(
    config: &Config,
    runner: &R,
    skip_tool_checks: bool,
) -> Result<(), StartupError> {
    let layout = StorageLayout::new(&config.storage.root);
    prepare_storage(&layout)?;
    info!(root = %layout.root().display(), "Storage ready");

    if skip_tool_checks {
        warn!("Skipping external tool checks");
        return Ok(());
    }

    for (program, tool) in [
        (config.tools.ffprobe.as_str(), "ffprobe"),
        (config.tools.ffmpeg.as_str(), "ffmpeg"),
    ] {
        match check_tool_available(runner, program, tool)? {
            Some(version) => info!(tool, %version, "Found external tool"),
            None => warn!(tool, "Tool runs but its version could not be parsed"),
        }
    }

    Ok(())
}
