//! External process execution.

use std::process::Command;
use thiserror::Error;
use tracing::debug;

/// Message used when a failing tool wrote nothing to stderr.
pub const GENERIC_FAILURE: &str = "Command failed";

/// Failure of an external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The process exited unsuccessfully; `message` is its trimmed stderr.
    #[error("{message}")]
    Failed { message: String },

    /// The process could not be started at all.
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Empty argv.
    #[error("No command given")]
    EmptyCommand,

    /// Preparing the tool's output location failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs an argv to completion and returns its stdout.
///
/// One attempt per call; failures are surfaced immediately.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String]) -> Result<String, ToolError>;
}

/// Runs commands as child processes of the worker.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String]) -> Result<String, ToolError> {
        let (program, args) = argv.split_first().ok_or(ToolError::EmptyCommand)?;
        debug!(command = %argv.join(" "), "Running external command");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                message: failure_message(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Trimmed stderr, or the generic message when there is none.
pub fn failure_message(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        GENERIC_FAILURE.to_string()
    } else {
        trimmed.to_string()
    }
}
