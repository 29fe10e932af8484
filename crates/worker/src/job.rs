//! Job descriptor model and its state machine.
//!
//! A job record is a small JSON document written by an external producer in
//! the `queued` state and then driven forward by this worker:
//! `queued -> processing -> {completed | failed}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Progress recorded as soon as a job is claimed.
pub const PICKUP_PROGRESS: f64 = 1.0;

/// Upper bound on progress reported by the frame upscaling stage.
pub const UPSCALE_PROGRESS_CAP: f64 = 90.0;

/// Progress recorded once upscaling is done and encoding starts.
pub const ENCODE_PROGRESS: f64 = 92.0;

/// Progress of a completed job.
pub const COMPLETE_PROGRESS: f64 = 100.0;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up.
    #[default]
    Queued,
    /// Claimed by the worker and running through the pipeline.
    Processing,
    /// Output written successfully.
    Completed,
    /// A stage failed; `error` holds the reason.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    /// Whether no further transitions happen from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// A persisted upscale job.
///
/// Fields this worker does not know about are kept in `extra` so a rewrite
/// never drops data written by the producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Unique job identifier, also used to name the workspace.
    pub id: String,
    #[serde(default)]
    pub status: JobStatus,
    /// Percent complete in [0, 100].
    #[serde(default)]
    pub progress: f64,
    /// Source video, relative to the storage root.
    pub input_path: PathBuf,
    /// Final deliverable, relative to the storage root.
    pub output_path: PathBuf,
    /// Requested output height; `None` or 0 selects the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Rejected state machine move.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Job {id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobDescriptor {
    /// Creates a queued job, as a producer would write it.
    pub fn queued(id: impl Into<String>, input_path: PathBuf, output_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            progress: 0.0,
            input_path,
            output_path,
            target_height: None,
            error: None,
            original_name: None,
            created_at: Some(now),
            updated_at: Some(now),
            extra: Map::new(),
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Claim a queued job: `processing` with the pickup progress.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Queued {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to: JobStatus::Processing,
            });
        }
        self.transition(JobStatus::Processing)?;
        self.error = None;
        self.progress = PICKUP_PROGRESS;
        Ok(())
    }

    /// Record progress. Values below the current one are ignored and the
    /// result is clamped to [0, 100].
    pub fn advance_progress(&mut self, progress: f64) {
        if progress.is_nan() {
            return;
        }
        let clamped = progress.clamp(0.0, COMPLETE_PROGRESS);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }

    /// Mark the job completed at 100%.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.progress = COMPLETE_PROGRESS;
        self.error = None;
        Ok(())
    }

    /// Mark the job failed with a reason. Progress keeps its last value.
    pub fn fail(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(reason.to_string());
        Ok(())
    }

    /// Check if the job is in a terminal state (completed or failed).
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Requested height, treating 0 as "not requested".
    pub fn requested_height(&self) -> Option<u32> {
        self.target_height.filter(|h| *h > 0)
    }
}
