//! Scheduler loop for the upscale worker
//!
//! Polls the job store for the next queued job and runs it to completion
//! before looking again. One job is in flight at a time; the pipeline runs
//! on a blocking thread so the runtime stays free for the status server and
//! signal handling.

use crate::pipeline::{JobOutcome, JobPipeline};
use crate::runner::CommandRunner;
use crate::stats::{now_unix_ms, SharedStats};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Result of one scheduling pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// Nothing was queued.
    Idle,
    /// A job was handed to the pipeline. `outcome` is `None` when the
    /// pipeline itself errored or panicked.
    Ran {
        job_id: String,
        outcome: Option<JobOutcome>,
    },
}

impl Tick {
    /// Whether a job reached a terminal state through the pipeline.
    ///
    /// Only then does the loop look for the next job without waiting; a
    /// record the pipeline could not settle would otherwise be picked again
    /// immediately.
    pub fn settled_job(&self) -> bool {
        matches!(
            self,
            Tick::Ran {
                outcome: Some(JobOutcome::Completed | JobOutcome::Failed { .. }),
                ..
            }
        )
    }
}

/// Main control loop.
pub struct Scheduler<R: CommandRunner + 'static> {
    pipeline: Arc<JobPipeline<R>>,
    stats: SharedStats,
    poll_interval: Duration,
}

impl<R: CommandRunner + 'static> Scheduler<R> {
    pub fn new(pipeline: JobPipeline<R>, stats: SharedStats, poll_interval: Duration) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            stats,
            poll_interval,
        }
    }

    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    pub fn pipeline(&self) -> &JobPipeline<R> {
        &self.pipeline
    }

    /// Runs until `shutdown` turns true.
    ///
    /// Shutdown is only observed between jobs; a job already running is
    /// allowed to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            jobs_dir = %self.pipeline.store().layout().jobs_dir().display(),
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            "Worker ready"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.tick().await.settled_job() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed, stopping");
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Picks up at most one queued job and runs it.
    pub async fn tick(&self) -> Tick {
        let store = self.pipeline.store().clone();
        let next = tokio::task::spawn_blocking(move || store.find_next_queued()).await;
        self.stats.write().await.last_scan_unix_ms = now_unix_ms();

        let job = match next {
            Ok(Ok(Some(job))) => job,
            Ok(Ok(None)) => return Tick::Idle,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to scan job store");
                return Tick::Idle;
            }
            Err(e) => {
                error!(error = %e, "Job scan task failed");
                return Tick::Idle;
            }
        };

        let job_id = job.id;
        self.stats.write().await.current_job = Some(job_id.clone());
        info!(job_id = %job_id, "Processing job");

        let pipeline = self.pipeline.clone();
        let run_id = job_id.clone();
        let result = tokio::task::spawn_blocking(move || pipeline.run_job(&run_id)).await;

        let outcome = match result {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                error!(job_id = %job_id, error = %e, "Error processing job");
                self.record_failure(&job_id, e.to_string()).await;
                None
            }
            Err(e) => {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "Job task was cancelled".to_string()
                };
                error!(job_id = %job_id, error = %reason, "Job panicked");
                self.record_failure(&job_id, reason).await;
                None
            }
        };

        {
            let mut stats = self.stats.write().await;
            stats.current_job = None;
            match &outcome {
                Some(JobOutcome::Completed) => stats.jobs_completed += 1,
                Some(JobOutcome::Skipped { .. }) => {}
                Some(JobOutcome::Failed { .. }) | None => stats.jobs_failed += 1,
            }
        }

        Tick::Ran { job_id, outcome }
    }

    /// Best-effort `failed` write for a job that escaped the pipeline.
    async fn record_failure(&self, job_id: &str, reason: String) {
        let store = self.pipeline.store().clone();
        let id = job_id.to_string();
        match tokio::task::spawn_blocking(move || store.mark_failed(&id, &reason)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(job_id, error = %e, "Could not mark job as failed"),
            Err(e) => warn!(job_id, error = %e, "Could not mark job as failed"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Job panicked".to_string()
    }
}
