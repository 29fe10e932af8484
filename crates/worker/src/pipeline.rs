//! Job pipeline
//!
//! Runs one job through probe, extraction, upscaling and encoding, recording
//! every state change in the job store. Stage failures become a `failed`
//! record carrying the stage's message; the per-job workspace under
//! `tmp/<id>` is removed however the run ends.

use crate::encode::{encode_video, EncodeParams};
use crate::extract::extract_frames;
use crate::job::{JobDescriptor, JobStatus, TransitionError, ENCODE_PROGRESS};
use crate::probe::{probe, ProbeError};
use crate::runner::{CommandRunner, ToolError};
use crate::store::{JobStore, StoreError};
use crate::upscale::{upscale_frames, UpscaleError, Upscaler};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use upscale_worker_config::{Config, EncodeConfig, UpscaleConfig};

/// Error type for job execution
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Upscale(#[from] UpscaleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Failed to create the per-job workspace
    #[error("Failed to create workspace: {0}")]
    Workspace(io::Error),
}

/// How a picked-up job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed { message: String },
    /// The record was no longer queued when the pipeline loaded it.
    Skipped { status: JobStatus },
}

/// Transient per-job directory tree, removed on drop.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Creates `root/frames` and `root/upscaled`.
    pub fn create(root: PathBuf) -> io::Result<Self> {
        let workspace = Self { root };
        fs::create_dir_all(workspace.frames_dir())?;
        fs::create_dir_all(workspace.upscaled_dir())?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    pub fn upscaled_dir(&self) -> PathBuf {
        self.root.join("upscaled")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(workspace = %self.root.display(), "Removed workspace"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(workspace = %self.root.display(), error = %e, "Failed to remove workspace"),
        }
    }
}

/// Output height for a job: the requested (or default) height, but never
/// below the source, so videos are never downscaled.
pub fn effective_target_height(requested: Option<u32>, default: u32, source: u32) -> u32 {
    requested.filter(|h| *h > 0).unwrap_or(default).max(source)
}

/// Settings the pipeline needs from the worker configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub default_target_height: u32,
    pub upscale: UpscaleConfig,
    pub encode: EncodeConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg: config.tools.ffmpeg.clone(),
            ffprobe: config.tools.ffprobe.clone(),
            default_target_height: config.worker.default_target_height,
            upscale: config.upscale.clone(),
            encode: config.encode.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Sequences the stages of one job.
pub struct JobPipeline<R: CommandRunner> {
    store: JobStore,
    runner: R,
    settings: PipelineSettings,
}

impl<R: CommandRunner> JobPipeline<R> {
    pub fn new(store: JobStore, runner: R, settings: PipelineSettings) -> Self {
        Self {
            store,
            runner,
            settings,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs the job `job_id` to a terminal state.
    ///
    /// Stage failures are recorded on the job and reported as
    /// `JobOutcome::Failed`. An `Err` means the outcome itself could not be
    /// recorded.
    pub fn run_job(&self, job_id: &str) -> Result<JobOutcome, JobError> {
        let mut job = self.store.load(job_id)?;
        if job.status != JobStatus::Queued {
            warn!(job_id, status = %job.status, "Job is no longer queued, not running it");
            return Ok(JobOutcome::Skipped { status: job.status });
        }

        job.start()?;
        self.store.save(&mut job)?;
        info!(job_id, input = %job.input_path.display(), "Job picked up");

        match self.execute(&mut job) {
            Ok(()) => {
                job.complete()?;
                self.store.save(&mut job)?;
                info!(job_id, output = %job.output_path.display(), "Job completed");
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id, progress = job.progress, error = %message, "Job failed");
                job.fail(&message)?;
                self.store.save(&mut job)?;
                Ok(JobOutcome::Failed { message })
            }
        }
    }

    fn execute(&self, job: &mut JobDescriptor) -> Result<(), JobError> {
        let layout = self.store.layout();
        let workspace =
            Workspace::create(layout.workspace_dir(&job.id)).map_err(JobError::Workspace)?;
        let input = layout.resolve(&job.input_path);
        let output = layout.resolve(&job.output_path);

        let info = probe(&self.runner, &self.settings.ffprobe, &input)?;
        let target_height = effective_target_height(
            job.requested_height(),
            self.settings.default_target_height,
            info.height,
        );
        info!(
            job_id = %job.id,
            stage = "probe",
            width = info.width,
            height = info.height,
            fps = info.fps,
            target_height,
            "Probed input"
        );

        info!(job_id = %job.id, stage = "extract", "Extracting frames");
        extract_frames(
            &self.runner,
            &self.settings.ffmpeg,
            &input,
            &workspace.frames_dir(),
        )?;

        let upscaler = Upscaler::select(&self.settings.upscale)?;
        info!(job_id = %job.id, stage = "upscale", strategy = upscaler.name(), "Upscaling frames");
        let store = &self.store;
        upscale_frames(
            &upscaler,
            &workspace.frames_dir(),
            &workspace.upscaled_dir(),
            |progress| {
                job.advance_progress(progress);
                store.save(&mut *job)
            },
        )?;

        job.advance_progress(ENCODE_PROGRESS);
        self.store.save(job)?;

        info!(job_id = %job.id, stage = "encode", target_height, "Encoding video");
        let params = EncodeParams::new(
            input,
            workspace.upscaled_dir(),
            output,
            info.fps,
            target_height,
        );
        encode_video(
            &self.runner,
            &self.settings.ffmpeg,
            &params,
            &self.settings.encode,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_store, queue_job, FakeRunner};
    use image::GenericImageView;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use upscale_worker_config::Accelerator;

    fn cpu_settings() -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        settings.upscale.accelerator = Accelerator::Cpu;
        settings
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_effective_target_height() {
        assert_eq!(effective_target_height(Some(720), 1080, 1080), 1080);
        assert_eq!(effective_target_height(None, 1080, 480), 1080);
        assert_eq!(effective_target_height(Some(0), 1080, 480), 1080);
        assert_eq!(effective_target_height(Some(2160), 1080, 1080), 2160);
        assert_eq!(effective_target_height(None, 1080, 1440), 1440);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_target_height_never_below_source(
            requested in proptest::option::of(0u32..5000),
            source in 1u32..5000,
        ) {
            let h = effective_target_height(requested, 1080, source);
            prop_assert!(h >= source);
            prop_assert!(h >= requested.unwrap_or(0));
        }
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let (dir, _store) = make_store();
        let root = dir.path().join("tmp/job-1");
        {
            let workspace = Workspace::create(root.clone()).unwrap();
            assert!(workspace.frames_dir().is_dir());
            assert!(workspace.upscaled_dir().is_dir());
            fs::write(workspace.frames_dir().join("00000001.png"), b"x").unwrap();
        }
        assert!(!root.exists());
    }

    #[test]
    fn test_end_to_end_cpu_run() {
        let (_dir, store) = make_store();
        queue_job(&store, "job-1");
        let pipeline = JobPipeline::new(store.clone(), FakeRunner::new(10), cpu_settings());

        let outcome = pipeline.run_job("job-1").unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let job = store.load("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.error.is_none());
        assert!(store.layout().resolve(&job.output_path).exists());
        assert!(!store.layout().workspace_dir("job-1").exists());

        let encodes = pipeline.runner().encode_calls();
        assert_eq!(encodes.len(), 1);
        assert!(has_flag_with_value(&encodes[0], "-framerate", "30"));
        assert!(has_flag_with_value(
            &encodes[0],
            "-vf",
            "scale=-2:1080:flags=lanczos,setsar=1"
        ));
    }

    /// Keeps the upscaled frames around by snapshotting them before encode.
    struct SnapshotRunner {
        inner: FakeRunner,
        snapshot: Mutex<Vec<(u32, u32)>>,
    }

    impl CommandRunner for SnapshotRunner {
        fn run(&self, argv: &[String]) -> Result<String, ToolError> {
            if argv.iter().any(|a| a == "-shortest") {
                let pattern = argv
                    .windows(2)
                    .filter(|w| w[0] == "-i")
                    .map(|w| w[1].clone())
                    .last()
                    .unwrap();
                let dir = Path::new(&pattern).parent().unwrap();
                let mut dims = self.snapshot.lock().unwrap();
                for path in crate::upscale::list_frames(dir).unwrap() {
                    dims.push(image::open(path).unwrap().dimensions());
                }
            }
            self.inner.run(argv)
        }
    }

    #[test]
    fn test_frames_are_exactly_four_times() {
        let (_dir, store) = make_store();
        queue_job(&store, "job-1");
        let runner = SnapshotRunner {
            inner: FakeRunner::new(10),
            snapshot: Mutex::new(Vec::new()),
        };
        let pipeline = JobPipeline::new(store, runner, cpu_settings());

        assert_eq!(pipeline.run_job("job-1").unwrap(), JobOutcome::Completed);

        let dims = pipeline.runner().snapshot.lock().unwrap().clone();
        assert_eq!(dims.len(), 10);
        assert!(dims.iter().all(|d| *d == (32, 24)));
    }

    #[test]
    fn test_requested_height_applied() {
        let (_dir, store) = make_store();
        let mut job = queue_job(&store, "job-1");
        job.target_height = Some(2160);
        store.save(&mut job).unwrap();

        let runner = FakeRunner::new(2).with_source_height(6);
        let pipeline = JobPipeline::new(store, runner, cpu_settings());
        pipeline.run_job("job-1").unwrap();

        let encodes = pipeline.runner().encode_calls();
        assert!(has_flag_with_value(
            &encodes[0],
            "-vf",
            "scale=-2:2160:flags=lanczos,setsar=1"
        ));
    }

    #[test]
    fn test_zero_frames_fails_without_encoding() {
        let (_dir, store) = make_store();
        queue_job(&store, "job-1");
        let pipeline = JobPipeline::new(store.clone(), FakeRunner::new(0), cpu_settings());

        let outcome = pipeline.run_job("job-1").unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                message: "No frames extracted from input video.".to_string()
            }
        );

        let job = store.load("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("No frames extracted from input video."));
        assert!(pipeline.runner().encode_calls().is_empty());
        assert!(!store.layout().workspace_dir("job-1").exists());
    }

    #[test]
    fn test_corrupt_frame_keeps_last_progress() {
        let (_dir, store) = make_store();
        queue_job(&store, "job-1");
        let runner = FakeRunner::new(10).with_corrupt_frame(7);
        let pipeline = JobPipeline::new(store.clone(), runner, cpu_settings());

        pipeline.run_job("job-1").unwrap();

        let job = store.load("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Failed to read frame 00000007.png"));
        assert_eq!(job.progress, 54.0);
        assert!(pipeline.runner().encode_calls().is_empty());
    }

    #[test]
    fn test_tool_stderr_recorded_verbatim() {
        let (_dir, store) = make_store();
        queue_job(&store, "job-1");
        let runner = FakeRunner::new(3).failing_on("-shortest", "Unknown encoder 'libx264'");
        let pipeline = JobPipeline::new(store.clone(), runner, cpu_settings());

        pipeline.run_job("job-1").unwrap();

        let job = store.load("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Unknown encoder 'libx264'"));
        assert_eq!(job.progress, ENCODE_PROGRESS);
    }

    #[test]
    fn test_probe_failure_fails_at_pickup_progress() {
        let (_dir, store) = make_store();
        queue_job(&store, "job-1");
        let runner = FakeRunner::new(3).failing_on("v:0", "in.mp4: No such file or directory");
        let pipeline = JobPipeline::new(store.clone(), runner, cpu_settings());

        pipeline.run_job("job-1").unwrap();

        let job = store.load("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("in.mp4: No such file or directory"));
        assert_eq!(job.progress, 1.0);
    }

    #[test]
    fn test_processing_record_not_run() {
        let (_dir, store) = make_store();
        let mut job = queue_job(&store, "job-1");
        job.start().unwrap();
        job.advance_progress(54.0);
        store.save(&mut job).unwrap();

        let pipeline = JobPipeline::new(store.clone(), FakeRunner::new(10), cpu_settings());
        let outcome = pipeline.run_job("job-1").unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Skipped {
                status: JobStatus::Processing
            }
        );
        assert!(pipeline.runner().calls().is_empty());
        let job = store.load("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 54.0);
    }

    #[test]
    fn test_missing_record_is_error() {
        let (_dir, store) = make_store();
        let pipeline = JobPipeline::new(store, FakeRunner::new(1), cpu_settings());
        assert!(matches!(
            pipeline.run_job("ghost"),
            Err(JobError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn test_progress_is_non_decreasing() {
        let (_dir, store) = make_store();
        queue_job(&store, "job-1");
        let observed = Arc::new(Mutex::new(Vec::new()));

        // Poll the record from another thread while the job runs.
        let watcher_store = store.clone();
        let watcher_seen = observed.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let watcher_stop = stop.clone();
        let watcher = std::thread::spawn(move || {
            while !watcher_stop.load(Ordering::SeqCst) {
                if let Ok(job) = watcher_store.load("job-1") {
                    watcher_seen.lock().unwrap().push(job.progress);
                }
            }
        });

        let pipeline = JobPipeline::new(store.clone(), FakeRunner::new(10), cpu_settings());
        pipeline.run_job("job-1").unwrap();
        stop.store(true, Ordering::SeqCst);
        watcher.join().unwrap();

        let seen = observed.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", seen);
        assert_eq!(store.load("job-1").unwrap().progress, 100.0);
    }
}
