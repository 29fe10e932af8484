//! File-backed job store.
//!
//! Every job is one pretty-printed JSON file at `<root>/jobs/<id>.json`.
//! Writes go to a temp file in the same directory which is then renamed over
//! the record, so readers see either the old or the new record, never a torn one.

use crate::job::JobDescriptor;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from reading or writing job records.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the id.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The record exists but is not a valid job descriptor.
    #[error("Failed to parse job {id}: {source}")]
    Parse {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing the record failed.
    #[error("Job store IO error: {0}")]
    Io(#[from] io::Error),
}

/// Directory layout under the storage root.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Job records.
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    /// Per-job transient workspaces.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Final deliverables.
    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    /// Source videos written by the producer.
    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// Workspace directory for one job.
    pub fn workspace_dir(&self, job_id: &str) -> PathBuf {
        self.tmp_dir().join(job_id)
    }

    /// Path of the record for `job_id`.
    pub fn job_file(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{}.json", job_id))
    }

    /// Resolve a path stored in a job record against the root.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Creates every storage directory.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.jobs_dir(),
            self.tmp_dir(),
            self.outputs_dir(),
            self.uploads_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Load/save access to job records.
#[derive(Debug, Clone)]
pub struct JobStore {
    layout: StorageLayout,
}

impl JobStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Loads the record for `job_id`.
    ///
    /// The file name is the record key; a mismatched `id` field is replaced
    /// with it so every later write lands on the same file.
    pub fn load(&self, job_id: &str) -> Result<JobDescriptor, StoreError> {
        load_job_from_file(&self.layout.job_file(job_id), job_id)
    }

    /// Stamps `updated_at` and atomically replaces the record.
    pub fn save(&self, job: &mut JobDescriptor) -> Result<(), StoreError> {
        job.touch();

        let jobs_dir = self.layout.jobs_dir();
        fs::create_dir_all(&jobs_dir)?;

        let json = serde_json::to_string_pretty(job)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // The temp name has no .json extension, so scans never pick it up.
        let mut tmp = NamedTempFile::new_in(&jobs_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.job_file(&job.id))
            .map_err(|e| StoreError::Io(e.error))?;

        debug!(job_id = %job.id, status = %job.status, progress = job.progress, "Saved job record");
        Ok(())
    }

    /// Record paths in stable (file name) order.
    fn record_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let jobs_dir = self.layout.jobs_dir();
        if !jobs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&jobs_dir)? {
            let path = entry?.path();
            // Only process .json files
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// The first `queued` record in scan order.
    ///
    /// Records that fail to load are skipped.
    pub fn find_next_queued(&self) -> Result<Option<JobDescriptor>, StoreError> {
        for path in self.record_paths()? {
            match load_job_from_file(&path, &file_stem(&path)) {
                Ok(job) if job.status == crate::job::JobStatus::Queued => return Ok(Some(job)),
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable job record"),
            }
        }
        Ok(None)
    }

    /// The most recently modified record, if any parses.
    pub fn latest(&self) -> Result<Option<JobDescriptor>, StoreError> {
        let mut stamped: Vec<(SystemTime, PathBuf)> = Vec::new();
        for path in self.record_paths()? {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            stamped.push((modified, path));
        }
        stamped.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in stamped {
            match load_job_from_file(&path, &file_stem(&path)) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable job record"),
            }
        }
        Ok(None)
    }

    /// Best-effort terminal write used when a job escaped the pipeline.
    ///
    /// Returns `Ok(false)` without writing when the record is already terminal.
    pub fn mark_failed(&self, job_id: &str, reason: &str) -> Result<bool, StoreError> {
        let mut job = self.load(job_id)?;
        if job.is_terminal() {
            warn!(job_id, status = %job.status, "Not overwriting terminal job record");
            return Ok(false);
        }
        if job.fail(reason).is_err() {
            return Ok(false);
        }
        self.save(&mut job)?;
        Ok(true)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Loads a single job from a JSON file.
fn load_job_from_file(path: &Path, job_id: &str) -> Result<JobDescriptor, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(job_id.to_string()))
        }
        Err(e) => return Err(StoreError::Io(e)),
    };
    let mut job: JobDescriptor =
        serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            id: job_id.to_string(),
            source,
        })?;
    if job.id != job_id {
        warn!(
            path = %path.display(),
            record_id = %job.id,
            "Job record id does not match its file name, using the file name"
        );
        job.id = job_id.to_string();
    }
    Ok(job)
}
