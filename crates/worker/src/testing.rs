//! Test doubles shared by the pipeline, scheduler and server tests.

use crate::extract::frame_file_name;
use crate::job::JobDescriptor;
use crate::runner::{CommandRunner, ToolError};
use crate::store::{JobStore, StorageLayout};
use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

/// Stands in for ffprobe/ffmpeg.
///
/// Probes report a fixed stream, extraction writes `frame_count` small PNGs
/// and encoding writes a placeholder output file.
pub(crate) struct FakeRunner {
    pub width: u32,
    pub height: u32,
    pub frame_rate: String,
    pub frame_count: usize,
    /// 1-based frame written as garbage instead of a PNG
    pub corrupt_frame: Option<usize>,
    /// Fail any command whose argv contains the first string, with the second as stderr
    pub fail_on: Option<(String, String)>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeRunner {
    pub fn new(frame_count: usize) -> Self {
        Self {
            width: 8,
            height: 6,
            frame_rate: "30/1".to_string(),
            frame_count,
            corrupt_frame: None,
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_source_height(mut self, height: u32) -> Self {
        self.height = height;
        self
    }

    pub fn with_corrupt_frame(mut self, index: usize) -> Self {
        self.corrupt_frame = Some(index);
        self
    }

    pub fn failing_on(mut self, marker: &str, stderr: &str) -> Self {
        self.fail_on = Some((marker.to_string(), stderr.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn encode_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| is_encode(argv))
            .collect()
    }

    fn write_frames(&self, pattern: &str) {
        let dir = Path::new(pattern).parent().unwrap();
        fs::create_dir_all(dir).unwrap();
        for i in 1..=self.frame_count {
            let path = dir.join(frame_file_name(i));
            if self.corrupt_frame == Some(i) {
                fs::write(&path, b"definitely not a png").unwrap();
                continue;
            }
            let img = RgbImage::from_fn(self.width, self.height, |x, y| {
                Rgb([(x * 20) as u8, (y * 30) as u8, (i * 10) as u8])
            });
            img.save(&path).unwrap();
        }
    }
}

fn is_encode(argv: &[String]) -> bool {
    argv.iter().any(|a| a == "-shortest")
}

impl CommandRunner for FakeRunner {
    fn run(&self, argv: &[String]) -> Result<String, ToolError> {
        self.calls.lock().unwrap().push(argv.to_vec());

        if let Some((marker, stderr)) = &self.fail_on {
            if argv.iter().any(|a| a.contains(marker.as_str())) {
                return Err(ToolError::Failed {
                    message: stderr.clone(),
                });
            }
        }

        let last = argv.last().cloned().unwrap_or_default();
        if argv[0] == "ffprobe" {
            return Ok(format!(
                r#"{{ "streams": [ {{ "width": {}, "height": {}, "r_frame_rate": "{}" }} ] }}"#,
                self.width, self.height, self.frame_rate
            ));
        }
        if is_encode(argv) {
            let output = PathBuf::from(&last);
            fs::write(output, b"fake mp4").unwrap();
            return Ok(String::new());
        }
        if argv.iter().any(|a| a == "-vsync") {
            self.write_frames(&last);
            return Ok(String::new());
        }
        Ok(String::new())
    }
}

/// A job store rooted in a fresh temp directory.
pub(crate) fn make_store() -> (TempDir, JobStore) {
    let temp_dir = TempDir::new().unwrap();
    let layout = StorageLayout::new(temp_dir.path());
    layout.ensure().unwrap();
    (temp_dir, JobStore::new(layout))
}

/// Writes a queued record for `id` with the usual upload/output paths.
pub(crate) fn queue_job(store: &JobStore, id: &str) -> JobDescriptor {
    let mut job = JobDescriptor::queued(
        id,
        PathBuf::from(format!("uploads/{}.mp4", id)),
        PathBuf::from(format!("outputs/{}.mp4", id)),
    );
    store.save(&mut job).unwrap();
    job
}
