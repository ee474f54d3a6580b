//! Persistent per-slot job queue.
//!
//! One file per live job, named by job id, containing the JSON job record.
//! Saves go through a dot-prefixed temp file and a rename, so a crash mid-write
//! leaves either the old or the new record on disk. Records that fail to read
//! back are skipped by `dump` rather than propagated, so one corrupt file
//! cannot stall recovery.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::job::{self, Job};

/// Directory-backed map from job id to job record.
#[derive(Debug, Clone)]
pub struct JobQueue {
    path: PathBuf,
}

impl JobQueue {
    pub fn new(path: impl Into<PathBuf>) -> JobQueue {
        JobQueue { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the record for `job.id`, creating the queue directory if needed.
    /// Overwrites any previous record for the same id.
    pub fn save(&self, job: &Job) -> Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("create queue directory {}", self.path.display()))?;
        let contents = serde_json::to_string(job).context("encode job record")?;
        let tmp_path = self.path.join(format!(".{}.tmp", job.id));
        fs::write(&tmp_path, contents)
            .with_context(|| format!("write job record {}", tmp_path.display()))?;
        fs::rename(&tmp_path, self.job_path(&job.id))
            .with_context(|| format!("publish job record for {}", job.id))?;
        debug!(job_id = %job.id, queue = %self.path.display(), "job record saved");
        Ok(())
    }

    /// Fetch one record. `None` when no file exists for the id; any other
    /// I/O or decode error propagates.
    pub fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let path = self.job_path(job_id);
        match fs::read(&path) {
            Ok(raw) => {
                let job = serde_json::from_slice(&raw)
                    .with_context(|| format!("decode job record {}", path.display()))?;
                Ok(Some(job))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("read job record {}", path.display()))
            }
        }
    }

    /// Drop one record. Removing an id that was never saved is a caller bug
    /// and surfaces as an error.
    pub fn remove(&self, job_id: &str) -> Result<()> {
        let path = self.job_path(job_id);
        fs::remove_file(&path)
            .with_context(|| format!("remove job record {}", path.display()))
    }

    /// Every record in the queue, ascending by submission time (ties by id).
    /// A missing queue directory reads as empty. Unreadable or corrupt
    /// records are logged and skipped.
    pub fn dump(&self) -> Result<Vec<Job>> {
        if !self.path.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.path)
            .with_context(|| format!("read queue directory {}", self.path.display()))?;
        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("read queue directory {}", self.path.display()))?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                // in-flight temp file
                continue;
            }
            let path = entry.path();
            let parsed = fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_slice::<Job>(&raw).map_err(anyhow::Error::from));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable job record");
                }
            }
        }
        job::sort_by_time(&mut jobs);
        Ok(jobs)
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.path.join(job_id)
    }
}
