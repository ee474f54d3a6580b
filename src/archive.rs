//! Persistent storage for finished jobs.
//!
//! Each archived job owns a subdirectory named by job id, holding the full
//! record in a `meta` file and, when the test produced output, a copy of the
//! captured stdout/stderr as `stdout.log`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::job::{self, Job};

/// Filename for captured output inside an archive entry.
pub const OUTPUT_LOG: &str = "stdout.log";

const META_FILE: &str = "meta";

#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
}

impl Archive {
    pub fn new(path: impl Into<PathBuf>) -> Archive {
        Archive { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store a terminal job. When `output_path` is given its content is
    /// copied into the entry and `job.log` is set on the stored record.
    /// Archiving the same id again overwrites the previous entry.
    pub fn archive(&self, job: &mut Job, output_path: Option<&Path>) -> Result<()> {
        let job_dir = self.job_dir(&job.id);
        fs::create_dir_all(&job_dir)
            .with_context(|| format!("create archive entry {}", job_dir.display()))?;
        if let Some(output_path) = output_path {
            fs::copy(output_path, job_dir.join(OUTPUT_LOG))
                .with_context(|| format!("copy test output {}", output_path.display()))?;
            job.log = Some(OUTPUT_LOG.to_string());
        }
        let contents = serde_json::to_string(job).context("encode job record")?;
        fs::write(job_dir.join(META_FILE), contents)
            .with_context(|| format!("write archive meta for {}", job.id))?;
        debug!(job_id = %job.id, archive = %self.path.display(), "job archived");
        Ok(())
    }

    /// Every archived record, ascending by submission time (ties by id).
    /// A missing archive root reads as empty; entries with an unreadable
    /// meta are logged and skipped.
    pub fn dump(&self) -> Result<Vec<Job>> {
        if !self.path.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.path)
            .with_context(|| format!("read archive directory {}", self.path.display()))?;
        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("read archive directory {}", self.path.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            let parsed = fs::read(&meta_path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_slice::<Job>(&raw).map_err(anyhow::Error::from));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    warn!(path = %meta_path.display(), error = %err, "skipping unreadable archive entry");
                }
            }
        }
        job::sort_by_time(&mut jobs);
        Ok(jobs)
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.path.join(job_id)
    }
}
