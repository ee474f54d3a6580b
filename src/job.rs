//! The job record, the one entity the whole service revolves around.
//!
//! The same JSON object is used on disk (queue files, archive metas) and on
//! the HTTP wire, so the serde derives here define both formats.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock seconds a test process may run. Server-assigned; clients
/// cannot override it.
pub const DEFAULT_MAX_DURATION: u64 = 90;

/// A single user-submitted request to run a named test in one environment
/// slot. Mutated only by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// 128-bit random identifier, lowercase hex.
    pub id: String,
    /// Opaque submitter name; non-empty.
    pub user: String,
    /// Environment slot index in `[0, envos_count)`.
    pub envo: usize,
    /// Test name, valid per the catalog at submission time.
    pub test: String,
    /// Deadline for the child process, in seconds.
    pub max_duration: u64,
    /// Submission timestamp (epoch seconds), stamped by the scheduler.
    pub time: f64,
    pub status: JobStatus,
    /// When the child process was first observed running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<f64>,
    /// When the child process terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<f64>,
    /// Failure description; present iff status is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Captured-output filename inside the archive entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl Job {
    /// Create a fresh record for submission. `time` stays zero until the
    /// scheduler handles the ADD event.
    pub fn new(user: impl Into<String>, envo: usize, test: impl Into<String>) -> Job {
        Job {
            id: Uuid::new_v4().simple().to_string(),
            user: user.into(),
            envo,
            test: test.into(),
            max_duration: DEFAULT_MAX_DURATION,
            time: 0.0,
            status: JobStatus::Enqueued,
            started: None,
            stopped: None,
            reason: None,
            log: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Enqueued,
    Starting,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Enqueued => "enqueued",
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

/// Sort ascending by submission time, ties broken by id.
pub fn sort_by_time(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.time
            .total_cmp(&b.time)
            .then_with(|| a.id.cmp(&b.id))
    });
}
