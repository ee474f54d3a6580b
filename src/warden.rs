//! Per-slot worker that supervises one external test process at a time.
//!
//! A warden owns a one-element inbox plus an atomic busy flag, so
//! `try_dispatch` never blocks and at most one job is in flight per slot.
//! The worker reports lifecycle events to the scheduler strictly in the
//! order STARTED, STOPPED, SUCCESS or FAILED, RESULT; the scheduler treats
//! RESULT as the signal that the slot is free again.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::catalog::TestCatalog;
use crate::job::Job;
use crate::scheduler::SchedulerHandle;

/// Filename for captured test output inside the working directory.
pub const OUTPUT_FILE: &str = "stdout.txt";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Dispatch-side handle to one warden worker thread.
#[derive(Debug)]
pub struct Warden {
    busy: Arc<AtomicBool>,
    inbox: SyncSender<Job>,
}

impl Warden {
    /// Start the worker thread for environment slot `envo`, working under
    /// `path` and reporting to `scheduler`.
    pub fn spawn(
        envo: usize,
        path: PathBuf,
        catalog: Arc<TestCatalog>,
        scheduler: SchedulerHandle,
    ) -> Warden {
        let busy = Arc::new(AtomicBool::new(false));
        let (inbox, jobs) = sync_channel(1);
        let worker = Worker {
            envo,
            path,
            catalog,
            scheduler,
            busy: Arc::clone(&busy),
        };
        std::thread::spawn(move || worker.run(jobs));
        Warden { busy, inbox }
    }

    /// Hand a job to the warden without blocking. Returns `true` when the
    /// warden was idle and now owns the job, `false` when it is busy.
    pub fn try_dispatch(&self, job: Job) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.inbox.try_send(job).is_err() {
            // worker gone or inbox unexpectedly full; give the flag back
            self.busy.store(false, Ordering::Release);
            return false;
        }
        true
    }
}

struct Worker {
    envo: usize,
    path: PathBuf,
    catalog: Arc<TestCatalog>,
    scheduler: SchedulerHandle,
    busy: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, jobs: Receiver<Job>) {
        info!(envo = self.envo, path = %self.path.display(), "warden started");
        while let Ok(job) = jobs.recv() {
            info!(envo = self.envo, job_id = %job.id, test = %job.test, "got new job");
            if let Err(err) = self.process(&job) {
                error!(
                    envo = self.envo,
                    job_id = %job.id,
                    error = %format!("{err:#}"),
                    "job crashed"
                );
                self.scheduler
                    .notify_job_failed(&job.id, format!("crashed: {err:#}"));
                self.scheduler.notify_job_result(&job.id, None);
            }
            // slot is free only after RESULT went out
            self.busy.store(false, Ordering::Release);
        }
        info!(envo = self.envo, "warden inbox closed, stopping");
    }

    /// Run one job through the execution protocol. A returned error means an
    /// unexpected crash; the caller converts it to FAILED + RESULT.
    fn process(&self, job: &Job) -> Result<()> {
        if let Err(err) = self.clean() {
            error!(
                envo = self.envo,
                path = %self.path.display(),
                error = %format!("{err:#}"),
                "failed to prepare working directory"
            );
            self.scheduler.notify_job_failed(&job.id, "working dir not ready");
            self.scheduler.notify_job_result(&job.id, None);
            return Ok(());
        }

        let Some(script) = self.catalog.resolve(&job.test) else {
            debug!(job_id = %job.id, test = %job.test, "test script not found");
            self.scheduler
                .notify_job_failed(&job.id, format!("no such test: {}", job.test));
            self.scheduler.notify_job_result(&job.id, None);
            return Ok(());
        };

        let output_path = self.path.join(OUTPUT_FILE);
        let output = fs::File::create(&output_path)
            .with_context(|| format!("create output file {}", output_path.display()))?;
        let errors = output.try_clone().context("clone output descriptor")?;

        let mut child = match Command::new("/bin/sh")
            .arg(&script)
            .env("LC_ALL", "C")
            .env("HOME", &self.path)
            .env("POTE_TESTS_PATH", self.catalog.root())
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(errors))
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                debug!(job_id = %job.id, error = %err, "test spawn failed");
                self.scheduler.notify_job_failed(&job.id, err.to_string());
                self.scheduler.notify_job_result(&job.id, None);
                return Ok(());
            }
        };
        info!(envo = self.envo, job_id = %job.id, pid = child.id(), "job started");
        self.scheduler.notify_job_started(&job.id);

        let deadline = Instant::now() + Duration::from_secs(job.max_duration);
        let mut timeouted = false;
        let status = loop {
            match child.try_wait().context("poll child process")? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    child.kill().context("kill timeouted child")?;
                    let status = child.wait().context("reap timeouted child")?;
                    timeouted = true;
                    break status;
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        };

        self.scheduler.notify_job_stopped(&job.id);
        if timeouted {
            debug!(envo = self.envo, job_id = %job.id, "test timeouted");
            self.scheduler.notify_job_failed(&job.id, "timeouted");
        } else if status.success() {
            info!(envo = self.envo, job_id = %job.id, "job done");
            self.scheduler.notify_job_done(&job.id);
        } else {
            let reason = match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "killed by signal".to_string(),
            };
            error!(envo = self.envo, job_id = %job.id, reason = %reason, "job failed");
            self.scheduler.notify_job_failed(&job.id, reason);
        }
        self.scheduler
            .notify_job_result(&job.id, Some(output_path));
        Ok(())
    }

    /// Reset the working directory: drop whatever occupies the path and
    /// recreate it empty.
    fn clean(&self) -> Result<()> {
        if self.path.is_file() {
            fs::remove_file(&self.path)
                .with_context(|| format!("unlink {}", self.path.display()))?;
        }
        if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
                .with_context(|| format!("clear {}", self.path.display()))?;
        }
        fs::create_dir_all(&self.path)
            .with_context(|| format!("create {}", self.path.display()))
    }
}
