//! Single-writer scheduler event loop.
//!
//! The scheduler thread is the only writer to the in-memory job table and to
//! every persistent queue. Everything else (HTTP handlers, wardens) reaches
//! it through the mailbox, a FIFO channel whose events are stamped with the
//! send time. One event is handled at a time; a handler error is logged and
//! the loop keeps going.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info};

use crate::archive::Archive;
use crate::catalog::TestCatalog;
use crate::config::Config;
use crate::job::{self, Job, JobStatus};
use crate::jqueue::JobQueue;
use crate::warden::Warden;

/// A state transition delivered to the scheduler mailbox.
#[derive(Debug)]
pub enum Event {
    /// New job submitted over HTTP.
    Add(Job),
    /// The child process is up.
    Started(String),
    /// The child process terminated (by itself or killed).
    Stopped(String),
    /// The child exited with code zero.
    Success(String),
    /// The job failed; carries a human-readable reason.
    Failed(String, String),
    /// Terminal event: captured output (if any) is ready and the slot is
    /// free for the next job.
    Result(String, Option<PathBuf>),
}

#[derive(Debug)]
struct Envelope {
    time: f64,
    event: Event,
}

/// Cheap-clone interface to the scheduler, used by the HTTP layer and the
/// wardens. Writes go through the mailbox; reads go straight to the
/// persistent queues.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    mailbox: UnboundedSender<Envelope>,
    envos_count: usize,
    queue_path: PathBuf,
}

impl SchedulerHandle {
    /// Number of environment slots.
    pub fn envos_count(&self) -> usize {
        self.envos_count
    }

    /// All live jobs across every slot, ascending by submission time. Reads
    /// the persistent queues, so a concurrent write may surface an
    /// intermediate state.
    pub fn queued(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for envo in 0..self.envos_count {
            let queue = JobQueue::new(self.queue_path.join(envo.to_string()));
            jobs.extend(queue.dump()?);
        }
        job::sort_by_time(&mut jobs);
        Ok(jobs)
    }

    /// Tell the scheduler to enqueue a new job.
    pub fn notify_job_add(&self, job: Job) {
        self.notify(Event::Add(job));
    }

    /// Tell the scheduler the job's child process just started.
    pub fn notify_job_started(&self, job_id: &str) {
        self.notify(Event::Started(job_id.to_string()));
    }

    /// Tell the scheduler the job's child process terminated.
    pub fn notify_job_stopped(&self, job_id: &str) {
        self.notify(Event::Stopped(job_id.to_string()));
    }

    /// Tell the scheduler the job succeeded.
    pub fn notify_job_done(&self, job_id: &str) {
        self.notify(Event::Success(job_id.to_string()));
    }

    /// Tell the scheduler the job failed.
    pub fn notify_job_failed(&self, job_id: &str, reason: impl Into<String>) {
        self.notify(Event::Failed(job_id.to_string(), reason.into()));
    }

    /// Deliver the job's captured output and release its slot.
    pub fn notify_job_result(&self, job_id: &str, output_path: Option<PathBuf>) {
        self.notify(Event::Result(job_id.to_string(), output_path));
    }

    fn notify(&self, event: Event) {
        // the scheduler is a daemon worker; a closed mailbox only happens
        // on process teardown
        let _ = self.mailbox.send(Envelope {
            time: epoch_seconds(),
            event,
        });
    }
}

/// The single-writer coordinator. Owns the authoritative job table, the
/// persistent queues, and the warden pool.
pub struct Scheduler {
    jobs: HashMap<String, Job>,
    queues: Vec<JobQueue>,
    wardens: Vec<Warden>,
    archive: Archive,
}

impl Scheduler {
    /// Start the scheduler thread together with its wardens and return the
    /// handle. Previously persisted jobs are recovered before the first
    /// event is consumed.
    pub fn spawn(config: &Config, catalog: Arc<TestCatalog>, archive: Archive) -> SchedulerHandle {
        let (mailbox, events) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            mailbox,
            envos_count: config.envos_count,
            queue_path: config.queue_path.clone(),
        };
        let warden_handle = handle.clone();
        let envos_count = config.envos_count;
        let envos_path = config.envos_path.clone();
        let queue_path = config.queue_path.clone();
        std::thread::spawn(move || {
            let queues = (0..envos_count)
                .map(|envo| JobQueue::new(queue_path.join(envo.to_string())))
                .collect();
            let wardens = (0..envos_count)
                .map(|envo| {
                    Warden::spawn(
                        envo,
                        envos_path.join(envo.to_string()),
                        Arc::clone(&catalog),
                        warden_handle.clone(),
                    )
                })
                .collect();
            let mut scheduler = Scheduler {
                jobs: HashMap::new(),
                queues,
                wardens,
                archive,
            };
            if let Err(err) = scheduler.recover() {
                error!(error = %format!("{err:#}"), "queue recovery failed");
            }
            scheduler.run(events);
        });
        handle
    }

    /// Reload persisted jobs. Anything caught mid-flight by the previous
    /// shutdown is reset to enqueued and executed again from scratch.
    fn recover(&mut self) -> Result<()> {
        let mut recovered = Vec::new();
        for queue in &self.queues {
            recovered.extend(queue.dump()?);
        }
        job::sort_by_time(&mut recovered);
        for mut job in recovered {
            if job.status != JobStatus::Enqueued {
                job.status = JobStatus::Enqueued;
                self.update_job(&job)?;
            }
            info!(job_id = %job.id, envo = job.envo, "job recovered from queue");
            let job_id = job.id.clone();
            self.jobs.insert(job_id.clone(), job);
            self.dispatch(&job_id)?;
        }
        Ok(())
    }

    fn run(&mut self, mut events: UnboundedReceiver<Envelope>) {
        info!("scheduler started");
        while let Some(envelope) = events.blocking_recv() {
            debug!(event = ?envelope.event, "got new event");
            if let Err(err) = self.handle_event(envelope.time, envelope.event) {
                error!(error = %format!("{err:#}"), "event processing crashed");
            }
        }
        info!("scheduler mailbox closed, stopping");
    }

    fn handle_event(&mut self, time: f64, event: Event) -> Result<()> {
        match event {
            Event::Add(mut job) => {
                job.time = time;
                job.status = JobStatus::Enqueued;
                self.update_job(&job)?;
                info!(job_id = %job.id, envo = job.envo, test = %job.test, "job enqueued");
                let job_id = job.id.clone();
                self.jobs.insert(job_id.clone(), job);
                self.dispatch(&job_id)?;
            }
            Event::Started(job_id) => {
                let job = self.job_mut(&job_id)?;
                job.started = Some(time);
                job.status = JobStatus::Running;
                let updated = job.clone();
                self.update_job(&updated)?;
                info!(job_id = %job_id, "job started");
            }
            Event::Stopped(job_id) => {
                let job = self.job_mut(&job_id)?;
                job.stopped = Some(epoch_seconds());
                let updated = job.clone();
                self.update_job(&updated)?;
                debug!(job_id = %job_id, "job stopped");
            }
            Event::Success(job_id) => {
                let job = self.job_mut(&job_id)?;
                job.status = JobStatus::Done;
                let updated = job.clone();
                self.update_job(&updated)?;
                info!(job_id = %job_id, "job succeeded");
            }
            Event::Failed(job_id, reason) => {
                let job = self.job_mut(&job_id)?;
                job.status = JobStatus::Failed;
                job.reason = Some(reason.clone());
                // no write-through here: the RESULT that follows archives
                // the record regardless
                info!(job_id = %job_id, reason = %reason, "job failed");
            }
            Event::Result(job_id, output_path) => {
                let mut job = self
                    .jobs
                    .get(&job_id)
                    .cloned()
                    .with_context(|| format!("unknown job: {job_id}"))?;
                self.archive.archive(&mut job, output_path.as_deref())?;
                self.queue(job.envo)?.remove(&job_id)?;
                self.jobs.remove(&job_id);
                info!(job_id = %job_id, envo = job.envo, "job archived");
                // the slot is free now; hand it the oldest pending job
                let pending = self
                    .queue(job.envo)?
                    .dump()?
                    .into_iter()
                    .find(|pending| pending.status == JobStatus::Enqueued);
                if let Some(pending) = pending {
                    self.dispatch(&pending.id)?;
                }
            }
        }
        Ok(())
    }

    /// Offer the job to its slot's warden. Accepted jobs move to `starting`
    /// and are persisted; rejected jobs stay `enqueued` and are retried on
    /// the slot's next RESULT.
    fn dispatch(&mut self, job_id: &str) -> Result<bool> {
        let job = self
            .jobs
            .get_mut(job_id)
            .with_context(|| format!("unknown job: {job_id}"))?;
        let envo = job.envo;
        let warden = self
            .wardens
            .get(envo)
            .with_context(|| format!("no warden for envo #{envo}"))?;
        if warden.try_dispatch(job.clone()) {
            job.status = JobStatus::Starting;
            let updated = job.clone();
            self.update_job(&updated)?;
            info!(job_id = %job_id, envo, "job sent for execution");
            Ok(true)
        } else {
            debug!(job_id = %job_id, envo, "slot busy, job still pending");
            Ok(false)
        }
    }

    /// Write a live job through to its persistent queue.
    fn update_job(&self, job: &Job) -> Result<()> {
        self.queue(job.envo)?.save(job)
    }

    fn queue(&self, envo: usize) -> Result<&JobQueue> {
        self.queues
            .get(envo)
            .with_context(|| format!("no queue for envo #{envo}"))
    }

    fn job_mut(&mut self, job_id: &str) -> Result<&mut Job> {
        self.jobs
            .get_mut(job_id)
            .with_context(|| format!("unknown job: {job_id}"))
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
