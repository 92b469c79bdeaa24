//! Two-lane action queue.
//!
//! Each lane is one worker thread draining an unbounded crossbeam channel,
//! so jobs on a lane run strictly one after another in submission order. A job that
//! fails or panics is logged and the lane moves on to the next one.
//!
//! The liveness guard: while a domain job runs, nothing it triggers may wait
//! on the domain lane. Domain submissions carrying a domain `InFlight` origin,
//! or issued from the domain worker thread itself, are refused up front.
//! System-lane submissions are always allowed.

use crate::core::error::WorldlineError;
use crossbeam::channel::{self, Sender};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Domain,
    System,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Domain => "domain",
            Lane::System => "system",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token for the job currently running on a lane. Only the queue mints these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    lane: Lane,
    job_id: String,
}

impl InFlight {
    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

pub type Job = Box<dyn FnOnce(&InFlight) + Send + 'static>;

struct QueuedJob {
    job_id: String,
    run: Job,
}

struct LaneWorker {
    lane: Lane,
    sender: Mutex<Option<Sender<QueuedJob>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    depth: Arc<AtomicUsize>,
}

impl LaneWorker {
    fn spawn(lane: Lane) -> Result<Self, WorldlineError> {
        let (tx, rx) = channel::unbounded::<QueuedJob>();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = Arc::clone(&depth);
        let handle = std::thread::Builder::new()
            .name(format!("worldline-{}-lane", lane))
            .spawn(move || {
                for job in rx.iter() {
                    let token = InFlight {
                        lane,
                        job_id: job.job_id.clone(),
                    };
                    let run = job.run;
                    if catch_unwind(AssertUnwindSafe(|| run(&token))).is_err() {
                        tracing::error!(lane = %lane, job_id = %token.job_id, "queued job panicked");
                    }
                    worker_depth.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::debug!(lane = %lane, "lane worker stopped");
            })?;
        Ok(Self {
            lane,
            thread_id: handle.thread().id(),
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(handle)),
            depth,
        })
    }

    fn send(&self, job: QueuedJob) -> Result<(), WorldlineError> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| WorldlineError::ValidationError("queue lock poisoned".to_string()))?;
        let sender = guard.as_ref().ok_or_else(|| {
            WorldlineError::ValidationError(format!("{} lane is shut down", self.lane))
        })?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        sender.send(job).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            WorldlineError::ValidationError(format!("{} lane worker is gone", self.lane))
        })
    }

    fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handle = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            // The last runtime handle can be dropped by a job on this very lane.
            if std::thread::current().id() == self.thread_id {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!(lane = %self.lane, "lane worker exited by panic");
            }
        }
    }
}

pub struct ActionQueue {
    domain: LaneWorker,
    system: LaneWorker,
}

impl ActionQueue {
    pub fn new() -> Result<Self, WorldlineError> {
        Ok(Self {
            domain: LaneWorker::spawn(Lane::Domain)?,
            system: LaneWorker::spawn(Lane::System)?,
        })
    }

    fn worker(&self, lane: Lane) -> &LaneWorker {
        match lane {
            Lane::Domain => &self.domain,
            Lane::System => &self.system,
        }
    }

    /// Liveness guard for a submission to `lane` made from `origin`.
    pub fn check_submission(&self, lane: Lane, origin: Option<&InFlight>) -> Result<(), WorldlineError> {
        if lane != Lane::Domain {
            return Ok(());
        }
        if let Some(origin) = origin
            && origin.lane == Lane::Domain
        {
            return Err(WorldlineError::ReentrantSubmission {
                lane: lane.to_string(),
                in_flight: origin.job_id.clone(),
            });
        }
        if std::thread::current().id() == self.domain.thread_id {
            return Err(WorldlineError::ReentrantSubmission {
                lane: lane.to_string(),
                in_flight: "domain worker".to_string(),
            });
        }
        Ok(())
    }

    pub fn enqueue(
        &self,
        lane: Lane,
        job_id: &str,
        origin: Option<&InFlight>,
        run: Job,
    ) -> Result<(), WorldlineError> {
        self.check_submission(lane, origin)?;
        self.worker(lane).send(QueuedJob {
            job_id: job_id.to_string(),
            run,
        })?;
        tracing::trace!(lane = %lane, job_id, "job enqueued");
        Ok(())
    }

    /// Jobs queued or running on `lane`.
    pub fn depth(&self, lane: Lane) -> usize {
        self.worker(lane).depth.load(Ordering::SeqCst)
    }

    pub fn is_worker_thread(&self, lane: Lane) -> bool {
        std::thread::current().id() == self.worker(lane).thread_id
    }

    /// Stop accepting jobs, let queued ones finish, and join the workers.
    pub fn shutdown(&self) {
        self.domain.shutdown();
        self.system.shutdown();
    }
}

impl Drop for ActionQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
