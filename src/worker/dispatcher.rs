//! Round-robin fair dispatcher.
//!
//! Jobs arrive on a bounded intake channel, land in a per-user FIFO queue,
//! and the user id joins the back of the ready rotation. The dispatch loop
//! serves one job per user per rotation, so a user submitting many jobs
//! cannot starve others, while jobs of a single user keep submission order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::WorkerError;
use super::job::Job;
use super::pool::{JobRunner, WorkerPool};

#[derive(Default)]
struct UserQueue {
    jobs: VecDeque<Job>,
    enqueued: bool,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<i64, UserQueue>,
    /// Rotation of user ids with pending jobs, oldest turn first.
    ready: VecDeque<i64>,
}

pub(crate) struct Dispatcher {
    intake_tx: mpsc::Sender<Job>,
    state: Mutex<QueueState>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        min_workers: usize,
        max_workers: usize,
        queue_size: usize,
        idle_timeout: Duration,
        runner: Arc<dyn JobRunner>,
    ) -> Arc<Self> {
        let pool = WorkerPool::new(min_workers, max_workers, idle_timeout, runner);
        let (intake_tx, intake_rx) = mpsc::channel(queue_size.max(1));

        // Warm up the configured floor of workers.
        for _ in 0..min_workers {
            pool.spawn_worker();
        }

        let dispatcher = Arc::new(Self {
            intake_tx,
            state: Mutex::new(QueueState::default()),
            pool,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(dispatcher.clone().run(intake_rx));
        dispatcher
    }

    /// Submit a job, waiting up to `timeout` for intake space.
    pub async fn enqueue(&self, job: Job, timeout: Duration) -> Result<(), WorkerError> {
        if timeout.is_zero() {
            return self
                .intake_tx
                .try_send(job)
                .map_err(|_| WorkerError::DispatcherBusy);
        }
        match self.intake_tx.send_timeout(job, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(WorkerError::DispatcherBusy),
            Err(SendTimeoutError::Closed(_)) => Err(WorkerError::DispatcherBusy),
        }
    }

    /// Drop a user's queued jobs. In-flight jobs are not interrupted; they
    /// observe the caller's cancellation token instead.
    pub fn cancel_user(&self, user_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.queues.remove(&user_id);
        state.ready.retain(|&id| id != user_id);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown();
    }

    async fn run(self: Arc<Self>, mut intake: mpsc::Receiver<Job>) {
        loop {
            if !self.dispatch_one().await {
                // Nothing queued: block until new work or shutdown.
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    job = intake.recv() => match job {
                        Some(job) => self.enqueue_local(job),
                        None => break,
                    },
                }
                continue;
            }
            // Drain any pending intake without blocking.
            while let Ok(job) = intake.try_recv() {
                self.enqueue_local(job);
            }
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        debug!("dispatcher loop stopped");
    }

    fn enqueue_local(&self, job: Job) {
        let user_id = job.user_id();
        if matches!(job, Job::Stop) {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let queue = state.queues.entry(user_id).or_default();
        queue.jobs.push_back(job);
        if !queue.enqueued {
            queue.enqueued = true;
            state.ready.push_back(user_id);
        }
    }

    /// Serve the head job of the user at the front of the rotation.
    async fn dispatch_one(&self) -> bool {
        let job = {
            let mut state = self.state.lock().unwrap();
            loop {
                let Some(user_id) = state.ready.pop_front() else {
                    return false;
                };
                // The queue may be gone if the user was cancelled.
                let Some(queue) = state.queues.get_mut(&user_id) else {
                    continue;
                };
                let Some(job) = queue.jobs.pop_front() else {
                    state.queues.remove(&user_id);
                    continue;
                };
                if queue.jobs.is_empty() {
                    state.queues.remove(&user_id);
                } else {
                    state.ready.push_back(user_id);
                }
                debug!(user_id, kind = job.kind(), "dispatching job");
                break job;
            }
        };

        let mut job = job;
        loop {
            // A None here means shutdown; the popped job is dropped and its
            // caller observes the closed reply channel.
            let Some(worker) = self.pool.acquire().await else {
                return false;
            };
            match worker.send(job).await {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    warn!("worker channel closed during hand-off, reacquiring");
                    job = returned;
                }
            }
        }
    }
}
