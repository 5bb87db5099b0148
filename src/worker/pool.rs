//! Elastic worker pool.
//!
//! Keeps between `min_base` and `max` workers alive, expanding on demand
//! and contracting after an idle period. A dynamic floor (`min_dynamic`)
//! is boosted to the live worker count whenever the pool grows, then held
//! for a retention window so a short dip after a spike does not trigger a
//! retire-and-respawn storm.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::job::Job;

const DEFAULT_MIN_RETENTION: Duration = Duration::from_secs(60);

/// Workers retire only while live workers stay this far above the floor.
const MIN_DECAY_SLACK: usize = 1;

/// Executes one job; implemented by the task executor.
#[async_trait]
pub(crate) trait JobRunner: Send + Sync {
    async fn run(&self, job: Job);
}

struct WorkerMeta {
    sender: mpsc::Sender<Job>,
    last_used: Instant,
    enqueued: bool,
    discarded: bool,
}

struct PoolInner {
    idle: VecDeque<u64>,
    meta: HashMap<u64, WorkerMeta>,
    running: usize,
    min_dynamic: usize,
    boost_until: Option<Instant>,
    next_worker_id: u64,
}

impl PoolInner {
    /// Workers currently executing a job.
    fn busy(&self) -> usize {
        let idle_live = self
            .idle
            .iter()
            .filter(|id| self.meta.get(id).is_some_and(|m| !m.discarded))
            .count();
        self.running.saturating_sub(idle_live)
    }
}

pub(crate) struct WorkerPool {
    inner: Mutex<PoolInner>,
    /// Wakes `acquire` when a worker becomes idle or retires.
    notify: Notify,
    runner: Arc<dyn JobRunner>,
    /// Self-handle for spawning worker tasks.
    handle: Weak<WorkerPool>,
    min_base: usize,
    max: usize,
    idle_timeout: Duration,
    retention: Duration,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        min_workers: usize,
        max_workers: usize,
        idle_timeout: Duration,
        runner: Arc<dyn JobRunner>,
    ) -> Arc<Self> {
        let retention = idle_timeout.max(DEFAULT_MIN_RETENTION);
        Self::with_retention(min_workers, max_workers, idle_timeout, retention, runner)
    }

    pub fn with_retention(
        min_workers: usize,
        max_workers: usize,
        idle_timeout: Duration,
        retention: Duration,
        runner: Arc<dyn JobRunner>,
    ) -> Arc<Self> {
        let max = max_workers.max(min_workers);
        let pool = Arc::new_cyclic(|handle| Self {
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                meta: HashMap::new(),
                running: 0,
                min_dynamic: min_workers,
                boost_until: None,
                next_worker_id: 0,
            }),
            notify: Notify::new(),
            runner,
            handle: handle.clone(),
            min_base: min_workers,
            max,
            idle_timeout,
            retention,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(pool.clone().sweep_stale_workers());
        pool
    }

    /// Spawn one worker if the pool is below `max`.
    pub fn spawn_worker(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.running < self.max {
            self.spawn_worker_locked(&mut inner);
        }
    }

    /// Get an idle worker's job channel, spawning a new worker if allowed,
    /// otherwise waiting until one frees up. Returns `None` once the pool
    /// is shutting down.
    pub async fn acquire(&self) -> Option<mpsc::Sender<Job>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(sender) = Self::pop_idle_locked(&mut inner) {
                    return Some(sender);
                }
                if !self.shutdown.is_cancelled() && inner.running < self.max {
                    self.spawn_worker_locked(&mut inner);
                    // The new worker marks itself idle and signals.
                    continue;
                }
                debug!(running = inner.running, "waiting for idle worker");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Return a worker to the idle queue (FIFO by ready time).
    fn mark_idle(&self, worker_id: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(meta) = inner.meta.get_mut(&worker_id) else {
                return;
            };
            if meta.discarded || meta.enqueued {
                return;
            }
            meta.enqueued = true;
            meta.last_used = Instant::now();
            inner.idle.push_back(worker_id);
        }
        self.notify.notify_one();
    }

    /// Remove a worker permanently.
    fn retire(&self, worker_id: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.meta.remove(&worker_id).is_some() && inner.running > 0 {
                inner.running -= 1;
            }
        }
        // notify_one stores a permit, so the single acquirer (the dispatch
        // loop) cannot miss a wakeup that lands before it parks.
        self.notify.notify_one();
    }

    fn pop_idle_locked(inner: &mut PoolInner) -> Option<mpsc::Sender<Job>> {
        while let Some(worker_id) = inner.idle.pop_front() {
            if let Some(meta) = inner.meta.get_mut(&worker_id) {
                if meta.discarded {
                    continue;
                }
                meta.enqueued = false;
                return Some(meta.sender.clone());
            }
        }
        None
    }

    fn spawn_worker_locked(&self, inner: &mut PoolInner) {
        let Some(pool) = self.handle.upgrade() else {
            return;
        };
        inner.next_worker_id += 1;
        let worker_id = inner.next_worker_id;
        let (tx, rx) = mpsc::channel(1);
        inner.meta.insert(
            worker_id,
            WorkerMeta {
                sender: tx,
                last_used: Instant::now(),
                enqueued: false,
                discarded: false,
            },
        );
        inner.running += 1;
        self.try_boost_locked(inner);
        debug!(worker_id, running = inner.running, "worker spawned");

        tokio::spawn(pool.worker_loop(worker_id, rx));
    }

    /// Single-threaded worker loop: mark idle, take one job, run it.
    async fn worker_loop(self: Arc<Self>, worker_id: u64, mut jobs: mpsc::Receiver<Job>) {
        loop {
            self.mark_idle(worker_id);
            let Some(job) = jobs.recv().await else {
                self.retire(worker_id);
                return;
            };
            match job {
                Job::Stop => {
                    debug!(worker_id, "worker stopping");
                    self.retire(worker_id);
                    return;
                }
                job => {
                    debug!(worker_id, kind = job.kind(), "worker took job");
                    let runner = self.runner.clone();
                    if AssertUnwindSafe(runner.run(job)).catch_unwind().await.is_err() {
                        warn!(worker_id, "job handler panicked, retiring worker");
                        self.retire(worker_id);
                        return;
                    }
                }
            }
        }
    }

    /// Raise the dynamic floor to the live worker count and restart the
    /// retention clock. Called whenever the pool grows.
    fn try_boost_locked(&self, inner: &mut PoolInner) {
        if inner.running > inner.min_dynamic {
            inner.min_dynamic = inner.running;
            inner.boost_until = Some(Instant::now() + self.retention);
        }
    }

    /// Lower the dynamic floor toward `max(busy, min_base)` once the
    /// retention deadline has passed. Under sustained load the clock is
    /// reset instead.
    fn decay_boundary(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let Some(deadline) = inner.boost_until else {
            return;
        };
        if now < deadline {
            return;
        }

        let busy = inner.busy();
        if busy + MIN_DECAY_SLACK >= inner.min_dynamic {
            inner.boost_until = Some(now + self.retention);
            return;
        }

        let target = busy.max(self.min_base);
        if inner.min_dynamic > target {
            inner.min_dynamic = target;
        }
        inner.boost_until = if target == self.min_base {
            None
        } else {
            Some(now + self.retention)
        };
    }

    /// Retire idle workers whose last-use age reached the idle timeout,
    /// never shrinking below the current dynamic floor.
    fn shutdown_expired(&self, now: Instant) {
        let stale: Vec<mpsc::Sender<Job>> = {
            let mut inner = self.inner.lock().unwrap();
            let boundary = inner.min_dynamic;
            if inner.idle.is_empty() || inner.running <= boundary {
                return;
            }

            let mut stale = Vec::new();
            let mut remaining = VecDeque::with_capacity(inner.idle.len());
            let candidates: Vec<u64> = inner.idle.drain(..).collect();
            let running = inner.running;
            for worker_id in candidates {
                let Some(meta) = inner.meta.get_mut(&worker_id) else {
                    continue;
                };
                if meta.discarded {
                    continue;
                }
                if now.duration_since(meta.last_used) >= self.idle_timeout
                    && running - stale.len() > boundary
                {
                    meta.discarded = true;
                    meta.enqueued = false;
                    stale.push(meta.sender.clone());
                    continue;
                }
                remaining.push_back(worker_id);
            }
            inner.idle = remaining;
            stale
        };

        for sender in stale {
            // The worker is idle, so its single-slot channel is empty.
            let _ = sender.try_send(Job::Stop);
        }
    }

    async fn sweep_stale_workers(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.idle_timeout, self.idle_timeout);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                tick = ticker.tick() => {
                    // Boundary changes first, then expiry.
                    self.decay_boundary(tick);
                    self.shutdown_expired(tick);
                }
            }
        }
    }

    /// Stop the sweeper and retire every worker.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let senders: Vec<mpsc::Sender<Job>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.idle.clear();
            inner
                .meta
                .values_mut()
                .map(|meta| {
                    meta.discarded = true;
                    meta.sender.clone()
                })
                .collect()
        };
        for sender in senders {
            let _ = sender.try_send(Job::Stop);
        }
    }

    #[cfg(test)]
    pub fn running(&self) -> usize {
        self.inner.lock().unwrap().running
    }

    #[cfg(test)]
    pub fn min_dynamic(&self) -> usize {
        self.inner.lock().unwrap().min_dynamic
    }
}
