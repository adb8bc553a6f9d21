//! Trust cordons: pre-spawned isolation-slot pools per trust level.
//!
//! A cordon confines every execution at a given trust level to workers
//! from its own pool. Pools hold `(min, max)` workers: acquire reuses an
//! idle worker, spawns a new one up to `max`, or waits FIFO for a release.
//! Workers are recycled after too many executions or too much age, idle
//! workers beyond `min` are reaped, and a worker that served a failed
//! execution sits out a short cool-down before being reused.
//!
//! A worker is an isolation slot behind [`WorkerFactory`]: an OS process,
//! a thread plus namespace set, a microVM, or the portable in-process slot
//! shipped here. The acquire/release/recycle contract is identical across
//! realizations.
//!
//! Worker lifecycle: `Spawning → Idle → Busy → Idle → … → Recycling →
//! Exited`, with `Busy → Error → Idle` (after cool-down) on execution
//! failure.

use polyrun_core::{CordonMetrics, CordonPoolMetrics, CordonSizing, Error, Result, TrustLevel};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Recycle and reaping thresholds for cordon workers.
#[derive(Debug, Clone, Copy)]
pub struct RecyclePolicy {
    /// Recycle after this many executions
    pub max_executions: u64,
    /// Recycle after this age
    pub max_age: Duration,
    /// Reap idle workers beyond `min` after this idle period
    pub idle_timeout: Duration,
    /// Cool-down after a failed execution
    pub error_cooldown: Duration,
}

impl Default for RecyclePolicy {
    fn default() -> Self {
        Self {
            max_executions: 1000,
            max_age: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(5 * 60),
            error_cooldown: Duration::from_secs(5),
        }
    }
}

/// Handle onto one isolation slot.
pub trait WorkerHandle: Send + Sync + fmt::Debug {
    /// Slot identifier (process id for process-backed workers).
    fn id(&self) -> u64;

    /// Whether the slot is still usable.
    fn is_alive(&self) -> bool;

    /// Tears the slot down. Idempotent.
    fn terminate(&self);
}

/// Spawns isolation slots for a trust level.
pub trait WorkerFactory: Send + Sync + fmt::Debug {
    /// Creates one slot restricted to the given trust level.
    fn spawn(&self, trust_level: TrustLevel) -> Result<Box<dyn WorkerHandle>>;
}

/// Portable in-process isolation slot.
#[derive(Debug)]
struct InProcessSlot {
    id: u64,
    alive: AtomicBool,
}

impl WorkerHandle for InProcessSlot {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn terminate(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

/// Factory producing portable in-process slots.
///
/// Platform integrations substitute process- or microVM-backed factories;
/// the pool logic is identical.
#[derive(Debug, Default)]
pub struct InProcessSlotFactory {
    next_id: AtomicU64,
}

impl WorkerFactory for InProcessSlotFactory {
    fn spawn(&self, trust_level: TrustLevel) -> Result<Box<dyn WorkerHandle>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(worker_id = id, trust_level = %trust_level, "worker spawned");
        Ok(Box::new(InProcessSlot {
            id,
            alive: AtomicBool::new(true),
        }))
    }
}

/// One pooled worker with its usage accounting.
#[derive(Debug)]
struct Worker {
    handle: Box<dyn WorkerHandle>,
    spawned_at: Instant,
    executions: u64,
    idle_since: Instant,
    cooldown_until: Option<Instant>,
}

impl Worker {
    fn new(handle: Box<dyn WorkerHandle>) -> Self {
        let now = Instant::now();
        Self {
            handle,
            spawned_at: now,
            executions: 0,
            idle_since: now,
            cooldown_until: None,
        }
    }

    fn cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<Worker>,
    busy_count: usize,
    waiters: VecDeque<oneshot::Sender<Worker>>,
}

/// One trust level's pool.
#[derive(Debug)]
struct Pool {
    trust_level: TrustLevel,
    sizing: CordonSizing,
    policy: RecyclePolicy,
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<PoolState>,
    total_executions: AtomicU64,
}

impl Pool {
    fn alive_count(state: &PoolState) -> usize {
        state.idle.len() + state.busy_count
    }

    /// Reuse idle → spawn to max → FIFO wait.
    async fn acquire(pool: Arc<Self>) -> Result<WorkerLease> {
        let rx = {
            let mut state = pool.state.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();

            // Dead idle workers drop out silently; maintenance replenishes.
            state.idle.retain(|worker| worker.handle.is_alive());

            if let Some(pos) = state.idle.iter().position(|worker| !worker.cooling(now)) {
                let worker = state
                    .idle
                    .remove(pos)
                    .ok_or_else(|| Error::execution("idle worker vanished"))?;
                state.busy_count += 1;
                drop(state);
                return Ok(WorkerLease::new(pool, worker));
            }

            if Self::alive_count(&state) < pool.sizing.max {
                let handle = pool.factory.spawn(pool.trust_level)?;
                state.busy_count += 1;
                drop(state);
                return Ok(WorkerLease::new(pool, Worker::new(handle)));
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        tracing::debug!(trust_level = %pool.trust_level, "cordon full, waiting for a release");
        let worker = rx.await.map_err(|_| Error::Shutdown)?;
        Ok(WorkerLease::new(pool, worker))
    }

    /// Returns a worker to the pool; called from lease drop.
    fn release(&self, mut worker: Worker, failed: bool) {
        let now = Instant::now();
        worker.executions += 1;
        worker.idle_since = now;
        if failed {
            worker.cooldown_until = Some(now + self.policy.error_cooldown);
        }
        self.total_executions.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.busy_count = state.busy_count.saturating_sub(1);

        let recycle = worker.executions > self.policy.max_executions
            || worker.spawned_at.elapsed() > self.policy.max_age
            || !worker.handle.is_alive();
        if recycle {
            tracing::debug!(
                worker_id = worker.handle.id(),
                executions = worker.executions,
                "recycling worker"
            );
            worker.handle.terminate();
            // A waiter can take a fresh spawn in its place.
            if let Some(tx) = state.waiters.pop_front() {
                match self.factory.spawn(self.trust_level) {
                    Ok(handle) => {
                        state.busy_count += 1;
                        let _ = tx.send(Worker::new(handle));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "replacement spawn failed");
                    }
                }
            }
            return;
        }

        if !worker.cooling(now) {
            while let Some(tx) = state.waiters.pop_front() {
                match tx.send(worker) {
                    Ok(()) => {
                        state.busy_count += 1;
                        return;
                    }
                    // Receiver gave up; try the next waiter.
                    Err(returned) => worker = returned,
                }
            }
        }

        state.idle.push_back(worker);
    }

    /// Reaps surplus idle workers and replenishes to `min`.
    fn maintain(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let min = self.sizing.min;
        let policy = self.policy;

        let mut alive = Self::alive_count(&state);
        let mut kept = VecDeque::with_capacity(state.idle.len());
        while let Some(worker) = state.idle.pop_front() {
            let expired = worker.spawned_at.elapsed() > policy.max_age
                || !worker.handle.is_alive();
            let surplus_idle = alive > min
                && now.duration_since(worker.idle_since) > policy.idle_timeout;
            if expired || surplus_idle {
                worker.handle.terminate();
                alive -= 1;
            } else {
                kept.push_back(worker);
            }
        }
        state.idle = kept;

        while Self::alive_count(&state) < min {
            match self.factory.spawn(self.trust_level) {
                Ok(handle) => state.idle.push_back(Worker::new(handle)),
                Err(err) => {
                    tracing::warn!(trust_level = %self.trust_level, error = %err, "replenish failed");
                    break;
                }
            }
        }
    }

    fn metrics(&self) -> CordonPoolMetrics {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        CordonPoolMetrics {
            total: Self::alive_count(&state),
            active: state.busy_count,
            idle: state.idle.len(),
            total_executions: self.total_executions.load(Ordering::Relaxed),
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for worker in state.idle.drain(..) {
            worker.handle.terminate();
        }
        // Dropping the senders wakes waiters with a shutdown error.
        state.waiters.clear();
    }
}

/// Exclusive reservation of one worker for one execution.
///
/// Releasing happens in `Drop`, so a reservation can never leak across an
/// early return or panic. Mark the lease failed before dropping to put the
/// worker into its error cool-down.
#[derive(Debug)]
pub struct WorkerLease {
    pool: Arc<Pool>,
    worker: Option<Worker>,
    failed: bool,
}

impl WorkerLease {
    fn new(pool: Arc<Pool>, worker: Worker) -> Self {
        Self {
            pool,
            worker: Some(worker),
            failed: false,
        }
    }

    /// Slot identifier of the reserved worker.
    #[must_use]
    pub fn worker_id(&self) -> u64 {
        self.worker.as_ref().map_or(0, |w| w.handle.id())
    }

    /// Trust level of the owning cordon.
    #[must_use]
    pub fn trust_level(&self) -> TrustLevel {
        self.pool.trust_level
    }

    /// Puts the worker into its error cool-down on release.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker, self.failed);
        }
    }
}

/// Pools of pre-spawned workers partitioned by trust level.
pub struct TrustCordon {
    pools: BTreeMap<TrustLevel, Arc<Pool>>,
    closed: AtomicBool,
    maintenance: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for TrustCordon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustCordon")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TrustCordon {
    /// Creates cordons with default `(min, max)` sizing and pre-spawns
    /// each pool to its minimum.
    pub fn new(factory: Arc<dyn WorkerFactory>, policy: RecyclePolicy) -> Result<Self> {
        let sizing = TrustLevel::ALL
            .into_iter()
            .map(|level| (level, CordonSizing::default_for(level)))
            .collect();
        Self::with_sizing(factory, policy, sizing)
    }

    /// Creates cordons with explicit sizing, pre-spawning to each `min`.
    pub fn with_sizing(
        factory: Arc<dyn WorkerFactory>,
        policy: RecyclePolicy,
        sizing: BTreeMap<TrustLevel, CordonSizing>,
    ) -> Result<Self> {
        let mut pools = BTreeMap::new();
        for (trust_level, sizing) in sizing {
            let pool = Arc::new(Pool {
                trust_level,
                sizing,
                policy,
                factory: Arc::clone(&factory),
                state: Mutex::new(PoolState::default()),
                total_executions: AtomicU64::new(0),
            });
            {
                let mut state = pool.state.lock().unwrap_or_else(|e| e.into_inner());
                for _ in 0..sizing.min {
                    state.idle.push_back(Worker::new(factory.spawn(trust_level)?));
                }
            }
            pools.insert(trust_level, pool);
        }
        Ok(Self {
            pools,
            closed: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        })
    }

    /// Reserves a worker from the trust level's cordon, waiting FIFO when
    /// the pool is at capacity.
    pub async fn acquire(&self, trust_level: TrustLevel) -> Result<WorkerLease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let pool = self
            .pools
            .get(&trust_level)
            .ok_or_else(|| Error::invalid_input(format!("no cordon for '{trust_level}'")))?;
        Pool::acquire(Arc::clone(pool)).await
    }

    /// Runs one maintenance pass over every pool.
    pub fn maintain(&self) {
        for pool in self.pools.values() {
            pool.maintain();
        }
    }

    /// Spawns a periodic maintenance task.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        let cordon = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if cordon.closed.load(Ordering::SeqCst) {
                    break;
                }
                cordon.maintain();
            }
        });
        let mut maintenance = self.maintenance.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = maintenance.replace(handle) {
            previous.abort();
        }
    }

    /// Terminates idle workers and refuses further acquisitions.
    /// Idempotent; leases still out release into closed pools harmlessly.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        for pool in self.pools.values() {
            pool.shutdown();
        }
        tracing::info!("trust cordons shut down");
    }

    /// Per-trust-level pool counters.
    #[must_use]
    pub fn metrics(&self) -> CordonMetrics {
        CordonMetrics {
            per_trust_level: self
                .pools
                .iter()
                .map(|(level, pool)| (*level, pool.metrics()))
                .collect(),
        }
    }
}
