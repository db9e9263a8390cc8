//! Bounded worker pool.
//!
//! A fixed set of worker threads per tenant takes ready works from a bounded
//! FIFO queue. Works whose execution threshold lies in the future are held
//! aside and promoted by a scheduler thread once the clock has passed it.
//! Bodies that return [`Execution::Continue`] release their worker slot right
//! away; the continuation is driven on a small tokio runtime owned by the
//! pool and the outcome callback fires from there.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use flowforge_core::{SharedClock, TenantId};
use flowforge_observability::{CounterHandle, GaugeHandle, MetricKey, SharedMetricsRegistry};

use crate::config::WorkConfig;
use crate::descriptor::WorkDescriptor;
use crate::error::WorkError;
use crate::work::{Execution, Work, WorkContext, WorkFactory, WorkFuture};

pub const WORKS_PENDING: &str = "flowforge_works_pending";
pub const WORKS_RUNNING: &str = "flowforge_works_running";
pub const WORKS_EXECUTED: &str = "flowforge_works_executed_total";

/// Receives the outcome of every work the pool ran.
pub trait WorkExecutionCallback: Send + Sync {
    fn on_success(&self, work: WorkDescriptor);

    fn on_failure(
        &self,
        work: WorkDescriptor,
        body: Box<dyn Work>,
        context: WorkContext,
        cause: anyhow::Error,
    );
}

/// How the pool holds its callback.
///
/// A decorator that owns the pool registers itself weakly, so the pair does
/// not keep itself alive.
#[derive(Clone)]
pub enum CallbackRef {
    Strong(Arc<dyn WorkExecutionCallback>),
    Weak(Weak<dyn WorkExecutionCallback>),
}

impl CallbackRef {
    fn get(&self) -> Option<Arc<dyn WorkExecutionCallback>> {
        match self {
            CallbackRef::Strong(c) => Some(Arc::clone(c)),
            CallbackRef::Weak(c) => c.upgrade(),
        }
    }
}

/// Anything works can be submitted to and drained.
pub trait WorkExecutor: Send + Sync {
    fn submit(&self, work: WorkDescriptor) -> Result<(), WorkError>;

    /// Stop accepting works and discard everything not yet started.
    fn shutdown_and_empty_queue(&self);

    /// Wait for in-flight works. `Ok(false)` when the timeout elapsed first.
    fn await_termination(&self, timeout: Duration) -> Result<bool, WorkError>;

    fn stats(&self) -> PoolStats;
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Ready works waiting for a worker
    pub pending: usize,
    /// Works held until their execution threshold
    pub deferred: usize,
    /// Works occupying a worker thread
    pub running: usize,
    /// Asynchronous continuations not yet resolved
    pub continuations: usize,
    /// Works that left a worker thread since start
    pub executed: u64,
    /// Works currently in a retry cycle
    pub retrying: usize,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub thread_count: usize,
    /// Bound on `pending + running`
    pub queue_capacity: usize,
    pub poll_interval: Duration,
}

impl PoolConfig {
    pub fn from_work_config(config: &WorkConfig) -> Self {
        Self {
            thread_count: config.thread_count,
            queue_capacity: config.queue_capacity,
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_work_config(&WorkConfig::default())
    }
}

/// Collaborators every pool needs.
#[derive(Clone)]
pub struct PoolResources {
    pub clock: SharedClock,
    pub factory: Arc<dyn WorkFactory>,
    pub metrics: SharedMetricsRegistry,
}

type Attempt = (
    WorkDescriptor,
    Box<dyn Work>,
    WorkContext,
    anyhow::Result<Execution>,
    Arc<dyn WorkExecutionCallback>,
);

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<WorkDescriptor>,
    deferred: Vec<WorkDescriptor>,
    running: usize,
    continuations: usize,
    workers_alive: usize,
    shutdown: bool,
}

impl QueueState {
    /// No work left on a worker thread or in an unresolved continuation.
    fn is_drained(&self) -> bool {
        self.running == 0 && self.workers_alive == 0 && self.continuations == 0
    }
}

struct PoolMetrics {
    pending: GaugeHandle,
    running: GaugeHandle,
    executed: CounterHandle,
    keys: Vec<MetricKey>,
}

struct PoolShared {
    tenant_id: TenantId,
    name: String,
    config: PoolConfig,
    resources: PoolResources,
    callback: CallbackRef,
    state: Mutex<QueueState>,
    /// Workers wait here for ready works.
    work_available: Condvar,
    /// Signalled on every other state change (slot freed, shutdown, deferral).
    state_changed: Condvar,
    metrics: PoolMetrics,
    continuations: tokio::runtime::Handle,
}

/// Fixed-size, per-tenant worker pool.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl WorkerPool {
    /// Spawn the worker threads, the scheduler thread and the continuation
    /// runtime, and register the pool's metrics.
    pub fn start(
        tenant_id: TenantId,
        config: PoolConfig,
        resources: PoolResources,
        callback: CallbackRef,
    ) -> Result<Self, WorkError> {
        let short_id: String = tenant_id.to_string().chars().take(8).collect();
        let name = format!("works-{short_id}");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{name}-continuations"))
            .enable_time()
            .build()
            .map_err(|e| WorkError::spawn("continuation runtime", e))?;

        let registry = &resources.metrics;
        let keys = vec![
            MetricKey::new(WORKS_PENDING, tenant_id),
            MetricKey::new(WORKS_RUNNING, tenant_id),
            MetricKey::new(WORKS_EXECUTED, tenant_id),
        ];
        let metrics = PoolMetrics {
            pending: registry.gauge(keys[0].clone()),
            running: registry.gauge(keys[1].clone()),
            executed: registry.counter(keys[2].clone()),
            keys,
        };

        let shared = Arc::new(PoolShared {
            tenant_id,
            name: name.clone(),
            state: Mutex::new(QueueState {
                workers_alive: config.thread_count,
                ..QueueState::default()
            }),
            config,
            resources,
            callback,
            work_available: Condvar::new(),
            state_changed: Condvar::new(),
            metrics,
            continuations: runtime.handle().clone(),
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::new()),
            runtime: Mutex::new(Some(runtime)),
        };

        for i in 0..shared.config.thread_count {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker_loop(worker));
            match spawned {
                Ok(handle) => pool.lock_threads().push(handle),
                Err(e) => {
                    // Threads never started must not be waited for.
                    shared.lock_state().workers_alive -= shared.config.thread_count - i;
                    pool.shutdown_and_empty_queue();
                    return Err(WorkError::spawn(format!("{name}-worker-{i}"), e));
                }
            }
        }

        let scheduler = Arc::clone(&shared);
        match thread::Builder::new()
            .name(format!("{name}-scheduler"))
            .spawn(move || scheduler_loop(scheduler))
        {
            Ok(handle) => pool.lock_threads().push(handle),
            Err(e) => {
                pool.shutdown_and_empty_queue();
                return Err(WorkError::spawn(format!("{name}-scheduler"), e));
            }
        }

        info!(
            tenant_id = %tenant_id,
            pool = %name,
            threads = shared.config.thread_count,
            capacity = shared.config.queue_capacity,
            "worker pool started"
        );
        Ok(pool)
    }

    pub fn tenant_id(&self) -> TenantId {
        self.shared.tenant_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Like [`WorkExecutor::submit`], handing the work back on rejection.
    pub fn try_submit(&self, work: WorkDescriptor) -> Result<(), (WorkDescriptor, WorkError)> {
        let shared = &self.shared;
        let mut state = shared.lock_state();

        if state.shutdown {
            return Err((work, WorkError::ShutDown(shared.tenant_id)));
        }

        if !work.is_ready(shared.resources.clock.now()) {
            debug!(
                tenant_id = %shared.tenant_id,
                work_id = %work.id,
                work_type = %work.work_type,
                not_before = ?work.execution_threshold,
                "work deferred"
            );
            state.deferred.push(work);
            shared.state_changed.notify_all();
            return Ok(());
        }

        if state.ready.len() + state.running >= shared.config.queue_capacity {
            return Err((
                work,
                WorkError::QueueFull {
                    tenant_id: shared.tenant_id,
                    capacity: shared.config.queue_capacity,
                },
            ));
        }

        debug!(
            tenant_id = %shared.tenant_id,
            work_id = %work.id,
            work_type = %work.work_type,
            "work submitted"
        );
        state.ready.push_back(work);
        shared.publish(&state);
        shared.work_available.notify_one();
        Ok(())
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<thread::JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl WorkExecutor for WorkerPool {
    fn submit(&self, work: WorkDescriptor) -> Result<(), WorkError> {
        self.try_submit(work).map_err(|(_, e)| e)
    }

    fn shutdown_and_empty_queue(&self) {
        let shared = &self.shared;
        let discarded = {
            let mut state = shared.lock_state();
            state.shutdown = true;
            let discarded = state.ready.len() + state.deferred.len();
            state.ready.clear();
            state.deferred.clear();
            shared.publish(&state);
            discarded
        };
        shared.work_available.notify_all();
        shared.state_changed.notify_all();

        for key in &shared.metrics.keys {
            shared.resources.metrics.remove(key);
        }

        info!(
            tenant_id = %shared.tenant_id,
            pool = %shared.name,
            discarded,
            "worker pool shut down"
        );
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool, WorkError> {
        let shared = &self.shared;
        let state = shared.lock_state();
        let (state, _) = shared
            .state_changed
            .wait_timeout_while(state, timeout, |s| !s.is_drained())
            .unwrap_or_else(|p| p.into_inner());
        let terminated = state.is_drained();
        drop(state);

        if !terminated {
            return Ok(false);
        }

        // Workers are gone; the scheduler notices the shutdown flag within one
        // poll interval.
        let deadline = Instant::now() + shared.config.poll_interval * 2;
        let handles: Vec<_> = self.lock_threads().drain(..).collect();
        let mut clean = true;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() && handle.join().is_err() {
                clean = false;
            }
        }

        if clean {
            Ok(true)
        } else {
            Err(WorkError::Interrupted(shared.tenant_id))
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        PoolStats {
            pending: state.ready.len(),
            deferred: state.deferred.len(),
            running: state.running,
            continuations: state.continuations,
            executed: self.shared.metrics.executed.get(),
            retrying: 0,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let already_down = self.shared.lock_state().shutdown;
        if !already_down {
            self.shutdown_and_empty_queue();
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(runtime) = runtime {
            // The last owner may be a continuation running on this very runtime.
            if tokio::runtime::Handle::try_current().is_ok() {
                let _ = thread::Builder::new()
                    .name(format!("{}-teardown", self.shared.name))
                    .spawn(move || runtime.shutdown_background());
            } else {
                runtime.shutdown_background();
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("tenant_id", &self.shared.tenant_id)
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, state: &QueueState) {
        self.metrics.pending.set(state.ready.len() as i64);
        self.metrics.running.set(state.running as i64);
    }

    /// Move deferred works whose threshold has passed onto the ready queue,
    /// as far as capacity allows.
    fn promote_ready(&self, state: &mut QueueState) {
        if state.deferred.is_empty() {
            return;
        }
        let now = self.resources.clock.now();
        let mut promoted = 0usize;
        let deferred = std::mem::take(&mut state.deferred);
        for work in deferred {
            let has_room = state.ready.len() + state.running < self.config.queue_capacity;
            if has_room && work.is_ready(now) {
                state.ready.push_back(work);
                promoted += 1;
            } else {
                state.deferred.push(work);
            }
        }
        if promoted > 0 {
            debug!(tenant_id = %self.tenant_id, promoted, "deferred works ready");
            self.publish(state);
            self.work_available.notify_all();
        }
    }

    /// Run one work on the calling worker thread.
    ///
    /// The worker slot is released once the body returned and before the
    /// outcome callback fires, so a callback resubmitting the work finds the
    /// slot free.
    fn run(self: &Arc<Self>, work: WorkDescriptor) {
        let attempt = self.attempt(work);
        self.release_slot();

        let Some((work, body, context, outcome, callback)) = attempt else {
            return;
        };
        match outcome {
            Ok(Execution::Completed) => guarded(&work_label(&work), || callback.on_success(work)),
            Ok(Execution::Continue(future)) => self.spawn_continuation(work, body, context, future, callback),
            Err(cause) => {
                let label = work_label(&work);
                guarded(&label, || callback.on_failure(work, body, context, cause))
            }
        }
    }

    fn attempt(&self, work: WorkDescriptor) -> Option<Attempt> {
        let Some(callback) = self.callback.get() else {
            warn!(
                tenant_id = %self.tenant_id,
                work_id = %work.id,
                "no callback registered anymore, dropping work"
            );
            return None;
        };

        let body = match self.resources.factory.create(&work) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    tenant_id = %self.tenant_id,
                    work_id = %work.id,
                    work_type = %work.work_type,
                    error = %e,
                    "unable to create work, dropping it"
                );
                return None;
            }
        };

        let mut context: WorkContext = work
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body.work(&mut context)))
            .unwrap_or_else(|p| Err(anyhow::anyhow!("work panicked: {}", panic_message(&*p))));

        Some((work, body, context, outcome, callback))
    }

    fn release_slot(&self) {
        let mut state = self.lock_state();
        state.running -= 1;
        self.publish(&state);
        self.state_changed.notify_all();
    }

    fn spawn_continuation(
        self: &Arc<Self>,
        work: WorkDescriptor,
        body: Box<dyn Work>,
        context: WorkContext,
        future: WorkFuture,
        callback: Arc<dyn WorkExecutionCallback>,
    ) {
        self.lock_state().continuations += 1;
        let shared = Arc::clone(self);

        self.continuations.spawn(async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|p| Err(anyhow::anyhow!("work panicked: {}", panic_message(&*p))));

            let label = work_label(&work);
            match result {
                Ok(()) => guarded(&label, || callback.on_success(work)),
                Err(cause) => guarded(&label, || callback.on_failure(work, body, context, cause)),
            }

            shared.lock_state().continuations -= 1;
            shared.state_changed.notify_all();
        });
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let work = {
            let mut state = shared.lock_state();
            loop {
                if let Some(work) = state.ready.pop_front() {
                    state.running += 1;
                    shared.publish(&state);
                    break work;
                }
                if state.shutdown {
                    state.workers_alive -= 1;
                    shared.state_changed.notify_all();
                    return;
                }
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(|p| p.into_inner());
            }
        };

        shared.run(work);

        // Counted once the callback returned.
        shared.metrics.executed.increment();
        shared.state_changed.notify_all();
    }
}

fn scheduler_loop(shared: Arc<PoolShared>) {
    let mut state = shared.lock_state();
    while !state.shutdown {
        shared.promote_ready(&mut state);
        state = shared
            .state_changed
            .wait_timeout(state, shared.config.poll_interval)
            .unwrap_or_else(|p| p.into_inner())
            .0;
    }
}

fn work_label(work: &WorkDescriptor) -> String {
    format!("{work} of tenant {}", work.tenant_id)
}

/// Run a callback, keeping a panic in it from taking the thread down.
fn guarded(label: &str, f: impl FnOnce()) {
    if let Err(p) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(work = %label, panic = %panic_message(&*p), "work callback panicked");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
