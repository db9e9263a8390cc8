//! Retry decorator around a worker pool.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use flowforge_core::{SharedClock, TenantId, instant_after};
use flowforge_observability::{GaugeHandle, MetricKey, SharedMetricsRegistry};

use crate::classifier::{Retryability, RetryabilityClassifier};
use crate::config::WorkConfig;
use crate::descriptor::WorkDescriptor;
use crate::error::WorkError;
use crate::failure::{LockError, LockTimeoutError, PreconditionNotMetError, find_in_chain};
use crate::pool::{
    CallbackRef, PoolConfig, PoolResources, PoolStats, WorkExecutionCallback, WorkExecutor,
    WorkerPool,
};
use crate::work::{Work, WorkContext};

pub const WORKS_RETRYING: &str = "flowforge_works_retrying";

/// Exponential backoff without jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry ceiling
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied per further retry
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            factor,
        }
    }

    pub fn from_config(config: &WorkConfig) -> Self {
        Self::new(config.max_retries, config.base_delay(), config.backoff_factor)
    }

    /// Delay before retry number `retry_count` (1-indexed):
    /// `base_delay * factor^(retry_count - 1)`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let exp = self.factor.powi((retry_count - 1) as i32);
        // Float to int casts saturate, so huge delays clamp instead of wrapping.
        Duration::from_millis((base_ms * exp).max(0.0) as u64)
    }

    /// Whether another retry is allowed.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Count one more retry and push the threshold out accordingly.
    pub fn schedule_retry(&self, work: &mut WorkDescriptor, now: DateTime<Utc>) {
        work.retry_count += 1;
        work.execution_threshold = Some(instant_after(now, self.delay_for_retry(work.retry_count)));
    }
}

/// Worker pool whose failures go through retry decisions.
///
/// The decorator is the pool's callback. It holds the pool, and the pool
/// holds it back weakly.
pub struct RetryingWorkExecutor {
    tenant_id: TenantId,
    pool: OnceLock<WorkerPool>,
    classifier: Arc<RetryabilityClassifier>,
    clock: SharedClock,
    policy: RetryPolicy,
    retrying: GaugeHandle,
    retrying_key: MetricKey,
    metrics: SharedMetricsRegistry,
    delegate: Option<Arc<dyn WorkExecutionCallback>>,
}

impl RetryingWorkExecutor {
    /// Start a pool with the decorator registered as its callback.
    ///
    /// Successes are forwarded to `delegate`, once the retry state is reset.
    pub fn start(
        tenant_id: TenantId,
        pool_config: PoolConfig,
        resources: PoolResources,
        classifier: Arc<RetryabilityClassifier>,
        policy: RetryPolicy,
        delegate: Option<Arc<dyn WorkExecutionCallback>>,
    ) -> Result<Arc<Self>, WorkError> {
        let retrying_key = MetricKey::new(WORKS_RETRYING, tenant_id);
        let metrics = Arc::clone(&resources.metrics);
        let executor = Arc::new(Self {
            tenant_id,
            pool: OnceLock::new(),
            classifier,
            clock: Arc::clone(&resources.clock),
            policy,
            retrying: metrics.gauge(retrying_key.clone()),
            retrying_key,
            metrics,
            delegate,
        });

        let weak = Arc::downgrade(&executor);
        let callback: Weak<dyn WorkExecutionCallback> = weak;
        let pool = match WorkerPool::start(tenant_id, pool_config, resources, CallbackRef::Weak(callback)) {
            Ok(pool) => pool,
            Err(e) => {
                executor.metrics.remove(&executor.retrying_key);
                return Err(e);
            }
        };
        let _ = executor.pool.set(pool);
        Ok(executor)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn pool(&self) -> Result<&WorkerPool, WorkError> {
        self.pool.get().ok_or(WorkError::ShutDown(self.tenant_id))
    }

    fn retry(
        &self,
        mut work: WorkDescriptor,
        body: Box<dyn Work>,
        context: WorkContext,
        cause: anyhow::Error,
        verdict: Retryability,
    ) {
        if !self.policy.should_retry(work.retry_count) {
            warn!(
                tenant_id = %self.tenant_id,
                work_id = %work.id,
                work_type = %work.work_type,
                retries = work.retry_count,
                error = %format!("{cause:#}"),
                "retries exhausted"
            );
            self.give_up(work, body, context, cause);
            return;
        }

        if work.retry_count == 0 {
            self.retrying.increment();
        }
        self.policy.schedule_retry(&mut work, self.clock.now());
        debug!(
            tenant_id = %self.tenant_id,
            work_id = %work.id,
            work_type = %work.work_type,
            retry_count = work.retry_count,
            not_before = ?work.execution_threshold,
            verdict = ?verdict,
            error = %format!("{cause:#}"),
            "retry scheduled"
        );
        self.resubmit(work, body, context, cause);
    }

    /// Hand the work back to the pool; a full queue ends in the failure hook.
    fn resubmit(&self, work: WorkDescriptor, body: Box<dyn Work>, context: WorkContext, cause: anyhow::Error) {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(e) => {
                debug!(tenant_id = %self.tenant_id, work_id = %work.id, error = %e, "dropping work");
                return;
            }
        };
        match pool.try_submit(work) {
            Ok(()) => {}
            Err((work, e @ WorkError::QueueFull { .. })) => {
                error!(
                    tenant_id = %self.tenant_id,
                    work_id = %work.id,
                    work_type = %work.work_type,
                    error = %e,
                    "cannot resubmit work"
                );
                self.give_up(work, body, context, cause);
            }
            Err((mut work, e)) => {
                debug!(
                    tenant_id = %self.tenant_id,
                    work_id = %work.id,
                    error = %e,
                    "pool is shutting down, dropping work"
                );
                self.leave_retry_cycle(&mut work);
            }
        }
    }

    /// Put a contended work back as-is. Lock contention never reaches the
    /// failure hook: with the queue full, the work waits one poll interval
    /// among the deferred works instead.
    fn requeue(&self, work: WorkDescriptor) {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(e) => {
                debug!(tenant_id = %self.tenant_id, work_id = %work.id, error = %e, "dropping work");
                return;
            }
        };
        let rejected = match pool.try_submit(work) {
            Ok(()) => return,
            Err((mut work, WorkError::QueueFull { .. })) => {
                work.execution_threshold =
                    Some(instant_after(self.clock.now(), pool.config().poll_interval));
                debug!(
                    tenant_id = %self.tenant_id,
                    work_id = %work.id,
                    not_before = ?work.execution_threshold,
                    "queue full, deferring contended work"
                );
                match pool.try_submit(work) {
                    Ok(()) => return,
                    Err(rejected) => rejected,
                }
            }
            Err(rejected) => rejected,
        };
        let (work, e) = rejected;
        debug!(
            tenant_id = %self.tenant_id,
            work_id = %work.id,
            error = %e,
            "pool is shutting down, dropping work"
        );
    }

    /// Run the terminal failure hook.
    fn give_up(&self, mut work: WorkDescriptor, body: Box<dyn Work>, context: WorkContext, cause: anyhow::Error) {
        self.leave_retry_cycle(&mut work);
        warn!(
            tenant_id = %self.tenant_id,
            work_id = %work.id,
            work = %body.description(),
            error = %format!("{cause:#}"),
            "work failed"
        );
        if let Err(e) = body.handle_failure(&cause, &context) {
            error!(
                tenant_id = %self.tenant_id,
                work_id = %work.id,
                error = %format!("{e:#}"),
                cause = %format!("{cause:#}"),
                "failure handler failed"
            );
        }
    }

    fn leave_retry_cycle(&self, work: &mut WorkDescriptor) {
        if work.retry_count > 0 {
            self.retrying.decrement();
            work.retry_count = 0;
        }
    }
}

impl WorkExecutionCallback for RetryingWorkExecutor {
    fn on_success(&self, mut work: WorkDescriptor) {
        self.leave_retry_cycle(&mut work);
        if let Some(delegate) = &self.delegate {
            delegate.on_success(work);
        }
    }

    fn on_failure(
        &self,
        mut work: WorkDescriptor,
        body: Box<dyn Work>,
        context: WorkContext,
        cause: anyhow::Error,
    ) {
        if find_in_chain::<LockTimeoutError>(&cause).is_some() {
            debug!(
                tenant_id = %self.tenant_id,
                work_id = %work.id,
                error = %format!("{cause:#}"),
                "lock timeout, requeueing work"
            );
            self.requeue(work);
            return;
        }

        if find_in_chain::<LockError>(&cause).is_some() {
            warn!(
                tenant_id = %self.tenant_id,
                work_id = %work.id,
                error = %format!("{cause:#}"),
                "lock failure, requeueing work"
            );
            self.requeue(work);
            return;
        }

        let verdict = self.classifier.classify(&cause);

        if find_in_chain::<PreconditionNotMetError>(&cause).is_some() && !verdict.should_retry() {
            debug!(
                tenant_id = %self.tenant_id,
                work_id = %work.id,
                work_type = %work.work_type,
                error = %format!("{cause:#}"),
                "precondition not met, abandoning work"
            );
            self.leave_retry_cycle(&mut work);
            return;
        }

        if verdict.should_retry() {
            self.retry(work, body, context, cause, verdict);
        } else {
            self.give_up(work, body, context, cause);
        }
    }
}

impl WorkExecutor for RetryingWorkExecutor {
    fn submit(&self, work: WorkDescriptor) -> Result<(), WorkError> {
        self.pool()?.submit(work)
    }

    fn shutdown_and_empty_queue(&self) {
        if let Some(pool) = self.pool.get() {
            pool.shutdown_and_empty_queue();
        }
        self.metrics.remove(&self.retrying_key);
    }

    fn await_termination(&self, timeout: Duration) -> Result<bool, WorkError> {
        match self.pool.get() {
            Some(pool) => pool.await_termination(timeout),
            None => Ok(true),
        }
    }

    fn stats(&self) -> PoolStats {
        let mut stats = self.pool.get().map(|pool| pool.stats()).unwrap_or_default();
        stats.retrying = self.retrying.get().max(0) as usize;
        stats
    }
}

impl std::fmt::Debug for RetryingWorkExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingWorkExecutor")
            .field("tenant_id", &self.tenant_id)
            .field("policy", &self.policy)
            .field("classifier", &self.classifier)
            .field("pool", &self.pool.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    use flowforge_core::{Clock, ManualClock, SystemClock};
    use flowforge_observability::InMemoryMetricsRegistry;
    use proptest::prelude::*;

    use crate::classifier::ErrorTypeRegistry;
    use crate::test_support::{RecordingCallback, ScriptedFactory, TransientError, wait_until};
    use crate::work::WorkFactory;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        clock: Arc<ManualClock>,
        factory: Arc<ScriptedFactory>,
        metrics: Arc<InMemoryMetricsRegistry>,
        delegate: Arc<RecordingCallback>,
        executor: Arc<RetryingWorkExecutor>,
    }

    impl Harness {
        fn start(retryable: &[&str], policy: RetryPolicy) -> Self {
            Self::start_with(retryable, policy, 100)
        }

        fn start_with(retryable: &[&str], policy: RetryPolicy, capacity: usize) -> Self {
            Self::start_sized(retryable, policy, 2, capacity)
        }

        fn start_sized(
            retryable: &[&str],
            policy: RetryPolicy,
            threads: usize,
            capacity: usize,
        ) -> Self {
            let mut registry = ErrorTypeRegistry::with_builtins();
            registry.register::<TransientError>("TransientError", None);
            let classifier =
                RetryabilityClassifier::new(Arc::new(registry), retryable, Vec::<String>::new())
                    .unwrap();

            let clock = Arc::new(ManualClock::starting_now());
            let factory = ScriptedFactory::arc();
            let metrics = InMemoryMetricsRegistry::arc();
            let delegate = RecordingCallback::arc();
            let executor = RetryingWorkExecutor::start(
                TenantId::new(),
                PoolConfig {
                    thread_count: threads,
                    queue_capacity: capacity,
                    poll_interval: Duration::from_millis(5),
                },
                PoolResources {
                    clock: clock.clone(),
                    factory: factory.clone(),
                    metrics: metrics.clone(),
                },
                Arc::new(classifier),
                policy,
                Some(delegate.clone()),
            )
            .unwrap();

            Self {
                clock,
                factory,
                metrics,
                delegate,
                executor,
            }
        }

        fn work(&self, work_type: &str) -> WorkDescriptor {
            WorkDescriptor::new(self.executor.tenant_id, work_type)
        }

        fn retrying(&self) -> Option<i64> {
            self.metrics
                .value(&MetricKey::new(WORKS_RETRYING, self.executor.tenant_id))
        }

        fn attempts(&self) -> usize {
            self.factory.attempts().len()
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), 2.0)
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 3.0);
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(900));
    }

    #[test]
    fn huge_delays_saturate() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1), 10.0);
        let delay = policy.delay_for_retry(400);
        assert_eq!(delay, Duration::from_millis(u64::MAX));

        let mut work = WorkDescriptor::new(TenantId::new(), "transient");
        work.retry_count = 399;
        policy.schedule_retry(&mut work, Utc::now());
        assert_eq!(work.execution_threshold, Some(DateTime::<Utc>::MAX_UTC));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn schedule_retry_counts_and_backs_off(
            retry_count in 0u32..20,
            base_ms in 1u64..10_000,
            factor in prop::sample::select(vec![1.0f64, 1.5, 2.0, 3.0]),
        ) {
            let policy = RetryPolicy::new(20, Duration::from_millis(base_ms), factor);
            let now = Utc::now();
            let mut work = WorkDescriptor::new(TenantId::new(), "transient");
            work.retry_count = retry_count;

            policy.schedule_retry(&mut work, now);

            prop_assert_eq!(work.retry_count, retry_count + 1);
            let expected_ms = (base_ms as f64 * factor.powi(retry_count as i32)) as u64;
            prop_assert_eq!(
                work.execution_threshold,
                Some(instant_after(now, Duration::from_millis(expected_ms)))
            );
        }

        #[test]
        fn ceiling_is_max_retries(max in 0u32..50, count in 0u32..60) {
            let policy = RetryPolicy::new(max, Duration::from_secs(1), 2.0);
            prop_assert_eq!(policy.should_retry(count), count < max);
        }
    }

    #[test]
    fn retryable_failure_is_resubmitted_once() {
        let h = Harness::start(&["TransientError"], policy());
        let start = h.clock.now();

        h.executor
            .submit(h.work("transient").with_parameter("failures", 1))
            .unwrap();

        assert!(wait_until(WAIT, || h.executor.stats().deferred == 1));
        assert_eq!(h.attempts(), 1);
        assert_eq!(h.retrying(), Some(1));
        assert_eq!(h.executor.stats().retrying, 1);
        assert!(h.factory.handled().is_empty());

        h.clock.add_time(Duration::from_secs(1)).unwrap();
        assert!(wait_until(WAIT, || h.delegate.successes() == 1));

        let attempts = h.factory.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].retry_count, 1);
        assert_eq!(
            attempts[1].threshold,
            Some(start + chrono::Duration::seconds(1))
        );
        assert_eq!(h.delegate.succeeded()[0].retry_count, 0);
        assert_eq!(h.retrying(), Some(0));
        assert!(h.factory.handled().is_empty());
    }

    #[test]
    fn ceiling_reached_invokes_failure_hook() {
        let h = Harness::start(&["TransientError"], policy());
        h.executor.submit(h.work("transient")).unwrap();

        for attempt in 1..=3 {
            assert!(wait_until(WAIT, || {
                h.attempts() == attempt && h.executor.stats().deferred == 1
            }));
            h.clock.add_time(Duration::from_secs(60)).unwrap();
        }

        assert!(wait_until(WAIT, || h.factory.handled().len() == 1));
        let attempts: Vec<u32> = h.factory.attempts().iter().map(|a| a.retry_count).collect();
        assert_eq!(attempts, vec![0, 1, 2, 3]);
        assert_eq!(h.executor.stats().deferred, 0);
        assert_eq!(h.retrying(), Some(0));
        assert_eq!(h.delegate.successes(), 0);
    }

    #[test]
    fn not_retryable_failure_goes_straight_to_the_hook() {
        let h = Harness::start(&["TransientError"], policy());
        h.executor.submit(h.work("fatal")).unwrap();

        assert!(wait_until(WAIT, || h.factory.handled().len() == 1));
        assert!(h.factory.handled()[0].1.contains("fatal test failure"));
        assert_eq!(h.attempts(), 1);
        assert_eq!(h.retrying(), Some(0));
    }

    #[test]
    fn failing_failure_hook_is_contained() {
        let h = Harness::start(&[], policy());
        h.executor.submit(h.work("fatal-handler")).unwrap();
        h.executor.submit(h.work("ok")).unwrap();

        assert!(wait_until(WAIT, || {
            h.factory.handled().len() == 1 && h.delegate.successes() == 1
        }));
    }

    #[test]
    fn lock_timeouts_requeue_without_counting() {
        let h = Harness::start(&[], policy());
        h.executor
            .submit(h.work("lock-timeout").with_parameter("failures", 5))
            .unwrap();

        assert!(wait_until(WAIT, || h.delegate.successes() == 1));
        let attempts = h.factory.attempts();
        assert_eq!(attempts.len(), 6);
        assert!(attempts.iter().all(|a| a.retry_count == 0));
        assert!(h.factory.handled().is_empty());
        assert_eq!(h.retrying(), Some(0));
    }

    #[test]
    fn lock_timeout_requeues_on_a_saturated_pool() {
        let h = Harness::start_sized(&[], policy(), 1, 1);
        h.executor
            .submit(h.work("lock-timeout").with_parameter("failures", 1))
            .unwrap();

        assert!(wait_until(WAIT, || h.delegate.successes() == 1));
        assert_eq!(h.attempts(), 2);
        assert!(h.factory.attempts().iter().all(|a| a.retry_count == 0));
        assert!(h.factory.handled().is_empty());
    }

    #[test]
    fn contended_work_waits_when_the_queue_is_full() {
        let h = Harness::start_sized(&[], policy(), 1, 1);
        h.executor.submit(h.work("block")).unwrap();
        assert!(wait_until(WAIT, || h.executor.stats().running == 1));

        let work = h.work("lock").with_parameter("failures", 0);
        let body = h.factory.create(&work).unwrap();
        h.executor.on_failure(
            work,
            body,
            HashMap::new(),
            anyhow::Error::new(LockError::new("process-1", "busy")),
        );

        assert_eq!(h.executor.stats().deferred, 1);
        assert!(h.factory.handled().is_empty());

        h.factory.gate().open();
        h.clock.add_time(Duration::from_millis(5)).unwrap();
        assert!(wait_until(WAIT, || h.delegate.successes() == 2));
        let rerun = h.factory.attempts().last().cloned().unwrap();
        assert_eq!(rerun.work_type, "lock");
        assert_eq!(rerun.retry_count, 0);
        assert!(rerun.threshold.is_some());
        assert!(h.factory.handled().is_empty());
    }

    #[test]
    fn lock_failures_requeue() {
        let h = Harness::start(&[], policy());
        h.executor
            .submit(h.work("lock").with_parameter("failures", 2))
            .unwrap();

        assert!(wait_until(WAIT, || h.delegate.successes() == 1));
        assert_eq!(h.attempts(), 3);
        assert!(h.factory.handled().is_empty());
    }

    #[test]
    fn unmet_precondition_is_abandoned_silently() {
        let h = Harness::start(&[], policy());
        h.executor.submit(h.work("precondition")).unwrap();

        assert!(wait_until(WAIT, || h.executor.stats().executed == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.attempts(), 1);
        assert!(h.factory.handled().is_empty());
        assert_eq!(h.executor.stats().deferred, 0);
        assert_eq!(h.delegate.successes(), 0);
    }

    #[test]
    fn unmet_precondition_retries_when_classified_retryable() {
        let h = Harness::start(&["PreconditionNotMetError"], policy());
        h.executor
            .submit(h.work("precondition").with_parameter("failures", 1))
            .unwrap();

        assert!(wait_until(WAIT, || h.executor.stats().deferred == 1));
        h.clock.add_time(Duration::from_secs(1)).unwrap();
        assert!(wait_until(WAIT, || h.delegate.successes() == 1));
        assert_eq!(h.factory.attempts()[1].retry_count, 1);
    }

    #[test]
    fn uncertain_commit_is_retried() {
        let h = Harness::start(&[], policy());
        h.executor
            .submit(h.work("commit").with_parameter("failures", 1))
            .unwrap();

        assert!(wait_until(WAIT, || h.executor.stats().deferred == 1));
        h.clock.add_time(Duration::from_secs(1)).unwrap();
        assert!(wait_until(WAIT, || h.delegate.successes() == 1));
        assert!(h.factory.handled().is_empty());
    }

    #[test]
    fn success_resets_retry_count() {
        let h = Harness::start(&[], policy());
        h.executor.retrying.increment();
        let mut work = h.work("ok");
        work.retry_count = 5;

        h.executor.on_success(work);

        assert_eq!(h.delegate.succeeded()[0].retry_count, 0);
        assert_eq!(h.retrying(), Some(0));
    }

    #[test]
    fn rejected_resubmission_goes_to_the_hook() {
        let h = Harness::start_with(
            &["TransientError"],
            RetryPolicy::new(3, Duration::ZERO, 2.0),
            1,
        );
        h.executor.submit(h.work("block")).unwrap();
        assert!(wait_until(WAIT, || h.executor.stats().running == 1));

        let work = h.work("transient");
        let body = h.factory.create(&work).unwrap();
        h.executor.on_failure(
            work,
            body,
            HashMap::new(),
            anyhow::Error::new(TransientError),
        );

        assert_eq!(h.factory.handled().len(), 1);
        assert_eq!(h.retrying(), Some(0));
        h.factory.gate().open();
    }

    #[test]
    fn shutdown_removes_the_retrying_gauge() {
        let h = Harness::start(&[], policy());
        let tenant = h.executor.tenant_id;
        assert_eq!(h.metrics.keys_for(tenant).len(), 4);

        h.executor.shutdown_and_empty_queue();
        assert!(h.executor.await_termination(WAIT).unwrap());
        assert!(h.metrics.keys_for(tenant).is_empty());
        assert!(matches!(
            h.executor.submit(h.work("ok")),
            Err(WorkError::ShutDown(_))
        ));
    }

    #[test]
    fn real_clock_retry_with_short_delay() {
        let mut registry = ErrorTypeRegistry::with_builtins();
        registry.register::<TransientError>("TransientError", None);
        let classifier =
            RetryabilityClassifier::new(Arc::new(registry), ["TransientError"], Vec::<String>::new())
                .unwrap();
        let factory = ScriptedFactory::arc();
        let executor = RetryingWorkExecutor::start(
            TenantId::new(),
            PoolConfig {
                thread_count: 1,
                queue_capacity: 10,
                poll_interval: Duration::from_millis(2),
            },
            PoolResources {
                clock: SystemClock::shared(),
                factory: factory.clone(),
                metrics: InMemoryMetricsRegistry::arc(),
            },
            Arc::new(classifier),
            RetryPolicy::new(5, Duration::from_millis(5), 2.0),
            None,
        )
        .unwrap();

        executor
            .submit(
                WorkDescriptor::new(executor.tenant_id, "transient").with_parameter("failures", 3),
            )
            .unwrap();

        assert!(wait_until(WAIT, || factory.attempts().len() == 4));
        assert!(wait_until(WAIT, || executor.stats().retrying == 0));
        assert!(factory.handled().is_empty());
    }
}
