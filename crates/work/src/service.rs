//! Per-tenant lifecycle of work executors.
//!
//! - `start` builds a fresh executor for the tenant (idempotent)
//! - `pause` drains it and fails hard if in-flight works do not finish in time
//! - `stop` drains it the same way but only logs a slow drain
//! - `resume` is `start` again

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use flowforge_core::{SharedClock, TenantId};
use flowforge_observability::SharedMetricsRegistry;

use crate::classifier::{ErrorTypeRegistry, RetryabilityClassifier};
use crate::config::{ConfigError, WorkConfig};
use crate::descriptor::WorkDescriptor;
use crate::error::{LifecycleError, WorkError};
use crate::pool::{
    CallbackRef, PoolConfig, PoolResources, PoolStats, WorkExecutionCallback, WorkExecutor,
    WorkerPool,
};
use crate::retry::{RetryPolicy, RetryingWorkExecutor};
use crate::work::{Work, WorkContext, WorkFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    Started,
    Paused,
    Stopped,
}

/// Entry point for handing a work to the engine.
pub trait WorkSubmitter: Send + Sync {
    fn execute(&self, work: WorkDescriptor) -> Result<(), WorkError>;
}

/// Builds the executor a tenant runs its works on.
pub trait WorkExecutorFactory: Send + Sync {
    fn create(&self, tenant_id: TenantId) -> Result<Arc<dyn WorkExecutor>, WorkError>;
}

/// Callback of pools running without retries: every failure is final.
#[derive(Debug, Clone, Copy)]
pub struct LoggingCallback {
    tenant_id: TenantId,
}

impl LoggingCallback {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }
}

impl WorkExecutionCallback for LoggingCallback {
    fn on_success(&self, work: WorkDescriptor) {
        debug!(tenant_id = %self.tenant_id, work_id = %work.id, work_type = %work.work_type, "work completed");
    }

    fn on_failure(
        &self,
        work: WorkDescriptor,
        body: Box<dyn Work>,
        context: WorkContext,
        cause: anyhow::Error,
    ) {
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
                "failure handler failed"
            );
        }
    }
}

/// Pools built from a [`WorkConfig`], wrapped in the retry decorator unless
/// retries are disabled.
pub struct DefaultWorkExecutorFactory {
    config: WorkConfig,
    clock: SharedClock,
    works: Arc<dyn WorkFactory>,
    metrics: SharedMetricsRegistry,
    classifier: Arc<RetryabilityClassifier>,
}

impl DefaultWorkExecutorFactory {
    /// Validates the configuration and resolves the retry allow/deny lists.
    pub fn new(
        config: WorkConfig,
        clock: SharedClock,
        works: Arc<dyn WorkFactory>,
        metrics: SharedMetricsRegistry,
        error_types: Arc<ErrorTypeRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let classifier = RetryabilityClassifier::from_config(error_types, &config)?;
        Ok(Self {
            config,
            clock,
            works,
            metrics,
            classifier: Arc::new(classifier),
        })
    }

    pub fn config(&self) -> &WorkConfig {
        &self.config
    }

    fn resources(&self) -> PoolResources {
        PoolResources {
            clock: Arc::clone(&self.clock),
            factory: Arc::clone(&self.works),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl WorkExecutorFactory for DefaultWorkExecutorFactory {
    fn create(&self, tenant_id: TenantId) -> Result<Arc<dyn WorkExecutor>, WorkError> {
        let pool_config = PoolConfig::from_work_config(&self.config);

        if self.config.retry_enabled {
            let executor = RetryingWorkExecutor::start(
                tenant_id,
                pool_config,
                self.resources(),
                Arc::clone(&self.classifier),
                RetryPolicy::from_config(&self.config),
                None,
            )?;
            return Ok(executor);
        }

        let callback = Arc::new(LoggingCallback::new(tenant_id));
        let pool = WorkerPool::start(
            tenant_id,
            pool_config,
            self.resources(),
            CallbackRef::Strong(callback),
        )?;
        Ok(Arc::new(pool))
    }
}

impl std::fmt::Debug for DefaultWorkExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultWorkExecutorFactory")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("classifier", &self.classifier)
            .finish()
    }
}

struct TenantEntry {
    state: TenantState,
    executor: Option<Arc<dyn WorkExecutor>>,
}

/// Owns one executor per tenant.
pub struct WorkExecutorService {
    factory: Arc<dyn WorkExecutorFactory>,
    await_termination_timeout: Duration,
    reject_when_stopped: bool,
    tenants: Mutex<HashMap<TenantId, TenantEntry>>,
}

impl WorkExecutorService {
    pub fn new(factory: Arc<dyn WorkExecutorFactory>, config: &WorkConfig) -> Self {
        Self {
            factory,
            await_termination_timeout: config.await_termination_timeout(),
            reject_when_stopped: config.reject_when_stopped,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// Build the default factory and wrap it in a service.
    pub fn from_config(
        config: WorkConfig,
        clock: SharedClock,
        works: Arc<dyn WorkFactory>,
        metrics: SharedMetricsRegistry,
        error_types: Arc<ErrorTypeRegistry>,
    ) -> Result<Self, ConfigError> {
        let service_config = config.clone();
        let factory = DefaultWorkExecutorFactory::new(config, clock, works, metrics, error_types)?;
        Ok(Self::new(Arc::new(factory), &service_config))
    }

    pub fn start(&self, tenant_id: TenantId) -> Result<(), LifecycleError> {
        let mut tenants = self.lock();
        if let Some(TenantEntry {
            state: TenantState::Started,
            ..
        }) = tenants.get(&tenant_id)
        {
            debug!(tenant_id = %tenant_id, "work executor already started");
            return Ok(());
        }

        let executor = self.factory.create(tenant_id)?;
        tenants.insert(
            tenant_id,
            TenantEntry {
                state: TenantState::Started,
                executor: Some(executor),
            },
        );
        info!(tenant_id = %tenant_id, "work executor started");
        Ok(())
    }

    /// Drain the tenant's executor; a slow or broken drain is an error.
    pub fn pause(&self, tenant_id: TenantId) -> Result<(), LifecycleError> {
        let executor = {
            let mut tenants = self.lock();
            match tenants.get_mut(&tenant_id) {
                Some(entry) if entry.state == TenantState::Started => {
                    entry.state = TenantState::Paused;
                    entry.executor.take()
                }
                _ => None,
            }
        };
        let Some(executor) = executor else {
            debug!(tenant_id = %tenant_id, "work executor not started, nothing to pause");
            return Ok(());
        };

        executor.shutdown_and_empty_queue();
        match executor.await_termination(self.await_termination_timeout) {
            Ok(true) => {
                info!(tenant_id = %tenant_id, "work executor paused");
                Ok(())
            }
            Ok(false) => Err(LifecycleError::TerminationTimeout {
                tenant_id,
                timeout: self.await_termination_timeout,
            }),
            Err(e) => {
                error!(tenant_id = %tenant_id, error = %e, "pause interrupted");
                Err(LifecycleError::Interrupted(tenant_id))
            }
        }
    }

    pub fn resume(&self, tenant_id: TenantId) -> Result<(), LifecycleError> {
        self.start(tenant_id)
    }

    /// Drain and forget the tenant's executor. Never fails on a slow drain.
    pub fn stop(&self, tenant_id: TenantId) {
        let entry = self.lock().remove(&tenant_id);
        let Some(executor) = entry.and_then(|e| e.executor) else {
            debug!(tenant_id = %tenant_id, "work executor already stopped");
            return;
        };

        executor.shutdown_and_empty_queue();
        match executor.await_termination(self.await_termination_timeout) {
            Ok(true) => info!(tenant_id = %tenant_id, "work executor stopped"),
            Ok(false) => warn!(
                tenant_id = %tenant_id,
                timeout = ?self.await_termination_timeout,
                "works still running after stop timeout, abandoning them"
            ),
            Err(e) => warn!(
                tenant_id = %tenant_id,
                error = %e,
                "interrupted while stopping work executor"
            ),
        }
    }

    /// Stop every tenant.
    pub fn stop_all(&self) {
        let tenants: Vec<TenantId> = self.lock().keys().copied().collect();
        for tenant_id in tenants {
            self.stop(tenant_id);
        }
    }

    pub fn state(&self, tenant_id: TenantId) -> TenantState {
        self.lock()
            .get(&tenant_id)
            .map(|e| e.state)
            .unwrap_or(TenantState::Stopped)
    }

    /// Tenants currently started.
    pub fn started_tenants(&self) -> Vec<TenantId> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.state == TenantState::Started)
            .map(|(t, _)| *t)
            .collect()
    }

    pub fn stats(&self, tenant_id: TenantId) -> Option<PoolStats> {
        self.executor(tenant_id).map(|e| e.stats())
    }

    fn executor(&self, tenant_id: TenantId) -> Option<Arc<dyn WorkExecutor>> {
        self.lock().get(&tenant_id).and_then(|e| e.executor.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TenantId, TenantEntry>> {
        self.tenants.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl WorkSubmitter for WorkExecutorService {
    fn execute(&self, work: WorkDescriptor) -> Result<(), WorkError> {
        match self.executor(work.tenant_id) {
            Some(executor) => executor.submit(work),
            None if self.reject_when_stopped => Err(WorkError::ServiceStopped(work.tenant_id)),
            None => {
                warn!(
                    tenant_id = %work.tenant_id,
                    work_id = %work.id,
                    work_type = %work.work_type,
                    "work executor not started, ignoring work"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for WorkExecutorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tenants: HashMap<TenantId, TenantState> =
            self.lock().iter().map(|(t, e)| (*t, e.state)).collect();
        f.debug_struct("WorkExecutorService")
            .field("await_termination_timeout", &self.await_termination_timeout)
            .field("reject_when_stopped", &self.reject_when_stopped)
            .field("tenants", &tenants)
            .finish()
    }
}
