//! Asynchronous work execution engine.
//!
//! Turns "something must happen after this transaction" into reliably
//! executed background work:
//!
//! - [`WorkService`] registers a [`WorkDescriptor`] against the active
//!   transaction and only hands it on once the transaction committed
//! - [`WorkExecutorService`] owns one executor per tenant and drives the
//!   start / pause / resume / stop lifecycle
//! - [`RetryingWorkExecutor`] decides whether a failed work is resubmitted
//!   with exponential backoff, using the [`RetryabilityClassifier`]
//! - [`WorkerPool`] runs work bodies on a fixed set of worker threads,
//!   deferring works whose execution threshold lies in the future
//!
//! All time is read from an injectable [`flowforge_core::Clock`].

pub mod classifier;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod failure;
pub mod handoff;
pub mod pool;
pub mod retry;
pub mod service;
pub mod transaction;
pub mod work;

#[cfg(test)]
pub(crate) mod test_support;

pub use classifier::{ErrorTypeRegistry, Retryability, RetryabilityClassifier};
pub use config::{ConfigError, WorkConfig};
pub use descriptor::{WorkDescriptor, WorkId};
pub use error::{LifecycleError, WorkError};
pub use failure::{
    CommitFailedError, ConnectionError, LockError, LockTimeoutError, MultiCauseError,
    PreconditionNotMetError,
};
pub use handoff::{WorkService, WorkSynchronization};
pub use pool::{
    CallbackRef, PoolConfig, PoolResources, PoolStats, WorkExecutionCallback, WorkExecutor,
    WorkerPool,
};
pub use retry::{RetryPolicy, RetryingWorkExecutor};
pub use service::{
    DefaultWorkExecutorFactory, LoggingCallback, TenantState, WorkExecutorFactory,
    WorkExecutorService, WorkSubmitter,
};
pub use transaction::{
    LocalTransaction, ResourceCount, TransactionError, TransactionOutcome, TransactionService,
    TransactionState, TransactionSynchronization,
};
pub use work::{Execution, Work, WorkContext, WorkFactory, WorkFactoryRegistry, WorkFuture};
