//! Engine error model.

use std::time::Duration;

use thiserror::Error;

use flowforge_core::TenantId;

use crate::transaction::TransactionError;

/// Error returned by engine operations (submission, registration, startup).
///
/// Failures raised by work bodies are not `WorkError`s: they travel as
/// `anyhow::Error` through the failure callback.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("work queue of tenant {tenant_id} is full (capacity {capacity})")]
    QueueFull { tenant_id: TenantId, capacity: usize },

    #[error("worker pool of tenant {0} is shut down")]
    ShutDown(TenantId),

    #[error("work executor of tenant {0} is not started")]
    ServiceStopped(TenantId),

    #[error("no work registered for type `{0}`")]
    UnknownWorkType(String),

    #[error("interrupted while awaiting termination of tenant {0}")]
    Interrupted(TenantId),

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl WorkError {
    pub fn spawn(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            what: what.into(),
            source,
        }
    }
}

/// Hard failure of a lifecycle transition.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("timed out after {timeout:?} awaiting termination of tenant {tenant_id}")]
    TerminationTimeout { tenant_id: TenantId, timeout: Duration },

    #[error("interrupted while awaiting termination of tenant {0}")]
    Interrupted(TenantId),

    #[error(transparent)]
    Work(#[from] WorkError),
}
