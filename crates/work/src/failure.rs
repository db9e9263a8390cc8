//! Failure types work bodies raise and the engine recognises.
//!
//! Work bodies return `anyhow::Error`; wrapping one of these types (directly
//! or anywhere in the cause chain) changes how the retry decorator and the
//! classifier treat the failure.

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Timed out waiting for a lock on a shared resource.
///
/// Routine contention: requeued as-is, never counted as a retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("timed out after {timeout:?} waiting for lock on `{resource}`")]
pub struct LockTimeoutError {
    pub resource: String,
    pub timeout: Duration,
}

impl LockTimeoutError {
    pub fn new(resource: impl Into<String>, timeout: Duration) -> Self {
        Self {
            resource: resource.into(),
            timeout,
        }
    }
}

/// Lock acquisition failed for a reason other than a timeout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to lock `{resource}`: {message}")]
pub struct LockError {
    pub resource: String,
    pub message: String,
}

impl LockError {
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// The state a work expects is not there (yet, or anymore).
///
/// Abandoned by default; whatever re-triggers the business event re-creates
/// the work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("precondition not met: {0}")]
pub struct PreconditionNotMetError(pub String);

impl PreconditionNotMetError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Committing the unit of work the job's effects depend on failed.
///
/// When the cause is a connectivity problem the commit may or may not have
/// landed.
#[derive(Debug, Error)]
#[error("commit failed: {message}")]
pub struct CommitFailedError {
    pub message: String,
    #[source]
    pub source: BoxError,
}

impl CommitFailedError {
    pub fn new(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: source.into(),
        }
    }
}

/// Lost or refused connection to a backing store.
///
/// Always retryable, whatever the configured allow-list says.
#[derive(Debug, Error)]
#[error("connection to `{endpoint}` failed: {message}")]
pub struct ConnectionError {
    pub endpoint: String,
    pub message: String,
    #[source]
    pub source: Option<std::io::Error>,
}

impl ConnectionError {
    pub fn new(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_io(mut self, source: std::io::Error) -> Self {
        self.source = Some(source);
        self
    }
}

/// Several independent failures reported as one (e.g. a batch flush).
///
/// Each nested cause is walked by the classifier.
#[derive(Debug, Error)]
#[error("{message} ({count} nested failures)", count = .causes.len())]
pub struct MultiCauseError {
    pub message: String,
    pub causes: Vec<anyhow::Error>,
}

impl MultiCauseError {
    pub fn new(message: impl Into<String>, causes: Vec<anyhow::Error>) -> Self {
        Self {
            message: message.into(),
            causes,
        }
    }
}

/// `std::io::Error` kinds that indicate a connectivity problem.
pub fn is_connectivity_io_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe | TimedOut
    )
}

/// Find the first error of type `E` in the cause chain.
pub fn find_in_chain<E: StdError + 'static>(err: &anyhow::Error) -> Option<&E> {
    err.chain().find_map(|e| e.downcast_ref::<E>())
}
