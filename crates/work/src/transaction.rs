//! Transaction seam used by the hand-off.
//!
//! The engine never drives transactions itself; it only needs to hook a
//! listener onto the current one and learn how it ended.

use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("no active transaction")]
    NoActiveTransaction,
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Committed,
    RolledBack,
    /// Completed without a known outcome (e.g. heuristic or failed commit).
    Unknown,
}

/// How many transactional resources took part in the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCount {
    Single,
    Multiple,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub state: TransactionState,
    pub resources: ResourceCount,
}

impl TransactionOutcome {
    pub fn committed(resources: ResourceCount) -> Self {
        Self {
            state: TransactionState::Committed,
            resources,
        }
    }

    pub fn rolled_back() -> Self {
        Self {
            state: TransactionState::RolledBack,
            resources: ResourceCount::Single,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }
}

/// Listener notified once the transaction completed.
pub trait TransactionSynchronization: Send {
    fn after_completion(self: Box<Self>, outcome: &TransactionOutcome);
}

/// Access to the transaction active for the caller.
pub trait TransactionService: Send + Sync {
    fn register_synchronization(
        &self,
        synchronization: Box<dyn TransactionSynchronization>,
    ) -> Result<(), TransactionError>;
}

#[derive(Default)]
struct LocalState {
    active: bool,
    resources: usize,
    resources_unknown: bool,
    synchronizations: Vec<Box<dyn TransactionSynchronization>>,
}

/// In-process transaction for tests/dev.
///
/// One transaction at a time: `begin`, enlist resources, then `commit` or
/// `rollback`. Synchronizations run on the completing thread, after the
/// transaction has been closed.
#[derive(Default)]
pub struct LocalTransaction {
    state: Mutex<LocalState>,
}

impl LocalTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transaction that is already active.
    pub fn begun() -> Self {
        let tx = Self::new();
        tx.begin();
        tx
    }

    pub fn begin(&self) {
        let mut state = self.lock();
        *state = LocalState {
            active: true,
            ..LocalState::default()
        };
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn enlist_resource(&self) -> Result<(), TransactionError> {
        let mut state = self.lock();
        if !state.active {
            return Err(TransactionError::NoActiveTransaction);
        }
        state.resources += 1;
        Ok(())
    }

    /// The participating resources cannot be counted reliably.
    pub fn mark_resource_count_unknown(&self) -> Result<(), TransactionError> {
        let mut state = self.lock();
        if !state.active {
            return Err(TransactionError::NoActiveTransaction);
        }
        state.resources_unknown = true;
        Ok(())
    }

    pub fn commit(&self) -> Result<TransactionOutcome, TransactionError> {
        self.complete(TransactionState::Committed)
    }

    pub fn rollback(&self) -> Result<TransactionOutcome, TransactionError> {
        self.complete(TransactionState::RolledBack)
    }

    /// Close the transaction with `state` and notify every synchronization.
    pub fn complete(&self, state: TransactionState) -> Result<TransactionOutcome, TransactionError> {
        let (outcome, synchronizations) = {
            let mut guard = self.lock();
            if !guard.active {
                return Err(TransactionError::NoActiveTransaction);
            }
            let resources = if guard.resources_unknown {
                ResourceCount::Unknown
            } else if guard.resources > 1 {
                ResourceCount::Multiple
            } else {
                ResourceCount::Single
            };
            let done = std::mem::take(&mut *guard);
            (TransactionOutcome { state, resources }, done.synchronizations)
        };

        debug!(
            state = ?outcome.state,
            resources = ?outcome.resources,
            synchronizations = synchronizations.len(),
            "transaction completed"
        );
        for synchronization in synchronizations {
            synchronization.after_completion(&outcome);
        }
        Ok(outcome)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl TransactionService for LocalTransaction {
    fn register_synchronization(
        &self,
        synchronization: Box<dyn TransactionSynchronization>,
    ) -> Result<(), TransactionError> {
        let mut state = self.lock();
        if !state.active {
            return Err(TransactionError::NoActiveTransaction);
        }
        state.synchronizations.push(synchronization);
        Ok(())
    }
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("LocalTransaction")
            .field("active", &state.active)
            .field("resources", &state.resources)
            .field("resources_unknown", &state.resources_unknown)
            .field("synchronizations", &state.synchronizations.len())
            .finish()
    }
}
