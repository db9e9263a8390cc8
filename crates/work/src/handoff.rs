//! Transactional hand-off: works registered inside a transaction reach the
//! executor only once that transaction committed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use flowforge_core::{SharedClock, instant_after};

use crate::config::WorkConfig;
use crate::descriptor::WorkDescriptor;
use crate::error::WorkError;
use crate::service::WorkSubmitter;
use crate::transaction::{ResourceCount, TransactionOutcome, TransactionService, TransactionSynchronization};

/// Registers works against the current transaction.
#[derive(Clone)]
pub struct WorkService {
    submitter: Arc<dyn WorkSubmitter>,
    clock: SharedClock,
    delay_on_multiple_resources: Duration,
}

impl WorkService {
    pub fn new(submitter: Arc<dyn WorkSubmitter>, clock: SharedClock, config: &WorkConfig) -> Self {
        Self {
            submitter,
            clock,
            delay_on_multiple_resources: config.delay_on_multiple_resources(),
        }
    }

    pub fn with_delay_on_multiple_resources(mut self, delay: Duration) -> Self {
        self.delay_on_multiple_resources = delay;
        self
    }

    /// Stamp the registration date and defer execution to commit time.
    pub fn register_work(
        &self,
        transactions: &dyn TransactionService,
        mut work: WorkDescriptor,
    ) -> Result<(), WorkError> {
        work.registration_date = Some(self.clock.now());
        debug!(
            tenant_id = %work.tenant_id,
            work_id = %work.id,
            work_type = %work.work_type,
            "work registered"
        );
        transactions.register_synchronization(Box::new(WorkSynchronization {
            work,
            submitter: Arc::clone(&self.submitter),
            clock: Arc::clone(&self.clock),
            delay_on_multiple_resources: self.delay_on_multiple_resources,
        }))?;
        Ok(())
    }
}

impl std::fmt::Debug for WorkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkService")
            .field("clock", &self.clock)
            .field("delay_on_multiple_resources", &self.delay_on_multiple_resources)
            .finish()
    }
}

/// Transaction listener carrying one registered work.
pub struct WorkSynchronization {
    work: WorkDescriptor,
    submitter: Arc<dyn WorkSubmitter>,
    clock: SharedClock,
    delay_on_multiple_resources: Duration,
}

impl WorkSynchronization {
    fn needs_delay(&self, outcome: &TransactionOutcome) -> bool {
        !self.delay_on_multiple_resources.is_zero() && outcome.resources != ResourceCount::Single
    }
}

impl TransactionSynchronization for WorkSynchronization {
    fn after_completion(self: Box<Self>, outcome: &TransactionOutcome) {
        if !outcome.is_committed() {
            debug!(
                tenant_id = %self.work.tenant_id,
                work_id = %self.work.id,
                state = ?outcome.state,
                "transaction not committed, discarding work"
            );
            return;
        }

        let delay = self.needs_delay(outcome);
        let mut work = self.work;
        if delay {
            work.execution_threshold = Some(instant_after(self.clock.now(), self.delay_on_multiple_resources));
        }

        let (tenant_id, work_id) = (work.tenant_id, work.id);
        if let Err(e) = self.submitter.execute(work) {
            error!(
                tenant_id = %tenant_id,
                work_id = %work_id,
                error = %e,
                "unable to execute work after commit"
            );
        }
    }
}

impl std::fmt::Debug for WorkSynchronization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkSynchronization")
            .field("work", &self.work)
            .field("delay_on_multiple_resources", &self.delay_on_multiple_resources)
            .finish()
    }
}
