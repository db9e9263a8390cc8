//! The unit of deferred work.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowforge_core::TenantId;

/// Unique work identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes one piece of work: which body to build and with what.
///
/// Retry state lives here too (`retry_count`, `execution_threshold`), so a
/// retried descriptor is just resubmitted; the pool never needs to know.
/// A descriptor is owned by exactly one component at a time and is never
/// running in two workers at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    /// Unique work ID
    pub id: WorkId,
    /// Tenant scope, selects the pool
    pub tenant_id: TenantId,
    /// Type tag used to construct the work body
    pub work_type: String,
    /// Parameters handed to the body as its initial context
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Retries so far; reset on success
    pub retry_count: u32,
    /// Not before this instant, when set
    pub execution_threshold: Option<DateTime<Utc>>,
    /// When the work was registered against its transaction
    pub registration_date: Option<DateTime<Utc>>,
}

impl WorkDescriptor {
    pub fn new(tenant_id: TenantId, work_type: impl Into<String>) -> Self {
        Self {
            id: WorkId::new(),
            tenant_id,
            work_type: work_type.into(),
            parameters: BTreeMap::new(),
            retry_count: 0,
            execution_threshold: None,
            registration_date: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Do not run before `at`.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.execution_threshold = Some(at);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.get(key)
    }

    /// Whether the work may run at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.execution_threshold {
            Some(at) => at <= now,
            None => true,
        }
    }
}

impl std::fmt::Display for WorkDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.work_type, self.id)?;
        if self.retry_count > 0 {
            write!(f, " (retry {})", self.retry_count)?;
        }
        Ok(())
    }
}
