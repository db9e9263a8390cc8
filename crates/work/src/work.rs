//! Work bodies and the registry that builds them from descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::descriptor::WorkDescriptor;
use crate::error::WorkError;

/// Mutable context handed to a work body, seeded from the descriptor's
/// parameters.
pub type WorkContext = HashMap<String, serde_json::Value>;

/// Continuation of a work that finishes asynchronously.
pub type WorkFuture = BoxFuture<'static, anyhow::Result<()>>;

/// How a work body returned.
pub enum Execution {
    /// Done; the work succeeded.
    Completed,
    /// Still going. The outcome is decided when the future resolves; the
    /// worker slot is released immediately.
    Continue(WorkFuture),
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Execution::Completed => f.write_str("Completed"),
            Execution::Continue(_) => f.write_str("Continue(..)"),
        }
    }
}

/// An executable work body.
pub trait Work: Send + Sync {
    /// Human-readable description used in logs.
    fn description(&self) -> String;

    /// Run the work.
    fn work(&self, context: &mut WorkContext) -> anyhow::Result<Execution>;

    /// Terminal hook, called only once the engine gives up on the work.
    fn handle_failure(&self, cause: &anyhow::Error, context: &WorkContext) -> anyhow::Result<()>;
}

/// Builds work bodies from descriptors.
pub trait WorkFactory: Send + Sync {
    fn create(&self, descriptor: &WorkDescriptor) -> Result<Box<dyn Work>, WorkError>;
}

impl<F: WorkFactory + ?Sized> WorkFactory for Arc<F> {
    fn create(&self, descriptor: &WorkDescriptor) -> Result<Box<dyn Work>, WorkError> {
        (**self).create(descriptor)
    }
}

/// Work constructor function type.
pub type WorkConstructor = Box<dyn Fn(&WorkDescriptor) -> Box<dyn Work> + Send + Sync>;

/// Map from work type to constructor.
///
/// Lookup order: exact type name, then category patterns (`"bpm.*"` matches
/// `"bpm.execute-flow-node"`), then the `"*"` fallback.
#[derive(Default)]
pub struct WorkFactoryRegistry {
    constructors: HashMap<String, WorkConstructor>,
}

impl WorkFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a work type pattern.
    pub fn register<F>(&mut self, type_pattern: impl Into<String>, constructor: F)
    where
        F: Fn(&WorkDescriptor) -> Box<dyn Work> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_pattern.into(), Box::new(constructor));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, type_pattern: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&WorkDescriptor) -> Box<dyn Work> + Send + Sync + 'static,
    {
        self.register(type_pattern, constructor);
        self
    }

    fn constructor_for(&self, work_type: &str) -> Option<&WorkConstructor> {
        if let Some(c) = self.constructors.get(work_type) {
            return Some(c);
        }

        // Longest category prefix wins.
        let category = self
            .constructors
            .iter()
            .filter_map(|(pattern, c)| {
                let prefix = pattern.strip_suffix(".*")?;
                work_type
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), c))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, c)| c);
        if category.is_some() {
            return category;
        }

        self.constructors.get("*")
    }
}

impl WorkFactory for WorkFactoryRegistry {
    fn create(&self, descriptor: &WorkDescriptor) -> Result<Box<dyn Work>, WorkError> {
        let constructor = self
            .constructor_for(&descriptor.work_type)
            .ok_or_else(|| WorkError::UnknownWorkType(descriptor.work_type.clone()))?;
        Ok(constructor(descriptor))
    }
}

impl std::fmt::Debug for WorkFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.constructors.keys().collect();
        patterns.sort();
        f.debug_struct("WorkFactoryRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}
