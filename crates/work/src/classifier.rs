//! Retryability classification of work failures.
//!
//! A failure is classified by walking its whole cause graph (source chain
//! plus the nested causes of [`MultiCauseError`]s) and matching each node
//! against named error types:
//!
//! 1. deny-listed type anywhere in the graph → [`Retryability::NotRetryable`]
//! 2. connectivity problem anywhere → retryable, or
//!    [`Retryability::UncertainCompletionOfCommit`] when the outermost error
//!    is a [`CommitFailedError`]
//! 3. allow-listed type anywhere → [`Retryability::Retryable`]
//! 4. otherwise → [`Retryability::NotRetryable`]
//!
//! Names are resolved against an [`ErrorTypeRegistry`] when the classifier is
//! built, so a bad allow/deny entry fails fast.

use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{ConfigError, WorkConfig};
use crate::failure::{
    CommitFailedError, ConnectionError, LockError, LockTimeoutError, MultiCauseError,
    PreconditionNotMetError, is_connectivity_io_error,
};

type DynError = dyn StdError + 'static;
type Matcher = fn(&DynError) -> bool;

/// Verdict for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Retryability {
    Retryable,
    NotRetryable,
    /// Retryable, but the failing commit may already have been applied.
    UncertainCompletionOfCommit,
}

impl Retryability {
    pub fn should_retry(self) -> bool {
        !matches!(self, Retryability::NotRetryable)
    }
}

/// Root category every built-in type descends from.
pub const ROOT_CATEGORY: &str = "Error";

#[derive(Clone)]
struct ErrorType {
    parent: Option<String>,
    matcher: Option<Matcher>,
}

impl std::fmt::Debug for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorType")
            .field("parent", &self.parent)
            .field("category", &self.matcher.is_none())
            .finish()
    }
}

fn is_type<E: StdError + 'static>(err: &DynError) -> bool {
    err.is::<E>()
}

/// Named error types and their parent relationships.
///
/// A concrete type is registered with a matcher (a downcast check); a
/// category has no matcher and only groups the types registered beneath it.
/// Naming a category in an allow/deny list covers all of its descendants.
#[derive(Debug, Clone, Default)]
pub struct ErrorTypeRegistry {
    types: HashMap<String, ErrorType>,
}

impl ErrorTypeRegistry {
    /// Empty registry, without even the root category.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the engine's failure types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry
            .register_category(ROOT_CATEGORY, None)
            .register_category("LockFailure", Some(ROOT_CATEGORY))
            .register::<LockError>("LockError", Some("LockFailure"))
            .register::<LockTimeoutError>("LockTimeoutError", Some("LockFailure"))
            .register::<PreconditionNotMetError>("PreconditionNotMetError", Some(ROOT_CATEGORY))
            .register::<CommitFailedError>("CommitFailedError", Some(ROOT_CATEGORY))
            .register_category("ConnectivityFailure", Some(ROOT_CATEGORY))
            .register::<ConnectionError>("ConnectionError", Some("ConnectivityFailure"))
            .register::<std::io::Error>("IoError", Some(ROOT_CATEGORY))
            .register::<MultiCauseError>("MultiCauseError", Some(ROOT_CATEGORY));
        registry
    }

    /// Register a concrete error type under `name`.
    pub fn register<E: StdError + 'static>(&mut self, name: &str, parent: Option<&str>) -> &mut Self {
        self.types.insert(
            name.to_string(),
            ErrorType {
                parent: parent.map(String::from),
                matcher: Some(is_type::<E>),
            },
        );
        self
    }

    /// Register a category (abstract parent) under `name`.
    pub fn register_category(&mut self, name: &str, parent: Option<&str>) -> &mut Self {
        self.types.insert(
            name.to_string(),
            ErrorType {
                parent: parent.map(String::from),
                matcher: None,
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Resolve a configured name, failing on blank or unknown names.
    fn resolve(&self, name: &str) -> Result<String, ConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::BlankErrorTypeName);
        }
        if !self.contains(name) {
            return Err(ConfigError::UnknownErrorType(name.to_string()));
        }
        Ok(name.to_string())
    }

    /// Whether `name` is `ancestor` or descends from it.
    fn is_a(&self, name: &str, ancestor: &str) -> bool {
        let mut current = Some(name);
        let mut seen = HashSet::new();
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            if !seen.insert(n) {
                return false;
            }
            current = self.types.get(n).and_then(|t| t.parent.as_deref());
        }
        false
    }

    /// Whether the error is an instance of `name` (or one of its subtypes).
    ///
    /// The root category covers every error, registered or not.
    fn matches(&self, err: &DynError, name: &str) -> bool {
        if name == ROOT_CATEGORY {
            return true;
        }
        self.types.iter().any(|(candidate, t)| {
            t.matcher.is_some_and(|m| m(err)) && self.is_a(candidate, name)
        })
    }
}

/// Every node of a failure's cause graph, outermost first, each visited once.
pub fn cause_graph(err: &anyhow::Error) -> Vec<&DynError> {
    let root: &DynError = err.as_ref();
    let mut nodes = Vec::new();
    // Keyed on the fat pointer: a source stored at offset 0 of its parent
    // shares the parent's address but not its vtable.
    let mut seen: HashSet<*const DynError> = HashSet::new();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        if !seen.insert(node as *const DynError) {
            continue;
        }
        nodes.push(node);

        // Pushed in reverse so the walk stays depth-first, left to right.
        let mut children: Vec<&DynError> = Vec::new();
        if let Some(multi) = node.downcast_ref::<MultiCauseError>() {
            children.extend(multi.causes.iter().map(|c| -> &DynError { c.as_ref() }));
        }
        if let Some(source) = node.source() {
            children.push(source);
        }
        stack.extend(children.into_iter().rev());
    }

    nodes
}

fn is_connectivity(err: &DynError) -> bool {
    err.is::<ConnectionError>()
        || err
            .downcast_ref::<std::io::Error>()
            .is_some_and(is_connectivity_io_error)
}

/// Maps a failure to a [`Retryability`] verdict.
#[derive(Debug, Clone)]
pub struct RetryabilityClassifier {
    registry: Arc<ErrorTypeRegistry>,
    retryable: Vec<String>,
    never_retry: Vec<String>,
}

impl RetryabilityClassifier {
    /// Build a classifier; every name must resolve in `registry`.
    pub fn new<A, D>(registry: Arc<ErrorTypeRegistry>, retryable: A, never_retry: D) -> Result<Self, ConfigError>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let retryable = retryable
            .into_iter()
            .map(|n| registry.resolve(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let never_retry = never_retry
            .into_iter()
            .map(|n| registry.resolve(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            registry,
            retryable,
            never_retry,
        })
    }

    pub fn from_config(registry: Arc<ErrorTypeRegistry>, config: &WorkConfig) -> Result<Self, ConfigError> {
        Self::new(registry, &config.retryable_errors, &config.never_retry_errors)
    }

    pub fn registry(&self) -> &ErrorTypeRegistry {
        &self.registry
    }

    pub fn classify(&self, err: &anyhow::Error) -> Retryability {
        let nodes = cause_graph(err);
        let any_of = |names: &[String]| {
            nodes
                .iter()
                .any(|node| names.iter().any(|n| self.registry.matches(*node, n)))
        };

        if any_of(&self.never_retry) {
            return Retryability::NotRetryable;
        }

        if nodes.iter().any(|node| is_connectivity(*node)) {
            let outermost_is_commit = nodes.first().is_some_and(|n| n.is::<CommitFailedError>());
            return if outermost_is_commit {
                Retryability::UncertainCompletionOfCommit
            } else {
                Retryability::Retryable
            };
        }

        if any_of(&self.retryable) {
            Retryability::Retryable
        } else {
            Retryability::NotRetryable
        }
    }
}
