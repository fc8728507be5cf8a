//! Policy rules and their resolution into review requirements.
//!
//! A `PolicySet` is loaded once and never mutated. Reloading builds a fresh
//! set and swaps it into a `PolicyHandle` as a whole, so a reader always sees
//! either the old rules or the new ones.

pub mod pattern;
pub mod resolver;
pub mod rules;

use std::sync::{Arc, RwLock};

use thiserror::Error;

pub use pattern::Pattern;
pub use resolver::{resolve, PolicyConflict, Resolution, ResolutionRequest};
pub use rules::{PolicyRule, PolicySet};

/// Errors raised while loading policy rules.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid rule {rule}: {message}")]
    InvalidRule { rule: String, message: String },
}

/// Shared handle to the active policy.
#[derive(Clone, Default)]
pub struct PolicyHandle {
    current: Arc<RwLock<Arc<PolicySet>>>,
}

impl PolicyHandle {
    pub fn new(policy: PolicySet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    /// Snapshot of the active rules. Callers keep using their snapshot even
    /// if a reload happens meanwhile.
    pub fn current(&self) -> Arc<PolicySet> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the active rules, returning the previous set.
    pub fn replace(&self, policy: PolicySet) -> Arc<PolicySet> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(policy))
    }
}
