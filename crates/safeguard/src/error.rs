//! Error types for the safety core.
//!
//! Every error maps onto a fixed [`ErrorCategory`], which is what the
//! recovery coordinator dispatches on and what diagnostics reports record.

use crate::types::ResourceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Lock could not be acquired before the deadline
    LockTimeout,
    /// Release attempted by a process that does not own the lock
    LockNotOwner,
    /// State document could not be parsed
    StateCorruption,
    /// Local I/O failure on the lock directory, state document or diagnostics
    StateIoError,
    /// Dependency graph contains a cycle
    DependencyCycle,
    /// Target is still required by live dependents
    DependentsExist,
    /// Provider throttled the request
    ProviderRateLimited,
    /// Provider quota exhausted
    ProviderQuotaExceeded,
    /// Provider unreachable or returned a transient server error
    ProviderUnavailable,
    /// Provider refused the request
    ProviderPermissionDenied,
    /// Anything unclassified
    Internal,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCategory; 11] = [
        Self::LockTimeout,
        Self::LockNotOwner,
        Self::StateCorruption,
        Self::StateIoError,
        Self::DependencyCycle,
        Self::DependentsExist,
        Self::ProviderRateLimited,
        Self::ProviderQuotaExceeded,
        Self::ProviderUnavailable,
        Self::ProviderPermissionDenied,
        Self::Internal,
    ];

    /// Stable upper-case code, used as the prefix of error identifiers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockTimeout => "LOCK_TIMEOUT",
            Self::LockNotOwner => "LOCK_NOT_OWNER",
            Self::StateCorruption => "STATE_CORRUPTION",
            Self::StateIoError => "STATE_IO",
            Self::DependencyCycle => "DEPENDENCY_CYCLE",
            Self::DependentsExist => "DEPENDENTS_EXIST",
            Self::ProviderRateLimited => "PROVIDER_RATE_LIMITED",
            Self::ProviderQuotaExceeded => "PROVIDER_QUOTA_EXCEEDED",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::ProviderPermissionDenied => "PROVIDER_PERMISSION_DENIED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether failures of this category are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderRateLimited | Self::ProviderQuotaExceeded | Self::ProviderUnavailable
        )
    }

    /// Whether this category has an automated recovery routine at all.
    ///
    /// `LockNotOwner`, `DependencyCycle` and `DependentsExist` must abort the
    /// operation, so they never do.
    pub fn has_recovery(&self) -> bool {
        self.is_retryable() || matches!(self, Self::StateCorruption | Self::LockTimeout)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::LockTimeout => "Timed out waiting for a resource lock",
            Self::LockNotOwner => "Lock released by a process that does not own it",
            Self::StateCorruption => "State document is corrupt",
            Self::StateIoError => "Local state I/O failure",
            Self::DependencyCycle => "Dependency cycle detected",
            Self::DependentsExist => "Resource is still in use",
            Self::ProviderRateLimited => "Provider rate limit hit",
            Self::ProviderQuotaExceeded => "Provider quota exceeded",
            Self::ProviderUnavailable => "Provider unavailable",
            Self::ProviderPermissionDenied => "Provider permission denied",
            Self::Internal => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::LockTimeout => {
                "Another invocation holds the lock; check `cloudsweep locks list` and wait or stop it"
            }
            Self::LockNotOwner => "This is a coordination bug; do not delete lock files by hand",
            Self::StateCorruption => "Run `cloudsweep state repair`; the old document is kept aside",
            Self::StateIoError => "Check permissions and free space in the state directory",
            Self::DependencyCycle => "Break the cycle manually before deleting any member of it",
            Self::DependentsExist => "Delete the dependents first, or re-run with --cascade",
            Self::ProviderRateLimited | Self::ProviderQuotaExceeded => {
                "Wait and retry later, or lower request volume"
            }
            Self::ProviderUnavailable => "Check connectivity to the provider and try again",
            Self::ProviderPermissionDenied => "Check the credentials and IAM permissions in use",
            Self::Internal => "Check the error details for more information",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors from the lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    /// Deadline elapsed while another live process held the lock
    #[error("timed out after {waited:?} waiting for lock on {resource} (held by {holder})")]
    TimedOut {
        /// Resource whose lock was requested
        resource: ResourceId,
        /// How long the caller waited
        waited: Duration,
        /// Label of the owner seen last
        holder: String,
    },

    /// Lock is held by another process
    #[error("lock on {resource} is held by {owner}, not by this process")]
    NotOwner {
        /// Resource whose lock was released
        resource: ResourceId,
        /// Label of the actual owner
        owner: String,
    },

    /// No lock entry exists for the resource
    #[error("no lock held on {resource}")]
    NotFound {
        /// Resource whose lock was released
        resource: ResourceId,
    },

    /// Filesystem error in the lock directory
    #[error("lock I/O error at {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Category for recovery dispatch.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TimedOut { .. } => ErrorCategory::LockTimeout,
            // A missing entry at release means ownership was lost
            Self::NotOwner { .. } | Self::NotFound { .. } => ErrorCategory::LockNotOwner,
            Self::Io { .. } => ErrorCategory::StateIoError,
        }
    }
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// The document exists but cannot be parsed
    #[error("state document {path} is corrupt: {message}")]
    Corrupt {
        /// Path of the document
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// Filesystem error reading or replacing the document
    #[error("state I/O error at {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Document could not be serialized
    #[error("failed to serialize state document: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Category for recovery dispatch.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Corrupt { .. } => ErrorCategory::StateCorruption,
            Self::Io { .. } => ErrorCategory::StateIoError,
            Self::Serialize(_) => ErrorCategory::Internal,
        }
    }
}

/// Errors reported by a [`ResourceProvider`](crate::provider::ResourceProvider).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Request throttled
    #[error("rate limited: {message}")]
    RateLimited {
        /// Provider message
        message: String,
        /// Provider-suggested wait, if any
        retry_after: Option<Duration>,
    },

    /// Quota exhausted
    #[error("quota exceeded: {message}")]
    QuotaExceeded {
        /// Provider message
        message: String,
    },

    /// Transient outage
    #[error("provider unavailable: {message}")]
    Unavailable {
        /// Provider message
        message: String,
    },

    /// Credentials lack the needed permission
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Provider message
        message: String,
    },

    /// Resource does not exist
    #[error("resource not found: {resource}")]
    NotFound {
        /// Resource that was queried
        resource: ResourceId,
    },

    /// Other provider error
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Category for recovery dispatch.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimited { .. } => ErrorCategory::ProviderRateLimited,
            Self::QuotaExceeded { .. } => ErrorCategory::ProviderQuotaExceeded,
            Self::Unavailable { .. } => ErrorCategory::ProviderUnavailable,
            Self::PermissionDenied { .. } => ErrorCategory::ProviderPermissionDenied,
            Self::NotFound { .. } | Self::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Provider-suggested wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors from dependency graph construction.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The root resource is unknown to the provider
    #[error("root resource not found: {0}")]
    RootNotFound(ResourceId),

    /// Construction visited more nodes than allowed
    #[error("dependency graph exceeds {limit} nodes")]
    TooLarge {
        /// Configured node limit
        limit: usize,
    },

    /// A provider query failed; no partial graph is returned
    #[error("querying dependents of {resource}: {source}")]
    Provider {
        /// Node being expanded
        resource: ResourceId,
        /// Provider failure
        #[source]
        source: ProviderError,
    },
}

impl GraphError {
    /// Category for recovery dispatch.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Provider { source, .. } => source.category(),
            Self::RootNotFound(_) | Self::TooLarge { .. } => ErrorCategory::Internal,
        }
    }
}

/// Umbrella error for operations that span components.
#[derive(Debug, Error)]
pub enum Error {
    /// Lock manager failure
    #[error(transparent)]
    Lock(#[from] LockError),

    /// State store failure
    #[error(transparent)]
    State(#[from] StateError),

    /// Graph construction failure
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Provider mutation failure
    #[error("provider error on {resource}: {source}")]
    Provider {
        /// Resource being mutated
        resource: ResourceId,
        /// Provider failure
        #[source]
        source: ProviderError,
    },

    /// Deletion plan rejected: the graph has a cycle
    #[error("dependency cycle: {}", join_ids(path, " -> "))]
    DependencyCycle {
        /// Nodes on the cycle, first node repeated at the end
        path: Vec<ResourceId>,
    },

    /// Deletion plan rejected: the target still has dependents
    #[error("{resource} is still required by {}", join_ids(dependents, ", "))]
    DependentsExist {
        /// Deletion target
        resource: ResourceId,
        /// Live dependents
        dependents: Vec<ResourceId>,
    },

    /// Diagnostics directory failure
    #[error("diagnostics I/O error at {path}: {source}")]
    Diagnostics {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Category for recovery dispatch.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Lock(e) => e.category(),
            Error::State(e) => e.category(),
            Error::Graph(e) => e.category(),
            Error::Provider { source, .. } => source.category(),
            Error::DependencyCycle { .. } => ErrorCategory::DependencyCycle,
            Error::DependentsExist { .. } => ErrorCategory::DependentsExist,
            Error::Diagnostics { .. } => ErrorCategory::StateIoError,
            Error::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Resource the failure is about, when there is one.
    pub fn resource(&self) -> Option<&ResourceId> {
        match self {
            Error::Lock(
                LockError::TimedOut { resource, .. }
                | LockError::NotOwner { resource, .. }
                | LockError::NotFound { resource },
            ) => Some(resource),
            Error::Graph(GraphError::Provider { resource, .. } | GraphError::RootNotFound(resource)) => {
                Some(resource)
            }
            Error::Provider { resource, .. } | Error::DependentsExist { resource, .. } => {
                Some(resource)
            }
            _ => None,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

fn join_ids(ids: &[ResourceId], sep: &str) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

/// Result type for safety-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_recovery_policy() {
        assert!(ErrorCategory::ProviderRateLimited.is_retryable());
        assert!(ErrorCategory::ProviderQuotaExceeded.is_retryable());
        assert!(ErrorCategory::ProviderUnavailable.is_retryable());
        assert!(!ErrorCategory::ProviderPermissionDenied.is_retryable());

        assert!(ErrorCategory::StateCorruption.has_recovery());
        assert!(ErrorCategory::LockTimeout.has_recovery());
        assert!(!ErrorCategory::LockNotOwner.has_recovery());
        assert!(!ErrorCategory::DependencyCycle.has_recovery());
        assert!(!ErrorCategory::DependentsExist.has_recovery());
    }

    #[test]
    fn test_codes_are_unique() {
        let mut codes: Vec<_> = ErrorCategory::ALL.iter().map(ErrorCategory::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), ErrorCategory::ALL.len());
    }

    #[test]
    fn test_error_categories() {
        let id = ResourceId::new("disk", "d1");

        let err = Error::from(LockError::NotFound {
            resource: id.clone(),
        });
        assert_eq!(err.category(), ErrorCategory::LockNotOwner);
        assert_eq!(err.resource(), Some(&id));

        let err = Error::from(GraphError::Provider {
            resource: id.clone(),
            source: ProviderError::RateLimited {
                message: "slow down".into(),
                retry_after: None,
            },
        });
        assert_eq!(err.category(), ErrorCategory::ProviderRateLimited);
        assert!(err.is_retryable());

        let err = Error::from(StateError::Corrupt {
            path: PathBuf::from("/tmp/state.json"),
            message: "EOF".into(),
        });
        assert_eq!(err.category(), ErrorCategory::StateCorruption);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = Error::DependencyCycle {
            path: vec![
                ResourceId::new("a", "1"),
                ResourceId::new("b", "2"),
                ResourceId::new("a", "1"),
            ],
        };
        assert_eq!(err.to_string(), "dependency cycle: a/1 -> b/2 -> a/1");
    }
}
