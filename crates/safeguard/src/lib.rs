//! # safeguard
//!
//! Safety coordination for destructive operations against shared cloud
//! resources, run from independent processes with no coordination service.
//!
//! This crate provides:
//! - [`LockManager`]: filesystem mutual-exclusion locks with stale-owner reclamation
//! - [`StateStore`]: a JSON state document replaced atomically on every write
//! - [`GraphBuilder`] and [`detect_cycle`]: dependency graphs that veto unsafe deletions
//! - [`Coordinator`]: error classification, recovery and diagnostics reports
//! - [`Safeguard`]: the guarded delete that strings them together
//!
//! All cross-process coordination goes through two filesystem primitives:
//! create-if-absent (hard link of a complete temp file) and atomic replace
//! (rename of a complete temp file).
//!
//! ## Example
//!
//! ```no_run
//! use safeguard::{DeleteRequest, MemoryProvider, ResourceId, Safeguard, SafetyConfig};
//! use std::path::Path;
//!
//! let guard = Safeguard::new(SafetyConfig::under(Path::new("/var/lib/cloudsweep")));
//!
//! let provider = MemoryProvider::new();
//! provider.insert(ResourceId::new("disk", "disk-1"), []);
//! provider.insert(ResourceId::new("instance", "vm-1"), [ResourceId::new("disk", "disk-1")]);
//!
//! // Rejected before any lock is taken: vm-1 still needs disk-1
//! let outcome = guard.delete(&provider, &DeleteRequest::new(ResourceId::new("disk", "disk-1")));
//! assert!(outcome.report().is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod graph;
pub mod lock;
pub mod logtail;
pub mod process;
pub mod provider;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod types;

pub use config::{GraphConfig, LockConfig, ReportConfig, RetryConfig, SafetyConfig, StateConfig};
pub use error::{Error, ErrorCategory, GraphError, LockError, ProviderError, Result, StateError};
pub use executor::{DeleteRequest, DeleteSummary, Safeguard};
pub use graph::{
    CycleCheck, DeletionPlan, DeletionPolicy, DependencyGraph, GraphBuilder, authorize_deletion,
    detect_cycle,
};
pub use lock::{HeldLocks, LockManager, LockRecord, LockStatus};
pub use logtail::LogTail;
pub use process::{Owner, ProcessProbe, SystemProbe};
pub use provider::{MemoryProvider, ProviderOp, ResourceProvider};
pub use recovery::{
    AttemptState, Coordinator, EnvironmentSnapshot, ErrorReport, OperationContext, Outcome,
    Recovery, RecoveryOutcome, list_reports, load_report,
};
pub use retry::{LogCallback, RetryCallback, Retryable, jittered_delay, with_retry};
pub use state::{OperationEntry, ResourceRecord, StateDocument, StateStore, Validation};
pub use types::{ResourceDescriptor, ResourceId, ResourceState};
