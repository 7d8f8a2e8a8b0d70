//! The guarded delete operation.
//!
//! [`Safeguard`] owns the lock manager and state store for one process and
//! runs deletions in a fixed order: build the dependency graph, authorize the
//! plan, lock every resource it touches, mutate through the provider, record
//! each transition in the state store, release. Any failure goes to the
//! recovery coordinator, which may rerun the whole sequence from the graph
//! check onwards.

use crate::config::{RetryConfig, SafetyConfig};
use crate::error::{Error, ProviderError};
use crate::graph::{DeletionPlan, DeletionPolicy, GraphBuilder, authorize_deletion};
use crate::lock::LockManager;
use crate::logtail::LogTail;
use crate::provider::ResourceProvider;
use crate::recovery::{Coordinator, OperationContext, Outcome};
use crate::state::StateStore;
use crate::types::{ResourceId, ResourceState};

/// What to delete and how.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    /// Resource to delete
    pub target: ResourceId,
    /// What to do about dependents
    pub policy: DeletionPolicy,
    /// Stop after authorization
    pub dry_run: bool,
}

impl DeleteRequest {
    /// Delete `target` only if nothing depends on it.
    pub fn new(target: ResourceId) -> Self {
        Self {
            target,
            policy: DeletionPolicy::RefuseIfDependents,
            dry_run: false,
        }
    }
}

/// Result of a completed delete.
#[derive(Debug, Clone)]
pub struct DeleteSummary {
    /// The authorized plan
    pub plan: DeletionPlan,
    /// Resources actually deleted, in order
    pub deleted: Vec<ResourceId>,
    /// Whether this was a dry run
    pub dry_run: bool,
}

/// Per-process handle on the shared lock directory, state document and
/// diagnostics directory.
pub struct Safeguard {
    config: SafetyConfig,
    locks: LockManager,
    state: StateStore,
    log_tail: LogTail,
}

impl Safeguard {
    /// Build every component from `config`.
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            locks: LockManager::from_config(&config),
            state: StateStore::from_config(&config),
            log_tail: LogTail::default(),
            config,
        }
    }

    /// Capture log lines from `tail` into error reports.
    pub fn with_log_tail(mut self, tail: LogTail) -> Self {
        self.log_tail = tail;
        self
    }

    /// Replace the lock manager (e.g. to inject a liveness probe).
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// State store.
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Recovery coordinator bound to this handle's components.
    pub fn coordinator(&self) -> Coordinator<'_> {
        Coordinator::new(&self.config, &self.locks, &self.state).with_log_tail(self.log_tail.clone())
    }

    /// Graph builder using the configured limits and retry policy.
    pub fn graph_builder<'p>(&self, provider: &'p dyn ResourceProvider) -> GraphBuilder<'p> {
        GraphBuilder::new(provider)
            .with_config(self.config.graph)
            .with_retry(self.config.retry)
    }

    /// Delete `request.target` (and, under `Cascade`, its dependents).
    ///
    /// An unsafe plan is rejected before any lock is taken or any provider
    /// mutation is issued.
    pub fn delete(
        &self,
        provider: &dyn ResourceProvider,
        request: &DeleteRequest,
    ) -> Outcome<DeleteSummary> {
        let ctx = OperationContext::for_resource("delete", request.target.clone());
        self.coordinator().run(&ctx, || self.delete_once(provider, request))
    }

    fn delete_once(
        &self,
        provider: &dyn ResourceProvider,
        request: &DeleteRequest,
    ) -> Result<DeleteSummary, Error> {
        // Backoff belongs to the coordinator; a failed query fails the attempt
        let graph = GraphBuilder::new(provider)
            .with_config(self.config.graph)
            .with_retry(RetryConfig::no_retry())
            .build(&request.target)?;
        let plan = authorize_deletion(&graph, request.policy)?;

        if request.dry_run {
            log::info!(
                "Dry run: would delete {} resource(s) starting with {}",
                plan.order.len(),
                plan.order.first().unwrap_or(&plan.root)
            );
            return Ok(DeleteSummary {
                plan,
                deleted: Vec::new(),
                dry_run: true,
            });
        }

        // Released on every exit from `mutate`, unwinding included
        let held = self.locks.acquire_all(plan.resources())?;
        let result = self.mutate(provider, &plan);
        drop(held);

        let deleted = result?;
        log::info!("Deleted {} resource(s) for {}", deleted.len(), plan.root);
        Ok(DeleteSummary {
            plan,
            deleted,
            dry_run: false,
        })
    }

    /// Delete every resource in plan order. Locks are held by the caller.
    fn mutate(
        &self,
        provider: &dyn ResourceProvider,
        plan: &DeletionPlan,
    ) -> Result<Vec<ResourceId>, Error> {
        for resource in &plan.order {
            self.state.update_resource_state(resource, ResourceState::Locked)?;
        }

        let mut deleted = Vec::with_capacity(plan.order.len());
        for (i, resource) in plan.order.iter().enumerate() {
            self.state.update_resource_state(resource, ResourceState::Mutating)?;

            match provider.delete(resource) {
                Ok(()) => {}
                Err(ProviderError::NotFound { .. }) => {
                    log::info!("{resource} was already gone");
                }
                Err(source) => {
                    // Outcome of the failed call is unknown; the rest is untouched
                    self.record_best_effort(resource, ResourceState::Unknown);
                    for untouched in &plan.order[i + 1..] {
                        self.record_best_effort(untouched, ResourceState::Unlocked);
                    }
                    return Err(Error::Provider {
                        resource: resource.clone(),
                        source,
                    });
                }
            }

            self.state.update_resource_state(resource, ResourceState::Deleted)?;
            deleted.push(resource.clone());
        }
        Ok(deleted)
    }

    fn record_best_effort(&self, resource: &ResourceId, state: ResourceState) {
        if let Err(e) = self.state.update_resource_state(resource, state) {
            log::error!("Failed to record {resource} as {state}: {e}");
        }
    }
}
