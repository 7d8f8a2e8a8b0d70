//! The seam to the remote resource-management API.
//!
//! The core never talks to a cloud API directly. Everything it needs goes
//! through [`ResourceProvider`]: describe a resource, list what depends on
//! it, delete it. [`MemoryProvider`] is a complete in-process implementation
//! used for offline inventories and tests.

use crate::error::ProviderError;
use crate::types::{ResourceDescriptor, ResourceId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Access to the remote resource inventory.
///
/// All three calls may be slow, rate-limited or transiently failing; callers
/// classify failures through [`ProviderError::category`].
///
/// # Example
///
/// ```ignore
/// use safeguard::{ProviderError, ResourceDescriptor, ResourceId, ResourceProvider};
///
/// struct Fixed;
///
/// impl ResourceProvider for Fixed {
///     fn describe(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, ProviderError> {
///         Ok(Some(ResourceDescriptor::new(id.clone())))
///     }
///
///     fn dependents_of(&self, _id: &ResourceId) -> Result<Vec<ResourceId>, ProviderError> {
///         Ok(Vec::new())
///     }
///
///     fn delete(&self, _id: &ResourceId) -> Result<(), ProviderError> {
///         Ok(())
///     }
/// }
/// ```
pub trait ResourceProvider: Send + Sync {
    /// Look up a resource. `Ok(None)` means it does not exist.
    fn describe(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, ProviderError>;

    /// Immediate dependents: resources that need `id` to exist.
    fn dependents_of(&self, id: &ResourceId) -> Result<Vec<ResourceId>, ProviderError>;

    /// Delete a resource.
    fn delete(&self, id: &ResourceId) -> Result<(), ProviderError>;
}

/// Provider operation, for call accounting and scripted failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    /// [`ResourceProvider::describe`]
    Describe,
    /// [`ResourceProvider::dependents_of`]
    DependentsOf,
    /// [`ResourceProvider::delete`]
    Delete,
}

#[derive(Debug, Clone)]
struct Entry {
    descriptor: ResourceDescriptor,
    depends_on: Vec<ResourceId>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<ResourceId, Entry>,
    calls: HashMap<ProviderOp, usize>,
    queried: HashMap<ResourceId, usize>,
    failures: HashMap<ProviderOp, (ProviderError, u32)>,
}

/// In-memory provider with call accounting and scriptable failures.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Add (or replace) a resource and the resources it depends on.
    pub fn insert(&self, id: ResourceId, depends_on: impl IntoIterator<Item = ResourceId>) {
        self.insert_descriptor(ResourceDescriptor::new(id), depends_on);
    }

    /// Add (or replace) a resource with a full descriptor.
    pub fn insert_descriptor(
        &self,
        descriptor: ResourceDescriptor,
        depends_on: impl IntoIterator<Item = ResourceId>,
    ) {
        let entry = Entry {
            depends_on: depends_on.into_iter().collect(),
            descriptor,
        };
        self.with_inner(|inner| {
            inner.resources.insert(entry.descriptor.id.clone(), entry);
        });
    }

    /// Add a "`dependent` needs `dependency`" edge.
    pub fn add_dependency(&self, dependent: &ResourceId, dependency: ResourceId) {
        self.with_inner(|inner| {
            if let Some(entry) = inner.resources.get_mut(dependent) {
                entry.depends_on.push(dependency);
            }
        });
    }

    /// Drop a "`dependent` needs `dependency`" edge.
    pub fn remove_dependency(&self, dependent: &ResourceId, dependency: &ResourceId) {
        self.with_inner(|inner| {
            if let Some(entry) = inner.resources.get_mut(dependent) {
                entry.depends_on.retain(|d| d != dependency);
            }
        });
    }

    /// Whether `id` currently exists.
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.with_inner(|inner| inner.resources.contains_key(id))
    }

    /// Every resource with its dependencies, sorted by identity.
    pub fn entries(&self) -> Vec<(ResourceDescriptor, Vec<ResourceId>)> {
        self.with_inner(|inner| {
            inner
                .resources
                .values()
                .map(|e| (e.descriptor.clone(), e.depends_on.clone()))
                .collect()
        })
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: ProviderOp, error: ProviderError, times: u32) {
        self.with_inner(|inner| {
            inner.failures.insert(op, (error, times));
        });
    }

    /// Number of calls made for `op`, failed ones included.
    pub fn calls(&self, op: ProviderOp) -> usize {
        self.with_inner(|inner| inner.calls.get(&op).copied().unwrap_or(0))
    }

    /// Number of `dependents_of` calls made for `id`.
    pub fn dependents_queries(&self, id: &ResourceId) -> usize {
        self.with_inner(|inner| inner.queried.get(id).copied().unwrap_or(0))
    }

    /// Count the call and consume a scripted failure, if any.
    fn enter(inner: &mut Inner, op: ProviderOp) -> Result<(), ProviderError> {
        *inner.calls.entry(op).or_default() += 1;
        let Some((error, remaining)) = inner.failures.get_mut(&op) else {
            return Ok(());
        };
        let error = error.clone();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            inner.failures.remove(&op);
        }
        Err(error)
    }
}

impl ResourceProvider for MemoryProvider {
    fn describe(&self, id: &ResourceId) -> Result<Option<ResourceDescriptor>, ProviderError> {
        self.with_inner(|inner| {
            Self::enter(inner, ProviderOp::Describe)?;
            Ok(inner.resources.get(id).map(|e| e.descriptor.clone()))
        })
    }

    fn dependents_of(&self, id: &ResourceId) -> Result<Vec<ResourceId>, ProviderError> {
        self.with_inner(|inner| {
            *inner.queried.entry(id.clone()).or_default() += 1;
            Self::enter(inner, ProviderOp::DependentsOf)?;
            Ok(inner
                .resources
                .iter()
                .filter(|(_, e)| e.depends_on.contains(id))
                .map(|(dependent, _)| dependent.clone())
                .collect())
        })
    }

    fn delete(&self, id: &ResourceId) -> Result<(), ProviderError> {
        self.with_inner(|inner| {
            Self::enter(inner, ProviderOp::Delete)?;
            if inner.resources.remove(id).is_none() {
                return Err(ProviderError::NotFound {
                    resource: id.clone(),
                });
            }
            log::debug!("Provider deleted {id}");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(kind: &str, name: &str) -> ResourceId {
        ResourceId::new(kind, name)
    }

    #[test]
    fn test_dependents_are_reverse_edges() {
        let provider = MemoryProvider::new();
        provider.insert(id("disk", "disk-1"), []);
        provider.insert(id("instance", "vm-1"), [id("disk", "disk-1")]);
        provider.insert(id("instance", "vm-2"), [id("disk", "disk-1")]);

        let dependents = provider.dependents_of(&id("disk", "disk-1")).unwrap();
        assert_eq!(dependents, vec![id("instance", "vm-1"), id("instance", "vm-2")]);
        assert!(provider.dependents_of(&id("instance", "vm-1")).unwrap().is_empty());
        assert_eq!(provider.dependents_queries(&id("disk", "disk-1")), 1);
    }

    #[test]
    fn test_describe_and_delete() {
        let provider = MemoryProvider::new();
        provider.insert(id("disk", "disk-1"), []);

        assert!(provider.describe(&id("disk", "disk-1")).unwrap().is_some());
        assert!(provider.describe(&id("disk", "nope")).unwrap().is_none());

        provider.delete(&id("disk", "disk-1")).unwrap();
        assert!(!provider.contains(&id("disk", "disk-1")));
        assert!(matches!(
            provider.delete(&id("disk", "disk-1")),
            Err(ProviderError::NotFound { .. })
        ));
        assert_eq!(provider.calls(ProviderOp::Delete), 2);
    }

    #[test]
    fn test_scripted_failures_run_out() {
        let provider = MemoryProvider::new();
        provider.insert(id("disk", "disk-1"), []);
        provider.fail_next(
            ProviderOp::Describe,
            ProviderError::Unavailable {
                message: "503".into(),
            },
            2,
        );

        assert!(provider.describe(&id("disk", "disk-1")).is_err());
        assert!(provider.describe(&id("disk", "disk-1")).is_err());
        assert!(provider.describe(&id("disk", "disk-1")).unwrap().is_some());
        assert_eq!(provider.calls(ProviderOp::Describe), 3);
    }

    #[test]
    fn test_edges_can_be_edited() {
        let provider = MemoryProvider::new();
        provider.insert(id("a", "1"), []);
        provider.insert(id("b", "2"), []);

        provider.add_dependency(&id("b", "2"), id("a", "1"));
        assert_eq!(provider.dependents_of(&id("a", "1")).unwrap(), vec![id("b", "2")]);

        provider.remove_dependency(&id("b", "2"), &id("a", "1"));
        assert!(provider.dependents_of(&id("a", "1")).unwrap().is_empty());
    }
}
