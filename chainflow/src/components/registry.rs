//! Per-build singleton cache for shared components.

use super::ComponentHandle;
use crate::errors::ConstructionError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Identifies one pipeline build.
///
/// Shared components are constructed once per scope. Builds that should
/// share singletons are given the same scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildScope(Uuid);

impl BuildScope {
    /// Creates a fresh scope.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the scope id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for BuildScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Slot = Arc<Mutex<Option<ComponentHandle>>>;

/// Cache of shared component instances keyed by build scope and identity.
#[derive(Default)]
pub struct ComponentRegistry {
    slots: DashMap<(BuildScope, String), Slot>,
    constructions: AtomicUsize,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the instance for `identity` in `scope`, constructing it with
    /// `create` on first use.
    ///
    /// Concurrent callers for the same key wait on one slot, so `create` runs
    /// at most once per successful construction. A failed construction leaves
    /// the slot empty.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `create`.
    pub fn get_or_create<F>(
        &self,
        scope: BuildScope,
        identity: &str,
        create: F,
    ) -> Result<ComponentHandle, ConstructionError>
    where
        F: FnOnce() -> Result<ComponentHandle, ConstructionError>,
    {
        let key = (scope, identity.to_ascii_lowercase());
        let slot: Slot = Arc::clone(&self.slots.entry(key).or_default());

        let mut guard = slot.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = create()?;
        self.constructions.fetch_add(1, Ordering::SeqCst);
        debug!(scope = %scope, component = %identity, "Constructed shared component");
        *guard = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Returns the cached instance, if constructed.
    #[must_use]
    pub fn get(&self, scope: BuildScope, identity: &str) -> Option<ComponentHandle> {
        let slot = self
            .slots
            .get(&(scope, identity.to_ascii_lowercase()))
            .map(|entry| Arc::clone(entry.value()))?;
        let guard = slot.lock();
        guard.clone()
    }

    /// Returns true if any slot of `scope` exists, constructed or not.
    #[must_use]
    pub fn contains_scope(&self, scope: BuildScope) -> bool {
        self.slots.iter().any(|entry| entry.key().0 == scope)
    }

    /// Drops every instance of one scope.
    pub fn release(&self, scope: BuildScope) {
        self.slots.retain(|(s, _), _| *s != scope);
    }

    /// Drops every instance of every scope.
    pub fn reset(&self) {
        self.slots.clear();
    }

    /// Returns the number of constructed instances currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|entry| entry.value().lock().is_some()).count()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many constructions this registry has performed.
    #[must_use]
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("slots", &self.slots.len())
            .field("constructions", &self.constructions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingComponent;
    use std::thread;

    fn make(name: &str) -> Result<ComponentHandle, ConstructionError> {
        Ok(Arc::new(RecordingComponent::new(name)))
    }

    #[test]
    fn test_same_scope_same_instance() {
        let registry = ComponentRegistry::new();
        let scope = BuildScope::new();

        let a = registry.get_or_create(scope, "Embeddings", || make("e")).unwrap();
        let b = registry.get_or_create(scope, "embeddings", || make("other")).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.constructions(), 1);
    }

    #[test]
    fn test_scopes_are_independent() {
        let registry = ComponentRegistry::new();
        let (s1, s2) = (BuildScope::new(), BuildScope::new());

        let a = registry.get_or_create(s1, "e", || make("e")).unwrap();
        let b = registry.get_or_create(s2, "e", || make("e")).unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        registry.release(s1);
        assert!(registry.get(s1, "e").is_none());
        assert!(registry.get(s2, "e").is_some());

        registry.reset();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_construction_leaves_slot_empty() {
        let registry = ComponentRegistry::new();
        let scope = BuildScope::new();

        let err = registry
            .get_or_create(scope, "e", || {
                Err(ConstructionError::Failed {
                    component: "e".to_string(),
                    cause: anyhow::anyhow!("unreachable host"),
                })
            })
            .unwrap_err();
        assert_eq!(err.component(), "e");
        assert!(registry.get(scope, "e").is_none());

        registry.get_or_create(scope, "e", || make("e")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_construct_once() {
        let registry = Arc::new(ComponentRegistry::new());
        let scope = BuildScope::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry
                        .get_or_create(scope, "shared", || {
                            thread::sleep(std::time::Duration::from_millis(5));
                            make("shared")
                        })
                        .unwrap()
                })
            })
            .collect();

        let instances: Vec<ComponentHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.constructions(), 1);
    }
}
