//! Name-keyed component factories.

use super::{ComponentArgs, ComponentHandle};
use crate::errors::ConstructionError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Factory function type for constructing components.
pub type ComponentFactory = Arc<dyn Fn(&ComponentArgs) -> anyhow::Result<ComponentHandle> + Send + Sync>;

/// Registry of component factories keyed by type name.
///
/// Names are matched case-insensitively.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: RwLock<HashMap<String, ComponentFactory>>,
}

impl FactoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one with the same name.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ComponentArgs) -> anyhow::Result<ComponentHandle> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(component = %name, "Registered component factory");
        self.factories.write().insert(name.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Returns true if a factory exists for the name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(&name.to_ascii_lowercase())
    }

    /// Returns the registered names, lowercased and sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered factories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    /// Returns true if no factories are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }

    /// Constructs a component with the factory registered for `args.kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::NoFactory`] if no factory is registered,
    /// or [`ConstructionError::Failed`] if the factory fails.
    pub fn construct(&self, args: &ComponentArgs) -> Result<ComponentHandle, ConstructionError> {
        // Clone out so the lock is not held while user code runs.
        let factory = self
            .factories
            .read()
            .get(&args.kind.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ConstructionError::NoFactory {
                component: args.identity.clone(),
                kind: args.kind.clone(),
            })?;

        factory(args).map_err(|cause| ConstructionError::Failed {
            component: args.identity.clone(),
            cause,
        })
    }

    /// Removes all factories.
    pub fn clear(&self) {
        self.factories.write().clear();
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

static GLOBAL_FACTORIES: RwLock<Option<Arc<FactoryRegistry>>> = RwLock::new(None);

/// Gets the process-wide factory registry, creating it on first use.
pub fn global_factories() -> Arc<FactoryRegistry> {
    if let Some(registry) = GLOBAL_FACTORIES.read().as_ref() {
        return Arc::clone(registry);
    }

    let mut write = GLOBAL_FACTORIES.write();
    Arc::clone(write.get_or_insert_with(|| Arc::new(FactoryRegistry::new())))
}

/// Registers a factory in the process-wide registry.
pub fn register_factory<F>(name: impl Into<String>, factory: F)
where
    F: Fn(&ComponentArgs) -> anyhow::Result<ComponentHandle> + Send + Sync + 'static,
{
    global_factories().register(name, factory);
}

/// Drops the process-wide registry; the next access starts empty.
pub fn clear_factories() {
    *GLOBAL_FACTORIES.write() = None;
}
