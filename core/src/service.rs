//! Services under test and the registry that creates them
//!
//! A configuration setup names a service. When a worker enters a topology
//! it looks the name up in a [`ServiceRegistry`] and asks the factory for
//! the [`Capabilities`] of a fresh service instance. Stages only ever see
//! those capabilities.

use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::Capabilities;
use crate::error::{Error, Result};
use crate::scenario::{Cluster, Properties};

pub mod inmemory;

pub use inmemory::{InMemoryService, INMEMORY};

/// Where a service instance is created
#[derive(Debug, Clone, Copy)]
pub struct ServiceContext<'a> {
    /// Index of the hosting worker
    pub worker_index: usize,
    /// Current topology
    pub cluster: &'a Cluster,
    /// Group of the hosting worker
    pub group: &'a str,
    /// Evaluated setup properties
    pub properties: &'a Properties,
}

/// Creates service instances and publishes their capabilities
pub trait ServiceFactory: Send + Sync {
    /// Create a new instance for one topology run
    fn create(&self, context: &ServiceContext<'_>) -> Result<Capabilities>;
}

impl<F> ServiceFactory for F
where
    F: Fn(&ServiceContext<'_>) -> Result<Capabilities> + Send + Sync,
{
    fn create(&self, context: &ServiceContext<'_>) -> Result<Capabilities> {
        self(context)
    }
}

/// Maps service names to factories
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, Arc<dyn ServiceFactory>>,
}

impl ServiceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled services
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(INMEMORY, Arc::new(InMemoryService::factory));
        registry
    }

    /// Register a factory under a service name
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Whether a service name is known
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Create an instance of the named service
    pub fn create(&self, name: &str, context: &ServiceContext<'_>) -> Result<Capabilities> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::orchestration(format!("unknown service '{name}'")))?;
        factory.create(context)
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ServiceRegistry")
            .field("services", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::BasicOperations;

    #[test]
    fn test_unknown_service() {
        let registry = ServiceRegistry::with_builtin();
        let cluster = Cluster::single(1);
        let properties = Properties::new();
        let context = ServiceContext {
            worker_index: 0,
            cluster: &cluster,
            group: "default",
            properties: &properties,
        };
        assert!(registry.contains(INMEMORY));
        assert!(registry.create("redis", &context).is_err());
        let caps = registry.create(INMEMORY, &context).unwrap();
        assert!(caps.get::<dyn BasicOperations>().is_some());
    }

    fn empty_service(_: &ServiceContext<'_>) -> Result<Capabilities> {
        Ok(Capabilities::new())
    }

    #[test]
    fn test_function_factory() {
        let mut registry = ServiceRegistry::new();
        registry.register("empty", Arc::new(empty_service));
        let cluster = Cluster::single(1);
        let properties = Properties::new();
        let context = ServiceContext {
            worker_index: 0,
            cluster: &cluster,
            group: "default",
            properties: &properties,
        };
        assert!(registry.create("empty", &context).unwrap().is_empty());
    }
}
