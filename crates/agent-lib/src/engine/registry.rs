//! Registry of running containers, keyed by canonical name
//!
//! Written by the event monitor, read by the poll loop and the API. Every
//! operation takes the lock once, so a poll-tick snapshot never observes a
//! half-applied event.

use crate::models::ContainerRef;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Registry of running containers
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    containers: RwLock<HashMap<String, ContainerRef>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with an initial listing
    pub fn with_containers(containers: impl IntoIterator<Item = ContainerRef>) -> Self {
        let registry = Self::new();
        registry.replace_all(containers);
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ContainerRef>> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ContainerRef>> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a container, replacing any entry with the same name
    pub fn register(&self, container: ContainerRef) -> Option<ContainerRef> {
        debug!(container = %container.name, id = %container.short_id(), "Registering container");
        self.write().insert(container.name.clone(), container)
    }

    /// Unregister a container by name
    pub fn unregister(&self, name: &str) -> Option<ContainerRef> {
        debug!(container = %name, "Unregistering container");
        self.write().remove(name)
    }

    /// Replace the whole registry content
    pub fn replace_all(&self, containers: impl IntoIterator<Item = ContainerRef>) {
        let fresh: HashMap<String, ContainerRef> = containers
            .into_iter()
            .map(|container| (container.name.clone(), container))
            .collect();
        *self.write() = fresh;
    }

    pub fn get(&self, name: &str) -> Option<ContainerRef> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Names of all registered containers, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Point-in-time copy of all entries, sorted by name
    pub fn snapshot(&self) -> Vec<ContainerRef> {
        let mut containers: Vec<ContainerRef> = self.read().values().cloned().collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        containers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let registry = ContainerRegistry::new();
        registry.register(ContainerRef::new("id-a", "/a", "alpine"));
        registry.register(ContainerRef::new("id-b", "b", "alpine"));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);

        let removed = registry.unregister("a").unwrap();
        assert_eq!(removed.id, "id-a");
        assert!(!registry.contains("a"));
        assert!(registry.unregister("a").is_none());
    }

    #[test]
    fn test_register_replaces_wholesale() {
        let registry = ContainerRegistry::new();
        registry.register(ContainerRef::new("old-id", "web", "nginx:1"));
        let previous = registry.register(ContainerRef::new("new-id", "web", "nginx:2"));

        assert_eq!(previous.unwrap().id, "old-id");
        assert_eq!(registry.get("web").unwrap().image, "nginx:2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replace_all() {
        let registry = ContainerRegistry::with_containers(vec![ContainerRef::new("1", "x", "")]);
        registry.replace_all(vec![ContainerRef::new("2", "y", ""), ContainerRef::new("3", "z", "")]);

        assert!(!registry.contains("x"));
        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.snapshot()[0].name, "y");
    }

    #[test]
    fn test_empty() {
        let registry = ContainerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("missing").is_none());
    }
}
