//! Factory registries and keyed instance registries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::factory::{AnyInstance, TypeFactory};
use crate::key::TypeKey;
use crate::lifetime::Lifetime;

#[derive(Default)]
struct ModuleNode {
    default_factory: Option<TypeFactory>,
    children: HashMap<&'static str, ModuleNode>,
    factories: HashMap<TypeKey, TypeFactory>,
}

/// Tree of type factories for one lifetime, indexed by dotted module path.
///
/// Each node holds the factories registered for types living at that path,
/// plus an optional *default factory* serving the whole subtree. Lookup
/// walks the type's module path and falls back to the most specific
/// default that accepts the requested key.
///
/// # Examples
///
/// ```rust
/// use modulith::{FactoryRegistry, Lifetime, TypeFactory, TypeKey};
///
/// let registry = FactoryRegistry::new(Lifetime::Component);
/// assert!(registry.add_factory(TypeKey::of::<u32>(), TypeFactory::from_instance(42u32)));
/// // duplicates are rejected
/// assert!(!registry.add_factory(TypeKey::of::<u32>(), TypeFactory::from_instance(43u32)));
///
/// let factory = registry.get_factory(&TypeKey::of::<u32>()).unwrap();
/// assert!(factory.is_cached());
/// ```
pub struct FactoryRegistry {
    lifetime: Lifetime,
    root: Mutex<ModuleNode>,
}

impl FactoryRegistry {
    pub fn new(lifetime: Lifetime) -> Self {
        Self {
            lifetime,
            root: Mutex::new(ModuleNode::default()),
        }
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Total number of registered factories across the tree.
    pub fn len(&self) -> usize {
        fn count(node: &ModuleNode) -> usize {
            node.factories.len() + node.children.values().map(count).sum::<usize>()
        }
        count(&self.root.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a factory for `key` at the key's module path. Returns
    /// `false` if the key is already present.
    pub fn add_factory(&self, key: TypeKey, factory: TypeFactory) -> bool {
        let mut root = self.root.lock().unwrap();
        let mut current = &mut *root;
        for seg in key.module_path() {
            current = current.children.entry(seg).or_default();
        }
        if current.factories.contains_key(&key) {
            return false;
        }
        current.factories.insert(key, factory);
        true
    }

    /// Register a wildcard factory for the subtree rooted at `path`
    /// (dotted, empty for the root). Returns `false` if the node already
    /// has a default.
    pub fn add_default_factory(&self, path: &'static str, factory: TypeFactory) -> bool {
        let mut root = self.root.lock().unwrap();
        let mut current = &mut *root;
        if !path.is_empty() {
            for seg in path.split('.') {
                current = current.children.entry(seg).or_default();
            }
        }
        if current.default_factory.is_some() {
            return false;
        }
        current.default_factory = Some(factory);
        true
    }

    /// Remove the factory registered for `key`.
    pub fn remove_factory(&self, key: &TypeKey) -> bool {
        let mut root = self.root.lock().unwrap();
        let mut current = &mut *root;
        for seg in key.module_path() {
            match current.children.get_mut(seg) {
                Some(child) => current = child,
                None => return false,
            }
        }
        current.factories.remove(key).is_some()
    }

    /// Locate a factory able to produce `key`.
    ///
    /// Walks the key's module path; prefers an exact entry at the target
    /// node, then the target's default, then the most specific default on
    /// the walked prefix that accepts the key.
    pub fn get_factory(&self, key: &TypeKey) -> Option<TypeFactory> {
        let root = self.root.lock().unwrap();
        let mut current = &*root;
        let mut visited: Vec<&ModuleNode> = Vec::new();
        let mut complete = true;

        for seg in key.module_path() {
            match current.children.get(seg) {
                Some(child) => {
                    visited.push(current);
                    current = child;
                }
                None => {
                    complete = false;
                    break;
                }
            }
        }

        if complete {
            if let Some(factory) = current.factories.get(key) {
                return Some(factory.clone());
            }
        }
        if let Some(default) = &current.default_factory {
            if default.accepts(key) {
                return Some(default.clone());
            }
        }
        for node in visited.iter().rev() {
            if let Some(default) = &node.default_factory {
                if default.accepts(key) {
                    return Some(default.clone());
                }
            }
        }
        None
    }

    /// Drop every factory and default in the tree.
    pub fn clear(&self) {
        *self.root.lock().unwrap() = ModuleNode::default();
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FactoryRegistry<{}>", self.lifetime)
    }
}

/// Ordered map from type keys to values; first registration wins.
///
/// Used for the resource and provider registries carried by containers,
/// components, and modules.
pub struct KeyedRegistry<V> {
    entries: Mutex<Vec<(TypeKey, V)>>,
}

impl<V: Clone> KeyedRegistry<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register `value` under `key`; `false` if the key is taken.
    pub fn add(&self, key: TypeKey, value: V) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|(k, _)| *k == key) {
            return false;
        }
        entries.push((key, value));
        true
    }

    pub fn has(&self, key: &TypeKey) -> bool {
        self.entries.lock().unwrap().iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &TypeKey) -> Option<V> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, key: &TypeKey) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Snapshot of entries in registration order.
    pub fn items(&self) -> Vec<(TypeKey, V)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<TypeKey> {
        self.entries.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl<V: Clone> Default for KeyedRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of type-erased instances keyed by their type.
pub type InstanceRegistry = KeyedRegistry<AnyInstance>;

impl InstanceRegistry {
    /// Register a value under its own type key.
    pub fn add_value<T: Send + Sync + 'static>(&self, value: T) -> bool {
        self.add(TypeKey::of::<T>(), Arc::new(value))
    }

    /// Typed lookup by type key.
    pub fn get_value<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.get(&TypeKey::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod alpha {
        pub mod beta {
            pub struct Leaf;
        }
        pub struct Mid;
    }

    #[test]
    fn lookup_prefers_exact_entry() {
        let registry = FactoryRegistry::new(Lifetime::Root);
        let key = TypeKey::of::<alpha::beta::Leaf>();
        assert!(registry.add_factory(key, TypeFactory::from_ctor(|| 1u8).accepting_any()));
        assert!(registry
            .add_default_factory("", TypeFactory::from_ctor(|| 2u8).accepting_any()));

        let factory = registry.get_factory(&key).unwrap();
        let v = factory.create(key).unwrap();
        assert_eq!(*v.downcast_ref::<u8>().unwrap(), 1);
    }

    #[test]
    fn default_serves_missing_subtree() {
        let registry = FactoryRegistry::new(Lifetime::Root);
        assert!(registry
            .add_default_factory("", TypeFactory::from_ctor(|| 9u8).accepting_any()));

        let key = TypeKey::of::<alpha::Mid>();
        let factory = registry.get_factory(&key).unwrap();
        let v = factory.create(key).unwrap();
        assert_eq!(*v.downcast_ref::<u8>().unwrap(), 9);
    }

    #[test]
    fn most_specific_default_wins() {
        let registry = FactoryRegistry::new(Lifetime::Root);
        let key = TypeKey::of::<alpha::beta::Leaf>();
        // dotted path of the node holding Leaf
        let deep_path: &'static str =
            Box::leak(key.module_path().collect::<Vec<_>>().join(".").into_boxed_str());
        assert!(registry
            .add_default_factory("", TypeFactory::from_ctor(|| 1u8).accepting_any()));
        assert!(registry
            .add_default_factory(deep_path, TypeFactory::from_ctor(|| 2u8).accepting_any()));

        let factory = registry.get_factory(&key).unwrap();
        let v = factory.create(key).unwrap();
        assert_eq!(*v.downcast_ref::<u8>().unwrap(), 2);
    }

    #[test]
    fn no_candidate_returns_none() {
        let registry = FactoryRegistry::new(Lifetime::Root);
        assert!(registry.get_factory(&TypeKey::of::<u64>()).is_none());
    }

    #[test]
    fn keyed_registry_first_add_wins() {
        let registry: KeyedRegistry<u32> = KeyedRegistry::new();
        assert!(registry.add(TypeKey::of::<u32>(), 1));
        assert!(!registry.add(TypeKey::of::<u32>(), 2));
        assert_eq!(registry.get(&TypeKey::of::<u32>()), Some(1));
        assert!(registry.remove(&TypeKey::of::<u32>()));
        assert!(registry.is_empty());
    }
}
