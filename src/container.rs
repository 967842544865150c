//! Lifetime-scoped container over the factory-registry ladder.

use std::sync::{Arc, Mutex};

use crate::error::ContainerError;
use crate::factory::{AnyInstance, TypeFactory};
use crate::key::TypeKey;
use crate::lifetime::Lifetime;
use crate::registry::{FactoryRegistry, InstanceRegistry};

/// Pre-bound values seeded into a container's resources on scope entry.
pub type SeedBag = Vec<(TypeKey, AnyInstance)>;

/// Helper building a seed entry from a plain value.
pub fn seed_value<T: Send + Sync + 'static>(value: T) -> (TypeKey, AnyInstance) {
    (TypeKey::of::<T>(), Arc::new(value))
}

/// A lifetime-bound facade over type factories that resolves, caches, and
/// finalises instances.
///
/// A container references the factory registry of its own lifetime plus
/// the registries of every strictly longer lifetime (handed to children on
/// descent), and optionally a parent container to which unresolved lookups
/// delegate. Cached hits from ancestors are memoised locally.
///
/// # Examples
///
/// ```rust
/// use modulith::{make_container, Lifetime, TypeFactory, TypeKey};
///
/// // the ladder stops at the first non-autocreate rung
/// let container = make_container(Vec::new(), None);
/// assert_eq!(container.lifetime(), Lifetime::Component);
///
/// container
///     .registry()
///     .add_factory(TypeKey::of::<u32>(), TypeFactory::from_instance(42u32));
/// assert_eq!(container.get::<u32>().as_deref(), Some(&42));
/// ```
pub struct Container {
    registry: Arc<FactoryRegistry>,
    child_registries: Vec<Arc<FactoryRegistry>>,
    parent: Option<Arc<Container>>,
    seed: SeedBag,
    resources: InstanceRegistry,
    scoped_factories: Mutex<Vec<(TypeKey, TypeFactory)>>,
    entered: Mutex<usize>,
}

impl Container {
    /// Build a container over `registry`, handing `child_registries` to
    /// children created on descent.
    pub fn new(
        registry: Arc<FactoryRegistry>,
        child_registries: Vec<Arc<FactoryRegistry>>,
        parent: Option<Arc<Container>>,
        seed: SeedBag,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            child_registries,
            parent,
            seed,
            resources: InstanceRegistry::new(),
            scoped_factories: Mutex::new(Vec::new()),
            entered: Mutex::new(0),
        })
    }

    pub fn lifetime(&self) -> Lifetime {
        self.registry.lifetime()
    }

    /// The registry serving this container's own lifetime.
    pub fn registry(&self) -> &Arc<FactoryRegistry> {
        &self.registry
    }

    pub fn parent(&self) -> Option<&Arc<Container>> {
        self.parent.as_ref()
    }

    /// Registry for a strictly deeper lifetime still held by this
    /// container.
    pub fn child_registry(&self, lifetime: Lifetime) -> Option<Arc<FactoryRegistry>> {
        self.child_registries
            .iter()
            .find(|r| r.lifetime() == lifetime)
            .cloned()
    }

    /// Typed resolution.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.get_key(&TypeKey::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Key-level resolution: cached instance, own factory, then parent
    /// chain.
    pub fn get_key(&self, key: &TypeKey) -> Option<AnyInstance> {
        self.get_inner(key).0
    }

    fn get_inner(&self, key: &TypeKey) -> (Option<AnyInstance>, bool) {
        if let Some(res) = self.resources.get(key) {
            return (Some(res), true);
        }

        if let Some(factory) = self.registry.get_factory(key) {
            let res = factory.create(*key);
            if let Some(value) = &res {
                if factory.is_scoped() {
                    self.scoped_factories
                        .lock()
                        .unwrap()
                        .push((*key, factory.clone()));
                }
                if factory.is_cached() {
                    self.resources.add(*key, value.clone());
                }
            }
            return (res, factory.is_cached());
        }

        match &self.parent {
            Some(parent) => {
                let (res, cached) = parent.get_inner(key);
                if cached {
                    if let Some(value) = &res {
                        self.resources.add(*key, value.clone());
                    }
                }
                (res, cached)
            }
            None => (None, false),
        }
    }

    /// Enter this container's scope, entering ancestors first. The scope
    /// is re-entrant; the last guard to drop finalises scoped factories in
    /// LIFO order and clears the cache.
    pub fn scope(self: &Arc<Self>) -> ContainerScope {
        let parent_scope = self.parent.as_ref().map(|p| Box::new(p.scope()));
        {
            let mut entered = self.entered.lock().unwrap();
            if *entered == 0 {
                tracing::debug!(lifetime = %self.lifetime(), "container scope enter");
                let any_self: AnyInstance = self.clone();
                self.resources.add(TypeKey::of::<Container>(), any_self);
                for (key, value) in &self.seed {
                    self.resources.add(*key, value.clone());
                }
            }
            *entered += 1;
        }
        ContainerScope {
            container: self.clone(),
            _parent: parent_scope,
        }
    }

    fn exit_scope(&self) {
        tracing::debug!(lifetime = %self.lifetime(), "container scope exit");
        let mut scoped = self.scoped_factories.lock().unwrap();
        while let Some((key, factory)) = scoped.pop() {
            if let Some(value) = self.resources.get(&key) {
                factory.destroy(&value);
            }
        }
        self.resources.clear();
    }

    /// Descend the ladder towards `target`, or through all autocreated
    /// rungs when no target is given. A target at or above this
    /// container's own rung returns the container itself.
    pub fn descend(
        self: &Arc<Self>,
        seed: SeedBag,
        target: Option<Lifetime>,
    ) -> Result<Arc<Container>, ContainerError> {
        if let Some(target) = target {
            if target <= self.lifetime() {
                return Ok(self.clone());
            }
        }
        if self.child_registries.is_empty() {
            return Ok(self.clone());
        }

        let mut child = Self::child_of(self.clone(), seed.clone());
        match target {
            None => {
                while child.lifetime().autocreate() && !child.child_registries.is_empty() {
                    child = Self::child_of(child, seed.clone());
                }
            }
            Some(target) => {
                while child.lifetime() < target {
                    if child.child_registries.is_empty() {
                        return Err(ContainerError::NoSuchChildLifetime {
                            target,
                            current: self.lifetime(),
                        });
                    }
                    child = Self::child_of(child, seed.clone());
                }
            }
        }
        tracing::debug!(from = %self.lifetime(), to = %child.lifetime(), "container descend");
        Ok(child)
    }

    fn child_of(parent: Arc<Container>, seed: SeedBag) -> Arc<Container> {
        let registry = parent.child_registries[0].clone();
        let rest = parent.child_registries[1..].to_vec();
        Container::new(registry, rest, Some(parent), seed)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Container<{}>", self.lifetime())
    }
}

/// RAII guard over an entered container scope.
pub struct ContainerScope {
    container: Arc<Container>,
    _parent: Option<Box<ContainerScope>>,
}

impl ContainerScope {
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }
}

impl std::ops::Deref for ContainerScope {
    type Target = Container;

    fn deref(&self) -> &Container {
        &self.container
    }
}

impl Drop for ContainerScope {
    fn drop(&mut self) {
        let mut entered = self.container.entered.lock().unwrap();
        *entered -= 1;
        if *entered == 0 {
            drop(entered);
            self.container.exit_scope();
        }
        // _parent drops afterwards: children always exit before ancestors
    }
}

/// Build a fresh container ladder with one empty registry per lifetime,
/// descending to `target` (or to the first non-autocreate rung when no
/// target is given).
pub fn make_container(seed: SeedBag, target: Option<Lifetime>) -> Arc<Container> {
    let mut registries: Vec<_> = Lifetime::all()
        .map(|l| Arc::new(FactoryRegistry::new(l)))
        .collect();
    let rest = registries.split_off(1);
    let root = Container::new(registries.pop().unwrap(), rest, None, seed.clone());

    let mut container = root;
    match target {
        None => {
            while container.lifetime().autocreate() && !container.child_registries.is_empty() {
                container = Container::child_of(container, seed.clone());
            }
        }
        Some(target) => {
            while container.lifetime() < target {
                container = Container::child_of(container, seed.clone());
            }
        }
    }
    container
}
