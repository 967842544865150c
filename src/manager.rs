//! The resource manager: provider resolution and operator binding.
//!
//! Holds a dependency graph whose nodes are producible keys contributed by
//! service members. Resolution walks the graph, injects dependency
//! providers into member factories, caches resolved providers, and binds
//! them to operators through resource mappers torn down in LIFO order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::container::Container;
use crate::controller::{Controller, OperatorMember};
use crate::error::ResourceError;
use crate::factory::{AnyInstance, TypeFactory};
use crate::key::{ProviderKind, TypeKey};
use crate::operators::AnyOperator;
use crate::providers::{AnyProvider, ScopedResource, TypedFactory, TypedForward, TypedMut, TypedShared};
use crate::registry::KeyedRegistry;
use crate::service::{ProvideMember, Service};

/// Resolved dependency providers handed to a member factory.
pub struct Deps {
    entries: HashMap<TypeKey, AnyProvider>,
}

impl Deps {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: TypeKey, provider: AnyProvider) {
        self.entries.insert(key, provider);
    }

    pub fn get(&self, key: &TypeKey) -> Option<AnyProvider> {
        self.entries.get(key).cloned()
    }

    pub fn shared<T: Send + 'static>(&self) -> Option<TypedShared<T>> {
        self.get(&TypeKey::shared::<T>())?.as_shared()
    }

    pub fn mutable<T: Send + 'static>(&self) -> Option<TypedMut<T>> {
        self.get(&TypeKey::mutable::<T>())?.as_mut()
    }

    pub fn factory<T: Send + 'static>(&self) -> Option<TypedFactory<T>> {
        self.get(&TypeKey::factory::<T>())?.as_factory()
    }

    pub fn forward<T: Send + 'static>(&self) -> Option<TypedForward<T>> {
        self.get(&TypeKey::forward::<T>())?.as_forward()
    }
}

/// What a provide member hands back to the manager.
pub enum MemberOutput {
    /// A ready provider instance.
    Provider(AnyProvider),
    /// An init/fini pair to wrap in the gen box matching the declared
    /// contract.
    Scoped(ScopedResource),
    /// Dependencies were not sufficient to produce anything.
    Missing,
}

/// Maps a provider's init method onto an operator's `accept` and its fini
/// method onto `revoke`.
pub(crate) struct ResourceMapper {
    provider: AnyProvider,
    operator: AnyOperator,
}

impl ResourceMapper {
    fn setup(&self) -> Result<bool, String> {
        let resource = self.provider.init()?;
        Ok(self.operator.accept_any(resource))
    }

    fn teardown(&self) -> Result<bool, String> {
        match self.operator.revoke_any() {
            Some(resource) => {
                self.provider.fini(resource);
                Ok(true)
            }
            None => Err(format!(
                "could not revoke resource \"{}\"",
                self.operator.resource()
            )),
        }
    }
}

/// Dependency graph plus provider cache and bound operators.
pub struct ResourceManager {
    services: Mutex<Vec<Arc<dyn Service>>>,
    controllers: Mutex<Vec<Arc<dyn Controller>>>,
    nodes: Mutex<HashMap<TypeKey, ProvideMember>>,
    deps: Mutex<HashSet<TypeKey>>,
    operator_members: Mutex<Vec<OperatorMember>>,
    cached_providers: Mutex<HashMap<TypeKey, AnyProvider>>,
    provided: Mutex<Vec<(AnyOperator, ResourceMapper)>>,
    public_operators: Mutex<Vec<AnyOperator>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(Vec::new()),
            controllers: Mutex::new(Vec::new()),
            nodes: Mutex::new(HashMap::new()),
            deps: Mutex::new(HashSet::new()),
            operator_members: Mutex::new(Vec::new()),
            cached_providers: Mutex::new(HashMap::new()),
            provided: Mutex::new(Vec::new()),
            public_operators: Mutex::new(Vec::new()),
        }
    }

    /// Register a service's producing members as graph nodes. Parameter
    /// keys not produced locally are recorded as external dependencies.
    pub fn add_service(&self, service: Arc<dyn Service>) -> bool {
        {
            let mut services = self.services.lock().unwrap();
            if services.iter().any(|s| Arc::ptr_eq(s, &service)) {
                return false;
            }
            services.push(service.clone());
        }
        let members = service.provide_members();
        let mut nodes = self.nodes.lock().unwrap();
        let mut deps = self.deps.lock().unwrap();
        for member in members {
            if nodes.contains_key(&member.producible()) {
                continue;
            }
            for param in member.params() {
                if !nodes.contains_key(param) {
                    deps.insert(*param);
                }
            }
            nodes.insert(member.producible(), member);
        }
        true
    }

    pub fn remove_service(&self, service: &Arc<dyn Service>) -> bool {
        {
            let mut services = self.services.lock().unwrap();
            let Some(pos) = services.iter().position(|s| Arc::ptr_eq(s, service)) else {
                return false;
            };
            services.remove(pos);
        }
        let members = service.clone().provide_members();
        let mut nodes = self.nodes.lock().unwrap();
        let mut deps = self.deps.lock().unwrap();
        for member in members {
            if nodes.remove(&member.producible()).is_some() {
                for param in member.params() {
                    deps.remove(param);
                }
            }
        }
        true
    }

    /// Register a controller's consuming members.
    pub fn add_controller(&self, controller: Arc<dyn Controller>) -> bool {
        {
            let mut controllers = self.controllers.lock().unwrap();
            if controllers.iter().any(|c| Arc::ptr_eq(c, &controller)) {
                return false;
            }
            controllers.push(controller.clone());
        }
        let members = controller.operator_members();
        self.operator_members.lock().unwrap().extend(members);
        true
    }

    pub fn remove_controller(&self, controller: &Arc<dyn Controller>) -> bool {
        let mut controllers = self.controllers.lock().unwrap();
        let Some(pos) = controllers.iter().position(|c| Arc::ptr_eq(c, controller)) else {
            return false;
        };
        let removed = controllers.remove(pos);
        let members = removed.operator_members();
        let mut table = self.operator_members.lock().unwrap();
        for member in members {
            if let Some(pos) = table.iter().position(|m| m.resource() == member.resource()) {
                table.remove(pos);
            }
        }
        true
    }

    /// Operators that could not be satisfied locally, exported for the
    /// enclosing module to bind.
    pub fn public_operators(&self) -> Vec<AnyOperator> {
        self.public_operators.lock().unwrap().clone()
    }

    /// Public operators consuming `key`'s resource.
    pub fn public_operators_for(&self, key: &TypeKey) -> Vec<AnyOperator> {
        self.public_operators
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.resource().resource() == key.resource())
            .cloned()
            .collect()
    }

    /// Resolve a provider for `key`: cache first, then the external
    /// selector, then the graph (resolving each dependency recursively and
    /// short-circuiting on the first missing one).
    pub fn find_provider(
        &self,
        key: &TypeKey,
        selector: Option<&KeyedRegistry<AnyProvider>>,
    ) -> Result<AnyProvider, ResourceError> {
        if let Some(provider) = self.cached_providers.lock().unwrap().get(key) {
            return Ok(provider.clone());
        }
        if let Some(selector) = selector {
            if let Some(provider) = selector.get(key) {
                return Ok(provider);
            }
        }

        let member = self
            .nodes
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ResourceError::NoSuchResource(key.to_string()))?;

        let mut deps = Deps::new();
        for param in member.params() {
            let provider = self
                .find_provider(param, selector)
                .map_err(|_| ResourceError::NoSuchDependency(param.to_string()))?;
            deps.insert(*param, provider);
        }

        let provider = match member
            .invoke(&deps)
            .map_err(ResourceError::Provision)?
        {
            MemberOutput::Provider(provider) => provider,
            MemberOutput::Scoped(scoped) => {
                let kind = key.kind().unwrap_or(ProviderKind::Factory);
                scoped.into_provider(kind, key.short_name())
            }
            MemberOutput::Missing => {
                return Err(ResourceError::NoSuchResource(key.to_string()));
            }
        };

        if provider.kind() != ProviderKind::Forward {
            self.cached_providers
                .lock()
                .unwrap()
                .insert(*key, provider.clone());
        }
        tracing::debug!(key = %key, kind = ?provider.kind(), "provider resolved");
        Ok(provider)
    }

    /// Bind `operator` to a provider.
    ///
    /// When the operator consumes a provider type directly, that key is
    /// used as-is; otherwise candidate wrappers are probed in the order
    /// Shared, Forward, Factory, Mut and the first present one wins.
    pub fn setup_operator(
        &self,
        operator: AnyOperator,
        selector: Option<&KeyedRegistry<AnyProvider>>,
    ) -> Result<bool, ResourceError> {
        {
            let provided = self.provided.lock().unwrap();
            if provided.iter().any(|(op, _)| op.same_operator(&operator)) {
                return Ok(false);
            }
        }

        let res_key = operator.resource();
        let prov_key = if res_key.kind().is_some() {
            res_key
        } else {
            let candidates = [
                res_key.with_kind(ProviderKind::Shared),
                res_key.with_kind(ProviderKind::Forward),
                res_key.with_kind(ProviderKind::Factory),
                res_key.with_kind(ProviderKind::Mut),
            ];
            candidates
                .into_iter()
                .find(|k| self.key_is_present(k, selector))
                .ok_or_else(|| ResourceError::NoSuchResource(res_key.to_string()))?
        };

        let provider = self.find_provider(&prov_key, selector)?;
        let mapper = ResourceMapper {
            provider,
            operator: operator.clone(),
        };
        mapper.setup().map_err(ResourceError::Provision)?;
        tracing::debug!(resource = %res_key, "operator bound");
        self.provided.lock().unwrap().push((operator, mapper));
        Ok(true)
    }

    fn key_is_present(&self, key: &TypeKey, selector: Option<&KeyedRegistry<AnyProvider>>) -> bool {
        self.nodes.lock().unwrap().contains_key(key)
            || self.cached_providers.lock().unwrap().contains_key(key)
            || selector.map(|s| s.has(key)).unwrap_or(false)
    }

    /// Unbind one operator, returning its resource to the provider.
    pub fn teardown_operator(&self, operator: &AnyOperator) -> Result<bool, ResourceError> {
        let mapper = {
            let mut provided = self.provided.lock().unwrap();
            match provided.iter().position(|(op, _)| op.same_operator(operator)) {
                Some(pos) => provided.remove(pos),
                None => return Ok(false),
            }
        };
        mapper
            .1
            .teardown()
            .map(|_| true)
            .map_err(ResourceError::Provision)
    }

    /// Resolve every registered operator member. Members whose resource
    /// cannot be satisfied locally become public operators for the
    /// enclosing module; any other failure aborts.
    pub fn setup(&self, selector: Option<&KeyedRegistry<AnyProvider>>) -> Result<(), ResourceError> {
        let members: Vec<_> = self.operator_members.lock().unwrap().clone();
        for member in members {
            let operator = member
                .invoke()
                .map_err(|e| ResourceError::Provision(e.to_string()))?;
            match self.setup_operator(operator.clone(), selector) {
                Ok(_) => {}
                Err(ResourceError::NoSuchResource(_)) => {
                    self.public_operators.lock().unwrap().push(operator);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Unbind every mapper in LIFO order, then drop all internal state.
    /// The provided-resources map is empty afterwards.
    pub fn teardown(&self) -> Result<(), ResourceError> {
        loop {
            let entry = self.provided.lock().unwrap().pop();
            let Some((_, mapper)) = entry else {
                break;
            };
            mapper.teardown().map_err(ResourceError::Provision)?;
        }
        self.public_operators.lock().unwrap().clear();
        self.deps.lock().unwrap().clear();
        self.nodes.lock().unwrap().clear();
        self.cached_providers.lock().unwrap().clear();
        debug_assert!(self.provided.lock().unwrap().is_empty());
        Ok(())
    }

    /// Number of operators currently bound to providers.
    pub fn provided_len(&self) -> usize {
        self.provided.lock().unwrap().len()
    }

    /// Register every graph node as a factory in `container`'s registry at
    /// the member's declared lifetime. Parameters are then injected from
    /// the container instead of the graph.
    pub fn install_container(&self, container: &Arc<Container>) -> bool {
        let nodes: Vec<_> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .map(|(k, m)| (*k, m.clone()))
            .collect();

        let mut result = true;
        for (key, member) in nodes {
            let weak = Arc::downgrade(container);
            let m = member.clone();
            let factory = TypeFactory::from_erased_fn(move |_| {
                let container = weak.upgrade()?;
                let mut deps = Deps::new();
                for param in m.params() {
                    let instance = container.get_key(param)?;
                    let provider = instance.downcast::<AnyProvider>().ok()?;
                    deps.insert(*param, (*provider).clone());
                }
                match m.invoke(&deps).ok()? {
                    MemberOutput::Provider(provider) => {
                        Some(Arc::new(provider) as AnyInstance)
                    }
                    MemberOutput::Scoped(scoped) => {
                        let kind = m.producible().kind().unwrap_or(ProviderKind::Factory);
                        let provider = scoped.into_provider(kind, m.producible().short_name());
                        Some(Arc::new(provider) as AnyInstance)
                    }
                    MemberOutput::Missing => None,
                }
            })
            .cached(member.is_cached());

            let registry = container
                .child_registry(member.lifetime())
                .unwrap_or_else(|| container.registry().clone());
            result &= registry.add_factory(key, factory);
        }
        result
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
