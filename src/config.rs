//! Configuration descriptors driving the assembler.
//!
//! Descriptors are code-first: the assembler loads them once at boot and
//! instantiates services and controllers through the factory maps they
//! carry. File parsing and dynamic loading live outside the core.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::container::Container;
use crate::controller::Controller;
use crate::error::{ControllerError, ServiceError};
use crate::factory::AnyInstance;
use crate::key::TypeKey;
use crate::registry::InstanceRegistry;
use crate::service::Service;

/// Named arguments passed to service and controller factories.
#[derive(Clone, Default)]
pub struct Args {
    map: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Send + Sync + 'static>(mut self, name: impl Into<String>, value: T) -> Self {
        self.map.insert(name.into(), Arc::new(value));
        self
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<T> {
        self.map
            .get(name)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }
}

/// Context handed to factories during the create pass: the declared name
/// and args, previously created sibling services, and any container-bound
/// dependencies.
pub struct CreateCtx<'a> {
    pub(crate) name: &'a str,
    pub(crate) args: &'a Args,
    pub(crate) siblings: &'a InstanceRegistry,
    pub(crate) container: Option<&'a Arc<Container>>,
}

impl CreateCtx<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// Argument from the descriptor's arg map.
    pub fn arg<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<T> {
        self.args.get(name)
    }

    /// A sibling service created earlier in this component's create pass.
    pub fn service<S: Service>(&self) -> Option<Arc<S>> {
        self.siblings.get_value::<S>()
    }

    /// A container-provided dependency whose type matches.
    pub fn dependency<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.container.and_then(|c| c.get::<T>())
    }
}

/// A service instance returned by a factory, paired with its concrete type
/// identity so later siblings can inject it.
pub struct CreatedService {
    pub(crate) service: Arc<dyn Service>,
    pub(crate) key: TypeKey,
    pub(crate) as_any: AnyInstance,
}

/// Wrap a concrete service for return from a service factory.
pub fn created_service<S: Service>(service: Arc<S>) -> CreatedService {
    CreatedService {
        service: service.clone(),
        key: TypeKey::of::<S>(),
        as_any: service,
    }
}

pub type ServiceFactoryFn =
    Arc<dyn Fn(&CreateCtx) -> Result<CreatedService, ServiceError> + Send + Sync>;
pub type ControllerFactoryFn =
    Arc<dyn Fn(&CreateCtx) -> Result<Arc<dyn Controller>, ControllerError> + Send + Sync>;

/// Descriptor of one controller inside a component.
#[derive(Clone)]
pub struct CtrlConf {
    pub(crate) type_key: TypeKey,
    pub(crate) name: String,
    pub(crate) args: Args,
    pub(crate) operators: Vec<TypeKey>,
}

impl CtrlConf {
    pub fn new<C: Controller>() -> Self {
        let type_key = TypeKey::of::<C>();
        Self {
            type_key,
            name: type_key.short_name().to_string(),
            args: Args::new(),
            operators: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    /// Resource type this controller imports through an operator.
    pub fn operator(mut self, key: TypeKey) -> Self {
        self.operators.push(key);
        self
    }
}

/// Descriptor of one service inside a component.
#[derive(Clone)]
pub struct SvcConf {
    pub(crate) type_key: TypeKey,
    pub(crate) name: String,
    pub(crate) args: Args,
    pub(crate) providers: Vec<TypeKey>,
}

impl SvcConf {
    pub fn new<S: Service>() -> Self {
        let type_key = TypeKey::of::<S>();
        Self {
            type_key,
            name: type_key.short_name().to_string(),
            args: Args::new(),
            providers: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    /// Producible key this service is declared to provide.
    pub fn provides(mut self, key: TypeKey) -> Self {
        self.providers.push(key);
        self
    }
}

/// Descriptor of a component: its parts, its imports and exports, and the
/// factory maps used by the create pass.
#[derive(Clone, Default)]
pub struct ComponentConf {
    pub(crate) enabled: bool,
    pub(crate) resources: Vec<TypeKey>,
    pub(crate) operators: Vec<TypeKey>,
    pub(crate) providers: Vec<TypeKey>,
    pub(crate) controllers: Vec<CtrlConf>,
    pub(crate) services: Vec<SvcConf>,
    pub(crate) controller_factories: HashMap<TypeKey, ControllerFactoryFn>,
    pub(crate) service_factories: HashMap<TypeKey, ServiceFactoryFn>,
}

impl ComponentConf {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Resource type claimed from the enclosing module.
    pub fn resource(mut self, key: TypeKey) -> Self {
        self.resources.push(key);
        self
    }

    /// Resource type whose unsatisfied operators the module should bind.
    pub fn operator(mut self, key: TypeKey) -> Self {
        self.operators.push(key);
        self
    }

    /// Producible key exported upward to the enclosing module.
    pub fn provider(mut self, key: TypeKey) -> Self {
        self.providers.push(key);
        self
    }

    pub fn controller(mut self, conf: CtrlConf) -> Self {
        self.controllers.push(conf);
        self
    }

    pub fn service(mut self, conf: SvcConf) -> Self {
        self.services.push(conf);
        self
    }

    pub fn controller_factory<C: Controller>(
        mut self,
        factory: impl Fn(&CreateCtx) -> Result<Arc<dyn Controller>, ControllerError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.controller_factories
            .insert(TypeKey::of::<C>(), Arc::new(factory));
        self
    }

    pub fn service_factory<S: Service>(
        mut self,
        factory: impl Fn(&CreateCtx) -> Result<CreatedService, ServiceError> + Send + Sync + 'static,
    ) -> Self {
        self.service_factories
            .insert(TypeKey::of::<S>(), Arc::new(factory));
        self
    }
}

/// One entry of a module's component map.
#[derive(Clone)]
pub enum ComponentEntry {
    Component(ComponentConf),
    Module(ModuleComponentConf),
}

/// Descriptor of a component wrapping a whole sub-module.
#[derive(Clone)]
pub struct ModuleComponentConf {
    pub(crate) component: ComponentConf,
    pub(crate) module: ModuleConf,
}

impl ModuleComponentConf {
    pub fn new(component: ComponentConf, module: ModuleConf) -> Self {
        Self { component, module }
    }
}

/// Descriptor of a module: exported and claimed producibles, imported
/// resource types, and the named components composing it.
#[derive(Clone, Default)]
pub struct ModuleConf {
    pub(crate) enabled: bool,
    pub(crate) providers: Vec<TypeKey>,
    pub(crate) provider_claims: Vec<TypeKey>,
    pub(crate) operators: Vec<TypeKey>,
    pub(crate) resource_claims: Vec<TypeKey>,
    pub(crate) components: Vec<(String, ComponentEntry)>,
}

impl ModuleConf {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Producible key exposed upward to the parent module.
    pub fn provider(mut self, key: TypeKey) -> Self {
        self.providers.push(key);
        self
    }

    /// Producible key required from the parent module.
    pub fn provider_claim(mut self, key: TypeKey) -> Self {
        self.provider_claims.push(key);
        self
    }

    /// Resource type this module's operators import.
    pub fn operator(mut self, key: TypeKey) -> Self {
        self.operators.push(key);
        self
    }

    /// Resource type required from the parent module.
    pub fn resource_claim(mut self, key: TypeKey) -> Self {
        self.resource_claims.push(key);
        self
    }

    pub fn component(mut self, name: impl Into<String>, conf: ComponentConf) -> Self {
        self.components
            .push((name.into(), ComponentEntry::Component(conf)));
        self
    }

    pub fn module_component(mut self, name: impl Into<String>, conf: ModuleComponentConf) -> Self {
        self.components
            .push((name.into(), ComponentEntry::Module(conf)));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_round_trip_typed_values() {
        let args = Args::new().set("port", 8080u16).set("host", "db".to_string());
        assert_eq!(args.get::<u16>("port"), Some(8080));
        assert_eq!(args.get::<String>("host").as_deref(), Some("db"));
        assert_eq!(args.get::<u16>("missing"), None);
        // wrong type reads as absent
        assert_eq!(args.get::<u32>("port"), None);
    }
}
