//! Components: named aggregations of services and controllers with their
//! own resource scope.

use std::sync::{Arc, Mutex};

use crate::config::{ComponentConf, CreateCtx, ModuleComponentConf};
use crate::container::Container;
use crate::controller::Controller;
use crate::error::{ComponentError, ModuleError};
use crate::factory::AnyInstance;
use crate::key::TypeKey;
use crate::manager::ResourceManager;
use crate::module::Module;
use crate::operators::AnyOperator;
use crate::providers::AnyProvider;
use crate::registry::{InstanceRegistry, KeyedRegistry};
use crate::service::Service;

/// A named, independently-lifecycled group of services and controllers.
///
/// The create pass instantiates the declared parts through the descriptor's
/// factory maps and registers their members with the component's resource
/// manager; the setup pass binds operators, then activates controllers and
/// services in declaration order; teardown reverses, suppressing individual
/// failures and reporting the first one at the end.
pub struct Component {
    name: String,
    path: String,
    conf: ComponentConf,
    rm: ResourceManager,
    controllers: Mutex<Vec<Arc<dyn Controller>>>,
    services: Mutex<Vec<Arc<dyn Service>>>,
    resources: InstanceRegistry,
    providers: KeyedRegistry<AnyProvider>,
    container: Mutex<Option<Arc<Container>>>,
}

impl Component {
    pub fn new(name: impl Into<String>, path: impl Into<String>, conf: ComponentConf) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            conf,
            rm: ResourceManager::new(),
            controllers: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
            resources: InstanceRegistry::new(),
            providers: KeyedRegistry::new(),
            container: Mutex::new(None),
        }
    }

    /// Bind a container to this component: the producing members become
    /// factories in the container's registries at their declared
    /// lifetimes, and later create passes may inject container-provided
    /// dependencies.
    pub fn install_container(&self, container: &Arc<Container>) -> bool {
        *self.container.lock().unwrap() = Some(container.clone());
        self.rm.install_container(container)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn conf(&self) -> &ComponentConf {
        &self.conf
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.rm
    }

    /// Resolve one of this component's providers, consulting both the
    /// member graph and externally granted providers.
    pub fn get_provider(&self, key: &TypeKey) -> Option<AnyProvider> {
        self.rm.find_provider(key, Some(&self.providers)).ok()
    }

    pub fn add_provider(&self, key: TypeKey, provider: AnyProvider) -> bool {
        self.providers.add(key, provider)
    }

    pub fn remove_provider(&self, key: &TypeKey) -> bool {
        self.providers.remove(key)
    }

    pub fn add_resource(&self, key: TypeKey, resource: AnyInstance) -> bool {
        self.resources.add(key, resource)
    }

    pub fn remove_resource(&self, key: &TypeKey) -> bool {
        self.resources.remove(key)
    }

    /// Operators this component could not satisfy locally, for the
    /// enclosing module to bind.
    pub fn get_operators(&self, key: &TypeKey) -> Vec<AnyOperator> {
        self.rm.public_operators_for(key)
    }

    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.services.lock().unwrap().clone()
    }

    /// Instantiate the declared services and controllers and register
    /// their members.
    pub fn create(&self) -> Result<(), ComponentError> {
        tracing::info!(path = %self.path, name = %self.name, "component create");
        let created = InstanceRegistry::new();
        let container = self.container.lock().unwrap().clone();

        for svc_conf in &self.conf.services {
            let factory = self
                .conf
                .service_factories
                .get(&svc_conf.type_key)
                .ok_or_else(|| {
                    self.service_error(format!(
                        "service factory not found: \"{}\"",
                        svc_conf.type_key
                    ))
                })?;
            let ctx = CreateCtx {
                name: &svc_conf.name,
                args: &svc_conf.args,
                siblings: &created,
                container: container.as_ref(),
            };
            let svc = factory(&ctx).map_err(|e| self.service_error(e.to_string()))?;
            tracing::info!(path = %self.path, service = %svc_conf.name, "service created");
            created.add(svc.key, svc.as_any.clone());
            self.rm.add_service(svc.service.clone());
            self.services.lock().unwrap().push(svc.service);
        }

        for ctrl_conf in &self.conf.controllers {
            let factory = self
                .conf
                .controller_factories
                .get(&ctrl_conf.type_key)
                .ok_or_else(|| {
                    self.ctrl_error(format!(
                        "controller factory not found: \"{}\"",
                        ctrl_conf.type_key
                    ))
                })?;
            let ctx = CreateCtx {
                name: &ctrl_conf.name,
                args: &ctrl_conf.args,
                siblings: &created,
                container: container.as_ref(),
            };
            let ctrl = factory(&ctx).map_err(|e| self.ctrl_error(e.to_string()))?;
            tracing::info!(path = %self.path, controller = %ctrl_conf.name, "controller created");
            self.rm.add_controller(ctrl.clone());
            self.controllers.lock().unwrap().push(ctrl);
        }

        Ok(())
    }

    /// Bind operators, then activate controllers and services in
    /// declaration order.
    pub fn setup(&self) -> Result<(), ComponentError> {
        tracing::info!(path = %self.path, name = %self.name, "component setup");

        self.rm
            .setup(Some(&self.providers))
            .map_err(|e| self.resource_error(e.to_string()))?;

        for ctrl in self.controllers.lock().unwrap().iter() {
            ctrl.setup(&self.resources)
                .map_err(|e| self.ctrl_error(e.to_string()))?;
        }
        for svc in self.services.lock().unwrap().iter() {
            svc.setup(&self.resources)
                .map_err(|e| self.service_error(e.to_string()))?;
        }

        tracing::info!(path = %self.path, name = %self.name, "component setup successful");
        Ok(())
    }

    /// Reverse of [`setup`](Self::setup) plus part removal. Teardown
    /// failures never abort the chain; the first one is reported at the
    /// end.
    pub fn teardown(&self) -> Result<(), ComponentError> {
        tracing::info!(path = %self.path, name = %self.name, "component teardown");
        let mut first: Option<ComponentError> = None;

        for svc in self.services.lock().unwrap().iter().rev() {
            if let Err(e) = svc.teardown(&self.resources) {
                record(&mut first, self.service_error(e.to_string()));
            }
        }
        for ctrl in self.controllers.lock().unwrap().iter().rev() {
            if let Err(e) = ctrl.teardown(&self.resources) {
                record(&mut first, self.ctrl_error(e.to_string()));
            }
        }
        if let Err(e) = self.rm.teardown() {
            record(&mut first, self.resource_error(e.to_string()));
        }

        {
            let mut services = self.services.lock().unwrap();
            for svc in services.drain(..).rev().collect::<Vec<_>>() {
                self.rm.remove_service(&svc);
            }
        }
        {
            let mut controllers = self.controllers.lock().unwrap();
            for ctrl in controllers.drain(..).rev().collect::<Vec<_>>() {
                self.rm.remove_controller(&ctrl);
            }
        }

        match first {
            None => {
                tracing::info!(path = %self.path, name = %self.name, "component teardown successful");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    pub fn start(&self) {
        for svc in self.services.lock().unwrap().iter() {
            svc.start();
        }
    }

    pub fn stop(&self) {
        for svc in self.services.lock().unwrap().iter().rev() {
            svc.stop();
        }
    }

    fn resource_error(&self, details: String) -> ComponentError {
        ComponentError::Resource {
            path: self.path.clone(),
            name: self.name.clone(),
            details,
        }
    }

    fn ctrl_error(&self, details: String) -> ComponentError {
        ComponentError::Ctrl {
            path: self.path.clone(),
            name: self.name.clone(),
            details,
        }
    }

    fn service_error(&self, details: String) -> ComponentError {
        ComponentError::Service {
            path: self.path.clone(),
            name: self.name.clone(),
            details,
        }
    }
}

fn record(first: &mut Option<ComponentError>, error: ComponentError) {
    tracing::warn!(error = %error, "teardown step failed");
    if first.is_none() {
        *first = Some(error);
    }
}

/// A component wrapping a whole sub-module: lifecycle passes run the
/// component's own parts first, then propagate exported operators,
/// resources, and providers into the sub-module before running its pass.
pub struct ModuleComponent {
    inner: Component,
    module: Arc<Module>,
}

impl ModuleComponent {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        conf: ModuleComponentConf,
    ) -> Result<Self, ModuleError> {
        let name = name.into();
        let path = path.into();
        let module = Module::build(&path, conf.module)?;
        Ok(Self {
            inner: Component::new(name, path, conf.component),
            module,
        })
    }

    pub fn component(&self) -> &Component {
        &self.inner
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn create(&self) -> Result<(), ComponentError> {
        self.inner.create()?;
        self.module.create().map_err(|e| self.module_error(e))
    }

    pub fn setup(&self) -> Result<(), ComponentError> {
        self.inner.setup()?;

        for op in self.inner.rm.public_operators() {
            self.module.add_operator(op);
        }
        for (key, resource) in self.inner.resources.items() {
            self.module.add_resource(key, resource);
        }
        for (key, provider) in self.inner.providers.items() {
            self.module.add_provider(key, provider);
        }

        self.module.setup().map_err(|e| self.module_error(e))
    }

    pub fn teardown(&self) -> Result<(), ComponentError> {
        let mut first: Option<ComponentError> = None;
        if let Err(e) = self.module.teardown() {
            record(&mut first, self.module_error(e));
        }

        for (key, _) in self.inner.providers.items() {
            self.module.remove_provider(&key);
        }
        for (key, _) in self.inner.resources.items() {
            self.module.remove_resource(&key);
        }
        for op in self.inner.rm.public_operators() {
            self.module.remove_operator(&op);
        }

        if let Err(e) = self.inner.teardown() {
            record(&mut first, e);
        }
        match first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Providers exported by the sub-module take precedence over the
    /// component's own.
    pub fn get_provider(&self, key: &TypeKey) -> Option<AnyProvider> {
        self.module
            .get_provider(key)
            .or_else(|| self.inner.get_provider(key))
    }

    pub fn get_operators(&self, key: &TypeKey) -> Vec<AnyOperator> {
        self.inner.get_operators(key)
    }

    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        let mut services = self.inner.services();
        services.extend(self.module.services());
        services
    }

    pub fn start(&self) {
        self.inner.start();
        self.module.start();
    }

    pub fn stop(&self) {
        self.module.stop();
        self.inner.stop();
    }

    fn module_error(&self, e: ModuleError) -> ComponentError {
        ComponentError::Module {
            path: self.inner.path.clone(),
            name: self.inner.name.clone(),
            details: e.to_string(),
        }
    }
}
