//! Modules: compositions of components with cross-boundary provider and
//! resource claims.

use std::sync::{Arc, Mutex};

use crate::component::{Component, ModuleComponent};
use crate::config::{ComponentEntry, ModuleConf};
use crate::error::ModuleError;
use crate::factory::AnyInstance;
use crate::key::TypeKey;
use crate::manager::ResourceManager;
use crate::operators::AnyOperator;
use crate::providers::AnyProvider;
use crate::registry::{InstanceRegistry, KeyedRegistry};
use crate::service::Service;

enum ComponentHandle {
    Plain(Arc<Component>),
    Module(Arc<ModuleComponent>),
}

impl ComponentHandle {
    fn conf(&self) -> &crate::config::ComponentConf {
        match self {
            ComponentHandle::Plain(c) => c.conf(),
            ComponentHandle::Module(m) => m.component().conf(),
        }
    }

    fn create(&self) -> Result<(), crate::error::ComponentError> {
        match self {
            ComponentHandle::Plain(c) => c.create(),
            ComponentHandle::Module(m) => m.create(),
        }
    }

    fn setup(&self) -> Result<(), crate::error::ComponentError> {
        match self {
            ComponentHandle::Plain(c) => c.setup(),
            ComponentHandle::Module(m) => m.setup(),
        }
    }

    fn teardown(&self) -> Result<(), crate::error::ComponentError> {
        match self {
            ComponentHandle::Plain(c) => c.teardown(),
            ComponentHandle::Module(m) => m.teardown(),
        }
    }

    fn get_provider(&self, key: &TypeKey) -> Option<AnyProvider> {
        match self {
            ComponentHandle::Plain(c) => c.get_provider(key),
            ComponentHandle::Module(m) => m.get_provider(key),
        }
    }

    fn get_operators(&self, key: &TypeKey) -> Vec<AnyOperator> {
        match self {
            ComponentHandle::Plain(c) => c.get_operators(key),
            ComponentHandle::Module(m) => m.get_operators(key),
        }
    }

    fn add_resource(&self, key: TypeKey, resource: AnyInstance) -> bool {
        match self {
            ComponentHandle::Plain(c) => c.add_resource(key, resource),
            ComponentHandle::Module(m) => m.component().add_resource(key, resource),
        }
    }

    fn remove_resource(&self, key: &TypeKey) -> bool {
        match self {
            ComponentHandle::Plain(c) => c.remove_resource(key),
            ComponentHandle::Module(m) => m.component().remove_resource(key),
        }
    }

    fn services(&self) -> Vec<Arc<dyn Service>> {
        match self {
            ComponentHandle::Plain(c) => c.services(),
            ComponentHandle::Module(m) => m.services(),
        }
    }

    fn start(&self) {
        match self {
            ComponentHandle::Plain(c) => c.start(),
            ComponentHandle::Module(m) => m.start(),
        }
    }

    fn stop(&self) {
        match self {
            ComponentHandle::Plain(c) => c.stop(),
            ComponentHandle::Module(m) => m.stop(),
        }
    }
}

/// A composition of components (and optionally sub-modules) exposing
/// providers upward and accepting provider/resource grants from parents.
pub struct Module {
    path: String,
    conf: ModuleConf,
    rm: ResourceManager,
    operators: Mutex<Vec<AnyOperator>>,
    resources: InstanceRegistry,
    providers: KeyedRegistry<AnyProvider>,
    components: Vec<(String, ComponentHandle)>,
}

impl Module {
    /// Build the module and its component tree from a descriptor.
    /// Disabled entries are skipped.
    pub fn build(path: &str, conf: ModuleConf) -> Result<Arc<Self>, ModuleError> {
        let mut components = Vec::new();
        for (name, entry) in &conf.components {
            let child_path = format!("{path}.{name}");
            match entry {
                ComponentEntry::Component(cconf) => {
                    if !cconf.enabled {
                        tracing::warn!(path = %child_path, "component disabled, skipping");
                        continue;
                    }
                    components.push((
                        name.clone(),
                        ComponentHandle::Plain(Arc::new(Component::new(
                            name.clone(),
                            child_path,
                            cconf.clone(),
                        ))),
                    ));
                }
                ComponentEntry::Module(mconf) => {
                    if !mconf.component.enabled || !mconf.module.enabled {
                        tracing::warn!(path = %child_path, "module component disabled, skipping");
                        continue;
                    }
                    components.push((
                        name.clone(),
                        ComponentHandle::Module(Arc::new(ModuleComponent::new(
                            name.clone(),
                            child_path,
                            mconf.clone(),
                        )?)),
                    ));
                }
            }
        }
        Ok(Arc::new(Self {
            path: path.to_string(),
            conf,
            rm: ResourceManager::new(),
            operators: Mutex::new(Vec::new()),
            resources: InstanceRegistry::new(),
            providers: KeyedRegistry::new(),
            components,
        }))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn conf(&self) -> &ModuleConf {
        &self.conf
    }

    /// One of the providers this module declares as exposed upward.
    pub fn get_provider(&self, key: &TypeKey) -> Option<AnyProvider> {
        if self.conf.providers.contains(key) {
            return self.providers.get(key);
        }
        None
    }

    /// Grant a provider claimed from the parent; rejected when the key is
    /// not among this module's claims.
    pub fn add_provider(&self, key: TypeKey, provider: AnyProvider) -> bool {
        if self.conf.provider_claims.contains(&key) {
            return self.providers.add(key, provider);
        }
        false
    }

    pub fn remove_provider(&self, key: &TypeKey) -> bool {
        if self.conf.provider_claims.contains(key) {
            return self.providers.remove(key);
        }
        false
    }

    /// Grant a resource claimed from the parent.
    pub fn add_resource(&self, key: TypeKey, resource: AnyInstance) -> bool {
        if self.conf.resource_claims.contains(&key) {
            return self.resources.add(key, resource);
        }
        false
    }

    pub fn remove_resource(&self, key: &TypeKey) -> bool {
        if self.conf.resource_claims.contains(key) {
            return self.resources.remove(key);
        }
        false
    }

    /// Import an operator whose resource type this module declares.
    pub fn add_operator(&self, operator: AnyOperator) -> bool {
        let res = operator.resource().resource();
        if self.conf.operators.iter().any(|k| k.resource() == res) {
            self.operators.lock().unwrap().push(operator);
            return true;
        }
        false
    }

    pub fn remove_operator(&self, operator: &AnyOperator) -> bool {
        let mut operators = self.operators.lock().unwrap();
        match operators.iter().position(|op| op.same_operator(operator)) {
            Some(pos) => {
                operators.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Create pass over every component in declaration order.
    pub fn create(&self) -> Result<(), ModuleError> {
        tracing::info!(path = %self.path, "module create");
        for (_, handle) in &self.components {
            handle.create().map_err(|e| ModuleError::Component {
                path: self.path.clone(),
                details: e.to_string(),
            })?;
        }
        tracing::info!(path = %self.path, "module create successful");
        Ok(())
    }

    /// Setup pass: per component in order, seed claimed resources and
    /// sub-module grants, run its setup, bind its leftover operators
    /// against module-level providers, and collect its exported providers.
    /// Finally bind the module's own imported operators.
    pub fn setup(&self) -> Result<(), ModuleError> {
        tracing::info!(path = %self.path, "module setup");

        for (_, handle) in &self.components {
            let cconf = handle.conf();

            for res_key in &cconf.resources {
                if let Some(resource) = self.resources.get(res_key) {
                    handle.add_resource(*res_key, resource);
                }
            }

            if let ComponentHandle::Module(mc) = handle {
                self.grant_submodule_claims(mc)?;
            }

            handle.setup().map_err(|e| ModuleError::Component {
                path: self.path.clone(),
                details: e.to_string(),
            })?;

            for res_key in &cconf.operators {
                for op in handle.get_operators(res_key) {
                    self.rm
                        .setup_operator(op, Some(&self.providers))
                        .map_err(|e| ModuleError::Resource {
                            path: self.path.clone(),
                            details: e.to_string(),
                        })?;
                }
            }

            for prov_key in &cconf.providers {
                if let Some(provider) = handle.get_provider(prov_key) {
                    self.providers.add(*prov_key, provider);
                }
            }
        }

        let own_operators: Vec<_> = self.operators.lock().unwrap().clone();
        for op in own_operators {
            self.rm
                .setup_operator(op, Some(&self.providers))
                .map_err(|e| ModuleError::Resource {
                    path: self.path.clone(),
                    details: e.to_string(),
                })?;
        }

        tracing::info!(path = %self.path, "module setup successful");
        Ok(())
    }

    fn grant_submodule_claims(&self, mc: &ModuleComponent) -> Result<(), ModuleError> {
        let sub = mc.module();
        for claim in &sub.conf.provider_claims {
            let provider =
                self.providers
                    .get(claim)
                    .ok_or_else(|| ModuleError::NoProvFoundForPattern {
                        path: self.path.clone(),
                        claim: claim.to_string(),
                    })?;
            if !sub.add_provider(*claim, provider) {
                return Err(ModuleError::ProvPolicyViolation {
                    path: self.path.clone(),
                    claim: claim.to_string(),
                });
            }
        }
        for claim in &sub.conf.resource_claims {
            if let Some(resource) = self.resources.get(claim) {
                sub.add_resource(*claim, resource);
            }
        }
        Ok(())
    }

    /// Teardown pass in reverse order; failures are suppressed and the
    /// first one is reported at the end.
    pub fn teardown(&self) -> Result<(), ModuleError> {
        tracing::info!(path = %self.path, "module teardown");
        let mut first: Option<ModuleError> = None;

        let own_operators: Vec<_> = self.operators.lock().unwrap().clone();
        for op in own_operators.iter().rev() {
            if let Err(e) = self.rm.teardown_operator(op) {
                record(&mut first, self.resource_error(e.to_string()));
            }
        }

        for (_, handle) in self.components.iter().rev() {
            let cconf = handle.conf();

            for prov_key in cconf.providers.iter().rev() {
                self.providers.remove(prov_key);
            }
            for res_key in cconf.operators.iter().rev() {
                for op in handle.get_operators(res_key) {
                    if let Err(e) = self.rm.teardown_operator(&op) {
                        record(&mut first, self.resource_error(e.to_string()));
                    }
                }
            }

            if let Err(e) = handle.teardown() {
                record(
                    &mut first,
                    ModuleError::Component {
                        path: self.path.clone(),
                        details: e.to_string(),
                    },
                );
            }

            for res_key in cconf.resources.iter().rev() {
                if self.resources.has(res_key) {
                    handle.remove_resource(res_key);
                }
            }
        }

        if let Err(e) = self.rm.teardown() {
            record(&mut first, self.resource_error(e.to_string()));
        }

        match first {
            None => {
                tracing::info!(path = %self.path, "module teardown successful");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    pub fn start(&self) {
        for (_, handle) in &self.components {
            handle.start();
        }
    }

    pub fn stop(&self) {
        for (_, handle) in self.components.iter().rev() {
            handle.stop();
        }
    }

    /// Every service assembled under this module, sub-modules included.
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        let mut services = Vec::new();
        for (_, handle) in &self.components {
            services.extend(handle.services());
        }
        services
    }

    fn resource_error(&self, details: String) -> ModuleError {
        ModuleError::Resource {
            path: self.path.clone(),
            details,
        }
    }
}

fn record(first: &mut Option<ModuleError>, error: ModuleError) {
    tracing::warn!(error = %error, "module teardown step failed");
    if first.is_none() {
        *first = Some(error);
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Module<{}>", self.path)
    }
}
