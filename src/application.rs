//! The application facade: a root module plus the process runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ModuleConf;
use crate::error::AppError;
use crate::key::TypeKey;
use crate::module::Module;
use crate::providers::AnyProvider;
use crate::service::{Service, ServiceWaiter};

const WAITER_POLL: Duration = Duration::from_millis(100);

/// A root module driven through
/// `load -> setup -> start -> ... -> stop -> teardown -> unload`.
///
/// # Examples
///
/// ```rust
/// use modulith::{Application, ModuleConf};
///
/// let app = Application::new("demo");
/// app.load(ModuleConf::new()).unwrap();
/// app.setup().unwrap();
/// app.start().unwrap();
/// app.stop().unwrap();
/// app.teardown().unwrap();
/// app.unload().unwrap();
/// ```
pub struct Application {
    name: String,
    version: String,
    debug: bool,
    module: Mutex<Option<Arc<Module>>>,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            debug: false,
            module: Mutex::new(None),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Build the root module from its descriptor and run the create pass.
    pub fn load(&self, conf: ModuleConf) -> Result<(), AppError> {
        tracing::info!(app = %self.name, "application load");
        let module = Module::build(&self.name, conf)?;
        module.create()?;
        *self.module.lock().unwrap() = Some(module);
        tracing::info!(app = %self.name, "application load successful");
        Ok(())
    }

    /// Drop the root module; valid after teardown.
    pub fn unload(&self) -> Result<(), AppError> {
        let module = self.module.lock().unwrap().take();
        match module {
            Some(_) => {
                tracing::info!(app = %self.name, "application unloaded");
                Ok(())
            }
            None => Err(AppError::NotLoaded),
        }
    }

    pub fn setup(&self) -> Result<(), AppError> {
        Ok(self.module()?.setup()?)
    }

    pub fn teardown(&self) -> Result<(), AppError> {
        Ok(self.module()?.teardown()?)
    }

    pub fn start(&self) -> Result<(), AppError> {
        self.module()?.start();
        Ok(())
    }

    pub fn stop(&self) -> Result<(), AppError> {
        self.module()?.stop();
        Ok(())
    }

    /// A provider exposed by the root module.
    pub fn get_provider(&self, key: &TypeKey) -> Option<AnyProvider> {
        self.module.lock().unwrap().as_ref()?.get_provider(key)
    }

    fn module(&self) -> Result<Arc<Module>, AppError> {
        self.module
            .lock()
            .unwrap()
            .clone()
            .ok_or(AppError::NotLoaded)
    }

    fn waiters(&self) -> Result<Vec<ServiceWaiter>, AppError> {
        let services: Vec<Arc<dyn Service>> = self.module()?.services();
        Ok(services.iter().map(|s| s.waiter()).collect())
    }

    /// Block until every service waiter signals stop, polling at a fixed
    /// cadence.
    pub fn run_sync(&self) -> Result<(), AppError> {
        self.run_sync_with(|| {})
    }

    /// Like [`run_sync`](Self::run_sync), invoking `callback` between
    /// polls while at least one service still runs.
    pub fn run_sync_with(&self, mut callback: impl FnMut()) -> Result<(), AppError> {
        let waiters = self.waiters()?;
        tracing::info!(app = %self.name, "run loop started");
        loop {
            let mut all_set = true;
            for waiter in &waiters {
                let set = match waiter {
                    ServiceWaiter::Sync(event) => event.wait_timeout(WAITER_POLL),
                    ServiceWaiter::Async(event) => event.is_set(),
                };
                all_set &= set;
            }
            if all_set {
                break;
            }
            callback();
        }
        tracing::info!(app = %self.name, "run loop stopped");
        Ok(())
    }

    /// Async variant of [`run_sync`](Self::run_sync).
    pub async fn run_async(&self) -> Result<(), AppError> {
        let waiters = self.waiters()?;
        tracing::info!(app = %self.name, "run loop started");
        loop {
            let all_set = waiters.iter().all(|waiter| match waiter {
                ServiceWaiter::Sync(event) => event.is_set(),
                ServiceWaiter::Async(event) => event.is_set(),
            });
            if all_set {
                break;
            }
            tokio::time::sleep(WAITER_POLL).await;
        }
        tracing::info!(app = %self.name, "run loop stopped");
        Ok(())
    }
}
