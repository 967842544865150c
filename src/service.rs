//! Services: resource-producing lifecycle participants.
//!
//! A service declares the providers it can produce through a descriptor
//! table of [`ProvideMember`] records (the compile-time counterpart of
//! decorator-based member discovery) and moves through the state machine
//! `Idle -> Active(started=false) -> Active(started=true)` and back.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ServiceError;
use crate::key::TypeKey;
use crate::lifetime::Lifetime;
use crate::manager::{Deps, MemberOutput};
use crate::registry::InstanceRegistry;

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Active { started: bool },
}

/// A "please stop" signal for the blocking-thread domain.
pub struct SyncEvent {
    state: Mutex<bool>,
    cv: Condvar,
}

impl SyncEvent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn clear(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Wait until set or until `timeout` elapses; returns the final state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.cv.wait_timeout(guard, timeout).unwrap();
        *guard
    }
}

impl Default for SyncEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// A "please stop" signal for the cooperative task domain.
pub struct AsyncEvent {
    tx: watch::Sender<bool>,
}

impl AsyncEvent {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the event is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for AsyncEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// The stop waiter a service exposes: a blocking-thread event or a task
/// event, polled by the application's run loop.
#[derive(Clone)]
pub enum ServiceWaiter {
    Sync(Arc<SyncEvent>),
    Async(Arc<AsyncEvent>),
}

type MemberFactoryFn = Arc<dyn Fn(&Deps) -> Result<MemberOutput, String> + Send + Sync>;

/// Descriptor of one resource-producing member of a service.
///
/// Carries the producible (provider-wrapped) key, the lifetime its
/// instances are bound to, the cache flag, the producible keys of its
/// dependencies, and the factory bound to the service instance.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use modulith::{
///     AnyProvider, Lifetime, MemberOutput, ProvideMember, SharedRefBox, TypeKey,
/// };
///
/// let member = ProvideMember::new(
///     TypeKey::shared::<u32>(),
///     Lifetime::Component,
///     move |_deps| {
///         let bx = Arc::new(SharedRefBox::new(|| Some(7u32)));
///         Ok(MemberOutput::Provider(AnyProvider::from_shared(bx)))
///     },
/// );
/// assert_eq!(member.producible(), TypeKey::shared::<u32>());
/// ```
pub struct ProvideMember {
    producible: TypeKey,
    lifetime: Lifetime,
    cache: bool,
    params: Vec<TypeKey>,
    factory: MemberFactoryFn,
}

impl ProvideMember {
    pub fn new(
        producible: TypeKey,
        lifetime: Lifetime,
        factory: impl Fn(&Deps) -> Result<MemberOutput, String> + Send + Sync + 'static,
    ) -> Self {
        debug_assert!(
            producible.kind().is_some(),
            "provide members declare provider-wrapped keys"
        );
        Self {
            producible,
            lifetime,
            cache: true,
            params: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// Declare a dependency on another producible.
    pub fn param(mut self, key: TypeKey) -> Self {
        self.params.push(key);
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn producible(&self) -> TypeKey {
        self.producible
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn is_cached(&self) -> bool {
        self.cache
    }

    pub fn params(&self) -> &[TypeKey] {
        &self.params
    }

    pub(crate) fn invoke(&self, deps: &Deps) -> Result<MemberOutput, String> {
        (self.factory)(deps)
    }
}

impl Clone for ProvideMember {
    fn clone(&self) -> Self {
        Self {
            producible: self.producible,
            lifetime: self.lifetime,
            cache: self.cache,
            params: self.params.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl std::fmt::Debug for ProvideMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvideMember")
            .field("producible", &self.producible.to_string())
            .field("lifetime", &self.lifetime)
            .field("cache", &self.cache)
            .field("params", &self.params.iter().map(|p| p.to_string()).collect::<Vec<_>>())
            .finish()
    }
}

/// A resource-producing lifecycle participant.
///
/// Setup and teardown are idempotent: repeated calls in the same target
/// state return the current state unchanged. `start`/`stop` drive the
/// waiter protocol: starting clears the stop event, stopping sets it.
pub trait Service: Send + Sync + 'static {
    fn state(&self) -> ServiceState;

    fn waiter(&self) -> ServiceWaiter;

    /// Descriptor table of this service's resource-producing members.
    fn provide_members(self: Arc<Self>) -> Vec<ProvideMember> {
        Vec::new()
    }

    fn setup(&self, resources: &InstanceRegistry) -> Result<ServiceState, ServiceError>;

    fn teardown(&self, resources: &InstanceRegistry) -> Result<ServiceState, ServiceError>;

    fn start(&self);

    fn stop(&self);
}

/// State-machine core embedded by blocking-thread services.
///
/// # Examples
///
/// ```rust
/// use modulith::{
///     InstanceRegistry, Service, ServiceError, ServiceState, ServiceWaiter, SyncServiceCore,
/// };
///
/// struct Clock {
///     core: SyncServiceCore,
/// }
///
/// impl Service for Clock {
///     fn state(&self) -> ServiceState {
///         self.core.state()
///     }
///     fn waiter(&self) -> ServiceWaiter {
///         self.core.waiter()
///     }
///     fn setup(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
///         self.core.setup_transition()
///     }
///     fn teardown(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
///         self.core.teardown_transition()
///     }
///     fn start(&self) {
///         self.core.switch_started(true);
///     }
///     fn stop(&self) {
///         self.core.switch_started(false);
///     }
/// }
///
/// let clock = Clock { core: SyncServiceCore::new() };
/// let resources = InstanceRegistry::new();
/// assert_eq!(clock.setup(&resources).unwrap(), ServiceState::Active { started: false });
/// clock.start();
/// assert_eq!(clock.state(), ServiceState::Active { started: true });
/// ```
pub struct SyncServiceCore {
    state: Mutex<ServiceState>,
    waiter: Arc<SyncEvent>,
}

impl SyncServiceCore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::Idle),
            waiter: Arc::new(SyncEvent::new()),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap()
    }

    pub fn waiter(&self) -> ServiceWaiter {
        ServiceWaiter::Sync(self.waiter.clone())
    }

    /// `Idle -> Active(started=false)`; a no-op when already active.
    pub fn setup_transition(&self) -> Result<ServiceState, ServiceError> {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, ServiceState::Idle) {
            *state = ServiceState::Active { started: false };
        }
        Ok(*state)
    }

    /// `Active -> Idle`; a no-op when already idle.
    pub fn teardown_transition(&self) -> Result<ServiceState, ServiceError> {
        let mut state = self.state.lock().unwrap();
        *state = ServiceState::Idle;
        Ok(*state)
    }

    /// Flip the started flag; starting clears the stop event, stopping
    /// sets it.
    pub fn switch_started(&self, started: bool) {
        if started {
            self.waiter.clear();
        } else {
            self.waiter.set();
        }
        *self.state.lock().unwrap() = ServiceState::Active { started };
    }
}

impl Default for SyncServiceCore {
    fn default() -> Self {
        Self::new()
    }
}

/// State-machine core embedded by task-domain services; identical
/// transitions over a task-aware waiter.
pub struct AsyncServiceCore {
    state: Mutex<ServiceState>,
    waiter: Arc<AsyncEvent>,
}

impl AsyncServiceCore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::Idle),
            waiter: Arc::new(AsyncEvent::new()),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap()
    }

    pub fn waiter(&self) -> ServiceWaiter {
        ServiceWaiter::Async(self.waiter.clone())
    }

    pub fn setup_transition(&self) -> Result<ServiceState, ServiceError> {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, ServiceState::Idle) {
            *state = ServiceState::Active { started: false };
        }
        Ok(*state)
    }

    pub fn teardown_transition(&self) -> Result<ServiceState, ServiceError> {
        let mut state = self.state.lock().unwrap();
        *state = ServiceState::Idle;
        Ok(*state)
    }

    pub fn switch_started(&self, started: bool) {
        if started {
            self.waiter.clear();
        } else {
            self.waiter.set();
        }
        *self.state.lock().unwrap() = ServiceState::Active { started };
    }
}

impl Default for AsyncServiceCore {
    fn default() -> Self {
        Self::new()
    }
}
