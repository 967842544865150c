//! # modulith
//!
//! A modular application runtime: a lifetime-scoped dependency container
//! with ownership-aware resource providers and a declarative wiring engine
//! assembling controllers, services, components and modules into a running
//! process.
//!
//! ## Features
//!
//! - **Ownership-typed providers**: Shared, Mut, Factory, and Forward
//!   contracts with explicit borrow/acquire counters
//! - **Lifetime ladder**: ROOT through STEP containers with automatic
//!   scope construction and LIFO finalisation
//! - **Re-entrant contexts**: nested entries share one value; mutating
//!   contexts add transactional apply/cancel
//! - **Declarative wiring**: configuration descriptors assemble services
//!   and controllers, with provider grants and claims across module
//!   boundaries
//! - **Sync/async duality**: blocking-thread and cooperative-task domains
//!   share one vocabulary, bridged by the process runtime
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use modulith::{
//!     make_container, OwnerRefBox, MutProvider, SharedProvider, TypeFactory, TypeKey,
//! };
//!
//! // a provider enforcing shared/exclusive access over one value pair
//! let owner = OwnerRefBox::new(|| Some(123), || Some("123".to_string()));
//! let n = owner.borrow().unwrap();
//! assert!(owner.acquire().is_err()); // exclusive while borrowed
//! owner.reclaim(n);
//! assert_eq!(owner.acquire().unwrap(), "123");
//!
//! // a container ladder resolving factories per lifetime
//! let container = make_container(Vec::new(), None);
//! container
//!     .registry()
//!     .add_factory(TypeKey::of::<u32>(), TypeFactory::from_instance(7u32));
//! assert_eq!(container.get::<u32>().as_deref(), Some(&7));
//! ```
//!
//! ## Scoped contexts
//!
//! ```rust
//! use modulith::SyncContext;
//!
//! let ctx = SyncContext::new(|| vec![1, 2, 3]);
//! let outer = ctx.enter();
//! let inner = ctx.enter(); // factory ran once
//! assert_eq!(inner.value().len(), 3);
//! drop(inner);
//! drop(outer); // value destroyed after the last exit
//! ```

pub mod application;
pub mod async_context;
pub mod boxes;
pub mod component;
pub mod config;
pub mod container;
pub mod context;
pub mod controller;
pub mod error;
pub mod factory;
pub mod key;
pub mod lifetime;
pub mod manager;
pub mod module;
pub mod operators;
pub mod providers;
pub mod registry;
pub mod runtime;
pub mod service;

pub use application::Application;
pub use async_context::{
    AsyncContext, AsyncContextBuilder, AsyncContextGuard, AsyncMutContext, AsyncMutContextGuard,
};
pub use boxes::{
    FactoryGenBox, ForwardBox, ForwardGenBox, MutCtxRefBox, MutGenBox, MutRefBox, OwnerCtxRefBox,
    OwnerRefBox, PermanentForwardBox, SharedCtxRefBox, SharedGenBox, SharedRefBox,
};
pub use component::{Component, ModuleComponent};
pub use config::{
    created_service, Args, ComponentConf, ComponentEntry, ControllerFactoryFn, CreateCtx,
    CreatedService, CtrlConf, ModuleComponentConf, ModuleConf, ServiceFactoryFn, SvcConf,
};
pub use container::{make_container, seed_value, Container, ContainerScope, SeedBag};
pub use context::{
    current_context, current_scope_id, ContextBuilder, ContextGuard, ContextHandle, CtxCallbacks,
    MutContextGuard, MutCtxCallbacks, SyncContext, SyncMutContext,
};
pub use controller::{Controller, OperatorMember};
pub use error::{
    AppError, BorrowError, BorrowMutError, ComponentError, ContainerError, ControllerError,
    FactoryError, ForwardError, InvalidContextState, ModuleError, ResourceError, ServiceError,
};
pub use factory::{AnyInstance, TypeFactory};
pub use key::{ProviderKind, TypeKey};
pub use lifetime::Lifetime;
pub use manager::{Deps, MemberOutput, ResourceManager};
pub use module::Module;
pub use operators::{AnyOperator, AssignOperator, Operator, SlotOperator};
pub use providers::{
    AnyProvider, BorrowFlags, BoxedResource, FactoryProvider, ForwardProvider, MutProvider,
    ScopedResource, SharedProvider, TypedFactory, TypedForward, TypedMut, TypedShared,
};
pub use registry::{FactoryRegistry, InstanceRegistry, KeyedRegistry};
pub use runtime::{Runtime, RuntimeScope};
pub use service::{
    AsyncEvent, AsyncServiceCore, ProvideMember, Service, ServiceState, ServiceWaiter,
    SyncEvent, SyncServiceCore,
};
