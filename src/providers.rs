//! Provider contracts: ownership-typed access to resources.
//!
//! A provider mediates acquisition and release of a resource under exactly
//! one of four ownership contracts:
//!
//! - [`SharedProvider`] — `borrow`/`reclaim`, cloned access counted by a
//!   shared counter;
//! - [`MutProvider`] — `acquire`/`release`, exclusive access counted by an
//!   acquisition counter;
//! - [`FactoryProvider`] — `create`/`destroy`, a fresh instance per call;
//! - [`ForwardProvider`] — `take`/`dispose`, ownership moved out exactly
//!   once.
//!
//! The typed traits are what resource-owning code implements. The resource
//! manager works with the type-erased [`AnyProvider`] and downcasts back to
//! concrete types only at the operator edge.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::error::{BorrowError, BorrowMutError, FactoryError, ForwardError};
use crate::key::ProviderKind;

/// A type-erased resource instance travelling between providers and
/// operators.
pub type BoxedResource = Box<dyn Any + Send>;

/// Shared, reference-counted access to a resource.
pub trait SharedProvider<T>: Send + Sync {
    /// Borrow a copy of the resource, incrementing the shared counter.
    fn borrow(&self) -> Result<T, BorrowError>;
    /// Return a previously borrowed copy, decrementing the shared counter.
    fn reclaim(&self, instance: T);
}

/// Exclusive access to a resource.
pub trait MutProvider<T>: Send + Sync {
    /// Acquire the resource exclusively, incrementing the acquisition
    /// counter.
    fn acquire(&self) -> Result<T, BorrowMutError>;
    /// Release a previously acquired resource.
    fn release(&self, instance: T);
}

/// A fresh resource instance per call.
pub trait FactoryProvider<T>: Send + Sync {
    /// Construct a new instance.
    fn create(&self) -> Result<T, FactoryError>;
    /// Finalise an instance produced by [`create`](Self::create).
    fn destroy(&self, instance: T);
}

/// Move-once ownership transfer of a resource.
pub trait ForwardProvider<T>: Send + Sync {
    /// Move the value out. A second call fails with
    /// [`ForwardError::MovedOut`] or [`ForwardError::Empty`].
    fn take(&self) -> Result<T, ForwardError>;
    /// Hand a moved-out value back for finalisation.
    fn dispose(&self, instance: T);
    /// Whether a value is still available to take.
    fn is_present(&self) -> bool;
}

/// Override flags relaxing the mutual-exclusion rules between shared
/// borrows and mutable acquisitions on one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BorrowFlags {
    /// Permit `borrow` while an exclusive acquisition is outstanding.
    pub allow_borrow_when_acquired: bool,
    /// Permit `acquire` while shared borrows are outstanding.
    pub allow_acq_when_borrowed: bool,
    /// Permit more than one concurrent `acquire`.
    pub allow_multiple_acquisition: bool,
}

// ----- Type-erased capability surface -----

pub(crate) trait ErasedShared: Send + Sync {
    fn borrow_any(&self) -> Result<BoxedResource, BorrowError>;
    fn reclaim_any(&self, instance: BoxedResource);
}

pub(crate) trait ErasedMut: Send + Sync {
    fn acquire_any(&self) -> Result<BoxedResource, BorrowMutError>;
    fn release_any(&self, instance: BoxedResource);
}

pub(crate) trait ErasedFactory: Send + Sync {
    fn create_any(&self) -> Result<BoxedResource, FactoryError>;
    fn destroy_any(&self, instance: BoxedResource);
}

pub(crate) trait ErasedForward: Send + Sync {
    fn take_any(&self) -> Result<BoxedResource, ForwardError>;
    fn dispose_any(&self, instance: BoxedResource);
    fn present(&self) -> bool;
}

struct SharedEraser<P, T> {
    inner: Arc<P>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, P> ErasedShared for SharedEraser<P, T>
where
    T: Send + 'static,
    P: SharedProvider<T> + 'static,
{
    fn borrow_any(&self) -> Result<BoxedResource, BorrowError> {
        self.inner.borrow().map(|v| Box::new(v) as BoxedResource)
    }

    fn reclaim_any(&self, instance: BoxedResource) {
        if let Ok(v) = instance.downcast::<T>() {
            self.inner.reclaim(*v);
        }
    }
}

struct MutEraser<P, T> {
    inner: Arc<P>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, P> ErasedMut for MutEraser<P, T>
where
    T: Send + 'static,
    P: MutProvider<T> + 'static,
{
    fn acquire_any(&self) -> Result<BoxedResource, BorrowMutError> {
        self.inner.acquire().map(|v| Box::new(v) as BoxedResource)
    }

    fn release_any(&self, instance: BoxedResource) {
        if let Ok(v) = instance.downcast::<T>() {
            self.inner.release(*v);
        }
    }
}

struct FactoryEraser<P, T> {
    inner: Arc<P>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, P> ErasedFactory for FactoryEraser<P, T>
where
    T: Send + 'static,
    P: FactoryProvider<T> + 'static,
{
    fn create_any(&self) -> Result<BoxedResource, FactoryError> {
        self.inner.create().map(|v| Box::new(v) as BoxedResource)
    }

    fn destroy_any(&self, instance: BoxedResource) {
        if let Ok(v) = instance.downcast::<T>() {
            self.inner.destroy(*v);
        }
    }
}

struct ForwardEraser<P, T> {
    inner: Arc<P>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, P> ErasedForward for ForwardEraser<P, T>
where
    T: Send + 'static,
    P: ForwardProvider<T> + 'static,
{
    fn take_any(&self) -> Result<BoxedResource, ForwardError> {
        self.inner.take().map(|v| Box::new(v) as BoxedResource)
    }

    fn dispose_any(&self, instance: BoxedResource) {
        if let Ok(v) = instance.downcast::<T>() {
            self.inner.dispose(*v);
        }
    }

    fn present(&self) -> bool {
        self.inner.is_present()
    }
}

#[derive(Clone)]
enum ProviderRepr {
    Shared(Arc<dyn ErasedShared>),
    Mut(Arc<dyn ErasedMut>),
    Factory(Arc<dyn ErasedFactory>),
    Forward(Arc<dyn ErasedForward>),
}

/// A type-erased provider carrying one of the four capability sets.
///
/// This is the currency of the resource manager and the module wiring:
/// providers cross component boundaries in this form and are narrowed back
/// to typed views ([`AnyProvider::as_shared`] and friends) at consumption
/// sites.
#[derive(Clone)]
pub struct AnyProvider {
    repr: ProviderRepr,
}

impl AnyProvider {
    /// Erase a shared provider.
    pub fn from_shared<T, P>(provider: Arc<P>) -> Self
    where
        T: Send + 'static,
        P: SharedProvider<T> + 'static,
    {
        Self {
            repr: ProviderRepr::Shared(Arc::new(SharedEraser {
                inner: provider,
                _marker: PhantomData,
            })),
        }
    }

    /// Erase a mutable provider.
    pub fn from_mut<T, P>(provider: Arc<P>) -> Self
    where
        T: Send + 'static,
        P: MutProvider<T> + 'static,
    {
        Self {
            repr: ProviderRepr::Mut(Arc::new(MutEraser {
                inner: provider,
                _marker: PhantomData,
            })),
        }
    }

    /// Erase a factory provider.
    pub fn from_factory<T, P>(provider: Arc<P>) -> Self
    where
        T: Send + 'static,
        P: FactoryProvider<T> + 'static,
    {
        Self {
            repr: ProviderRepr::Factory(Arc::new(FactoryEraser {
                inner: provider,
                _marker: PhantomData,
            })),
        }
    }

    /// Erase a forward provider.
    pub fn from_forward<T, P>(provider: Arc<P>) -> Self
    where
        T: Send + 'static,
        P: ForwardProvider<T> + 'static,
    {
        Self {
            repr: ProviderRepr::Forward(Arc::new(ForwardEraser {
                inner: provider,
                _marker: PhantomData,
            })),
        }
    }

    /// The ownership contract this provider carries.
    pub fn kind(&self) -> ProviderKind {
        match &self.repr {
            ProviderRepr::Shared(_) => ProviderKind::Shared,
            ProviderRepr::Mut(_) => ProviderKind::Mut,
            ProviderRepr::Factory(_) => ProviderKind::Factory,
            ProviderRepr::Forward(_) => ProviderKind::Forward,
        }
    }

    /// Typed shared view, if this provider is shared.
    pub fn as_shared<T: Send + 'static>(&self) -> Option<TypedShared<T>> {
        match &self.repr {
            ProviderRepr::Shared(p) => Some(TypedShared {
                inner: p.clone(),
                _marker: PhantomData,
            }),
            _ => None,
        }
    }

    /// Typed mutable view, if this provider is mutable.
    pub fn as_mut<T: Send + 'static>(&self) -> Option<TypedMut<T>> {
        match &self.repr {
            ProviderRepr::Mut(p) => Some(TypedMut {
                inner: p.clone(),
                _marker: PhantomData,
            }),
            _ => None,
        }
    }

    /// Typed factory view, if this provider is a factory.
    pub fn as_factory<T: Send + 'static>(&self) -> Option<TypedFactory<T>> {
        match &self.repr {
            ProviderRepr::Factory(p) => Some(TypedFactory {
                inner: p.clone(),
                _marker: PhantomData,
            }),
            _ => None,
        }
    }

    /// Typed forward view, if this provider forwards.
    pub fn as_forward<T: Send + 'static>(&self) -> Option<TypedForward<T>> {
        match &self.repr {
            ProviderRepr::Forward(p) => Some(TypedForward {
                inner: p.clone(),
                _marker: PhantomData,
            }),
            _ => None,
        }
    }

    /// Identity comparison: two handles to the same underlying provider.
    pub fn same_provider(&self, other: &AnyProvider) -> bool {
        match (&self.repr, &other.repr) {
            (ProviderRepr::Shared(a), ProviderRepr::Shared(b)) => Arc::ptr_eq(a, b),
            (ProviderRepr::Mut(a), ProviderRepr::Mut(b)) => Arc::ptr_eq(a, b),
            (ProviderRepr::Factory(a), ProviderRepr::Factory(b)) => Arc::ptr_eq(a, b),
            (ProviderRepr::Forward(a), ProviderRepr::Forward(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Invoke the contract's init method (borrow/acquire/create/take).
    pub(crate) fn init(&self) -> Result<BoxedResource, String> {
        match &self.repr {
            ProviderRepr::Shared(p) => p.borrow_any().map_err(|e| e.to_string()),
            ProviderRepr::Mut(p) => p.acquire_any().map_err(|e| e.to_string()),
            ProviderRepr::Factory(p) => p.create_any().map_err(|e| e.to_string()),
            ProviderRepr::Forward(p) => p.take_any().map_err(|e| e.to_string()),
        }
    }

    /// Invoke the contract's fini method (reclaim/release/destroy/dispose).
    pub(crate) fn fini(&self, instance: BoxedResource) {
        match &self.repr {
            ProviderRepr::Shared(p) => p.reclaim_any(instance),
            ProviderRepr::Mut(p) => p.release_any(instance),
            ProviderRepr::Factory(p) => p.destroy_any(instance),
            ProviderRepr::Forward(p) => p.dispose_any(instance),
        }
    }
}

impl std::fmt::Debug for AnyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AnyProvider::{:?}", self.kind())
    }
}

macro_rules! typed_view {
    ($name:ident, $erased:ident) => {
        /// Typed view over an erased provider.
        pub struct $name<T> {
            inner: Arc<dyn $erased>,
            _marker: PhantomData<fn() -> T>,
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self {
                    inner: self.inner.clone(),
                    _marker: PhantomData,
                }
            }
        }
    };
}

typed_view!(TypedShared, ErasedShared);
typed_view!(TypedMut, ErasedMut);
typed_view!(TypedFactory, ErasedFactory);
typed_view!(TypedForward, ErasedForward);

fn mismatch(name: &'static str) -> String {
    format!("resource is not a \"{name}\"")
}

impl<T: Send + 'static> TypedShared<T> {
    pub fn borrow(&self) -> Result<T, BorrowError> {
        let res = self.inner.borrow_any()?;
        res.downcast::<T>().map(|v| *v).map_err(|_| BorrowError::Unexpected {
            name: std::any::type_name::<T>().into(),
            details: mismatch(std::any::type_name::<T>()),
        })
    }

    pub fn reclaim(&self, instance: T) {
        self.inner.reclaim_any(Box::new(instance));
    }
}

impl<T: Send + 'static> TypedMut<T> {
    pub fn acquire(&self) -> Result<T, BorrowMutError> {
        let res = self.inner.acquire_any()?;
        res.downcast::<T>()
            .map(|v| *v)
            .map_err(|_| BorrowMutError::Unexpected {
                name: std::any::type_name::<T>().into(),
                details: mismatch(std::any::type_name::<T>()),
            })
    }

    pub fn release(&self, instance: T) {
        self.inner.release_any(Box::new(instance));
    }
}

impl<T: Send + 'static> TypedFactory<T> {
    pub fn create(&self) -> Result<T, FactoryError> {
        let res = self.inner.create_any()?;
        res.downcast::<T>()
            .map(|v| *v)
            .map_err(|_| FactoryError::Unexpected {
                name: std::any::type_name::<T>().into(),
                details: mismatch(std::any::type_name::<T>()),
            })
    }

    pub fn destroy(&self, instance: T) {
        self.inner.destroy_any(Box::new(instance));
    }
}

impl<T: Send + 'static> TypedForward<T> {
    pub fn take(&self) -> Result<T, ForwardError> {
        let res = self.inner.take_any()?;
        res.downcast::<T>()
            .map(|v| *v)
            .map_err(|_| ForwardError::Unexpected {
                name: std::any::type_name::<T>().into(),
                details: mismatch(std::any::type_name::<T>()),
            })
    }

    pub fn dispose(&self, instance: T) {
        self.inner.dispose_any(Box::new(instance));
    }

    pub fn is_present(&self) -> bool {
        self.inner.present()
    }
}

// ----- Type-erased scoped resources -----

/// An init/fini pair expressing "set up; hand out; tear down" for a
/// type-erased resource. This is how resource-owning member factories hand
/// a scoped resource to the manager, which wraps it in the gen-box adapter
/// matching the declared ownership contract.
pub struct ScopedResource {
    init: Arc<dyn Fn() -> Option<BoxedResource> + Send + Sync>,
    fini: Arc<dyn Fn(BoxedResource) + Send + Sync>,
}

impl ScopedResource {
    /// Build from typed closures; `init` returning `None` reports
    /// insufficient dependencies.
    pub fn new<T, I, F>(init: I, fini: F) -> Self
    where
        T: Send + 'static,
        I: Fn() -> Option<T> + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            init: Arc::new(move || init().map(|v| Box::new(v) as BoxedResource)),
            fini: Arc::new(move |instance| {
                if let Ok(v) = instance.downcast::<T>() {
                    fini(*v);
                }
            }),
        }
    }

    /// Wrap into the erased provider matching `kind`.
    pub(crate) fn into_provider(self, kind: ProviderKind, name: &'static str) -> AnyProvider {
        let gen = ScopedGen {
            init: self.init,
            fini: self.fini,
            moved_out: Mutex::new(false),
            name,
        };
        let gen = Arc::new(gen);
        let repr = match kind {
            ProviderKind::Shared => ProviderRepr::Shared(gen),
            ProviderKind::Mut => ProviderRepr::Mut(gen),
            ProviderKind::Factory => ProviderRepr::Factory(gen),
            ProviderKind::Forward => ProviderRepr::Forward(gen),
        };
        AnyProvider { repr }
    }
}

/// Adapter presenting one init/fini pair under any of the four contracts.
struct ScopedGen {
    init: Arc<dyn Fn() -> Option<BoxedResource> + Send + Sync>,
    fini: Arc<dyn Fn(BoxedResource) + Send + Sync>,
    moved_out: Mutex<bool>,
    name: &'static str,
}

impl ErasedShared for ScopedGen {
    fn borrow_any(&self) -> Result<BoxedResource, BorrowError> {
        (self.init)().ok_or_else(|| BorrowError::InsufficientDeps(self.name.into()))
    }

    fn reclaim_any(&self, instance: BoxedResource) {
        (self.fini)(instance);
    }
}

impl ErasedMut for ScopedGen {
    fn acquire_any(&self) -> Result<BoxedResource, BorrowMutError> {
        (self.init)().ok_or_else(|| BorrowMutError::InsufficientDeps(self.name.into()))
    }

    fn release_any(&self, instance: BoxedResource) {
        (self.fini)(instance);
    }
}

impl ErasedFactory for ScopedGen {
    fn create_any(&self) -> Result<BoxedResource, FactoryError> {
        (self.init)().ok_or_else(|| FactoryError::InsufficientDeps(self.name.into()))
    }

    fn destroy_any(&self, instance: BoxedResource) {
        (self.fini)(instance);
    }
}

impl ErasedForward for ScopedGen {
    fn take_any(&self) -> Result<BoxedResource, ForwardError> {
        let mut moved = self.moved_out.lock().unwrap();
        if *moved {
            return Err(ForwardError::MovedOut(self.name.into()));
        }
        let instance =
            (self.init)().ok_or_else(|| ForwardError::InsufficientDeps(self.name.into()))?;
        *moved = true;
        Ok(instance)
    }

    fn dispose_any(&self, instance: BoxedResource) {
        if *self.moved_out.lock().unwrap() {
            (self.fini)(instance);
        }
    }

    fn present(&self) -> bool {
        !*self.moved_out.lock().unwrap()
    }
}
