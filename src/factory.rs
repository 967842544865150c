//! Type factories: the four shapes a registry can produce a value from.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::key::TypeKey;

/// A produced instance, type-erased and shareable.
pub type AnyInstance = Arc<dyn Any + Send + Sync>;

type CtorFn = Arc<dyn Fn() -> AnyInstance + Send + Sync>;
type KeyedFn = Arc<dyn Fn(TypeKey) -> Option<AnyInstance> + Send + Sync>;
type ScopedInitFn = Arc<dyn Fn() -> Option<AnyInstance> + Send + Sync>;
type ScopedFiniFn = Arc<dyn Fn(&AnyInstance) + Send + Sync>;

#[derive(Clone)]
enum Shape {
    /// A pre-built instance, always returned as-is.
    Value(AnyInstance),
    /// A nullary constructor invoked on each call.
    Ctor(CtorFn),
    /// A one-argument function of the requested key.
    Fn(KeyedFn),
    /// An init/fini pair whose produced value must be finalised when the
    /// owning container scope exits.
    Scoped {
        init: ScopedInitFn,
        fini: ScopedFiniFn,
    },
}

/// What a default (wildcard) factory accepts.
#[derive(Clone, Copy)]
enum Acceptance {
    /// Only the declared resource type.
    Exact(TypeId),
    /// Any requested key.
    Any,
}

/// A factory for instances of one producible type.
///
/// Carries two flags: `scoped` (the produced value must be finalised on
/// container exit) and `cache` (the container memoises the value for the
/// scope). Value factories are always cached.
#[derive(Clone)]
pub struct TypeFactory {
    shape: Shape,
    accepts: Acceptance,
    pub(crate) scoped: bool,
    pub(crate) cache: bool,
}

impl TypeFactory {
    /// Factory owning a pre-built instance; forced `cache`.
    pub fn from_instance<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            shape: Shape::Value(Arc::new(value)),
            accepts: Acceptance::Exact(TypeId::of::<T>()),
            scoped: false,
            cache: true,
        }
    }

    /// Factory invoking a nullary constructor each call.
    pub fn from_ctor<T, F>(ctor: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            shape: Shape::Ctor(Arc::new(move || Arc::new(ctor()) as AnyInstance)),
            accepts: Acceptance::Exact(TypeId::of::<T>()),
            scoped: false,
            cache: false,
        }
    }

    /// Factory invoking a function of the requested key.
    pub fn from_fn<T, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(TypeKey) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            shape: Shape::Fn(Arc::new(move |key| {
                f(key).map(|v| Arc::new(v) as AnyInstance)
            })),
            accepts: Acceptance::Exact(TypeId::of::<T>()),
            scoped: false,
            cache: false,
        }
    }

    /// Like [`from_fn`](Self::from_fn), but already type-erased; used when
    /// the produced value's type is only known dynamically.
    pub fn from_erased_fn<F>(f: F) -> Self
    where
        F: Fn(TypeKey) -> Option<AnyInstance> + Send + Sync + 'static,
    {
        Self {
            shape: Shape::Fn(Arc::new(f)),
            accepts: Acceptance::Any,
            scoped: false,
            cache: false,
        }
    }

    /// Factory over an init/fini pair; flagged `scoped` so the container
    /// finalises the produced value on scope exit.
    pub fn from_scoped<T, I, F>(init: I, fini: F) -> Self
    where
        T: Send + Sync + 'static,
        I: Fn() -> Option<T> + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            shape: Shape::Scoped {
                init: Arc::new(move || init().map(|v| Arc::new(v) as AnyInstance)),
                fini: Arc::new(move |instance: &AnyInstance| {
                    if let Some(v) = instance.downcast_ref::<T>() {
                        fini(v);
                    }
                }),
            },
            accepts: Acceptance::Exact(TypeId::of::<T>()),
            scoped: true,
            cache: false,
        }
    }

    /// Extend acceptance to any key; used for subtree default factories.
    pub fn accepting_any(mut self) -> Self {
        self.accepts = Acceptance::Any;
        self
    }

    /// Raise the cache flag (never lowers it; value factories stay
    /// cached).
    pub fn cached(mut self, cache: bool) -> Self {
        self.cache |= cache;
        self
    }

    /// Whether this factory's produced value must be finalised on scope
    /// exit.
    pub fn is_scoped(&self) -> bool {
        self.scoped
    }

    /// Whether the container memoises the produced value.
    pub fn is_cached(&self) -> bool {
        self.cache
    }

    /// Whether this factory can serve a request for `key`.
    pub(crate) fn accepts(&self, key: &TypeKey) -> bool {
        match self.accepts {
            Acceptance::Any => true,
            Acceptance::Exact(id) => id == key.resource_id() && key.kind().is_none(),
        }
    }

    pub(crate) fn create(&self, key: TypeKey) -> Option<AnyInstance> {
        match &self.shape {
            Shape::Value(value) => Some(value.clone()),
            Shape::Ctor(ctor) => Some(ctor()),
            Shape::Fn(f) => f(key),
            Shape::Scoped { init, .. } => init(),
        }
    }

    pub(crate) fn destroy(&self, instance: &AnyInstance) {
        if let Shape::Scoped { fini, .. } = &self.shape {
            fini(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_factories_are_cached() {
        let f = TypeFactory::from_instance(42u32);
        assert!(f.is_cached());
        assert!(!f.is_scoped());
        let v = f.create(TypeKey::of::<u32>()).unwrap();
        assert_eq!(*v.downcast_ref::<u32>().unwrap(), 42);
    }

    #[test]
    fn ctor_factories_build_fresh_values() {
        let f = TypeFactory::from_ctor(String::new);
        assert!(!f.is_cached());
        let v = f.create(TypeKey::of::<String>()).unwrap();
        assert_eq!(v.downcast_ref::<String>().unwrap(), "");
    }

    #[test]
    fn scoped_factories_finalise() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let finis = Arc::new(AtomicUsize::new(0));
        let f2 = finis.clone();
        let f = TypeFactory::from_scoped(
            || Some(7u8),
            move |_| {
                f2.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(f.is_scoped());
        let v = f.create(TypeKey::of::<u8>()).unwrap();
        f.destroy(&v);
        assert_eq!(finis.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn acceptance_is_nominal_unless_widened() {
        let f = TypeFactory::from_ctor(|| 1u8);
        assert!(f.accepts(&TypeKey::of::<u8>()));
        assert!(!f.accepts(&TypeKey::of::<u16>()));
        assert!(!f.accepts(&TypeKey::shared::<u8>()));
        let wide = f.accepting_any();
        assert!(wide.accepts(&TypeKey::of::<u16>()));
    }
}
