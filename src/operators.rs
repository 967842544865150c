//! Operator contracts: sinks receiving resources from providers.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::key::TypeKey;
use crate::providers::BoxedResource;

/// A sink that receives a resource during setup and releases it during
/// teardown.
///
/// `accept` returns `false` when the operator already holds a value;
/// `revoke` hands the held value back, leaving the operator empty.
pub trait Operator<T>: Send + Sync {
    fn accept(&self, instance: T) -> bool;
    fn revoke(&self) -> Option<T>;
}

/// Operator over a getter/setter pair around an optional slot.
///
/// The standard operator shape: a controller owns an `Option<T>` slot and
/// exposes it through closures.
///
/// # Examples
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use modulith::{AssignOperator, Operator};
///
/// let slot: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
/// let getter = { let s = slot.clone(); move || *s.lock().unwrap() };
/// let setter = { let s = slot.clone(); move |v| *s.lock().unwrap() = v };
/// let op = AssignOperator::new(getter, setter);
///
/// assert!(op.accept(123));
/// assert!(!op.accept(456));
/// assert_eq!(op.revoke(), Some(123));
/// assert_eq!(op.revoke(), None);
/// ```
pub struct AssignOperator<T> {
    getter: Box<dyn Fn() -> Option<T> + Send + Sync>,
    setter: Box<dyn Fn(Option<T>) + Send + Sync>,
}

impl<T> AssignOperator<T> {
    pub fn new(
        getter: impl Fn() -> Option<T> + Send + Sync + 'static,
        setter: impl Fn(Option<T>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            getter: Box::new(getter),
            setter: Box::new(setter),
        }
    }
}

impl<T: Send> Operator<T> for AssignOperator<T> {
    fn accept(&self, instance: T) -> bool {
        if (self.getter)().is_some() {
            return false;
        }
        (self.setter)(Some(instance));
        true
    }

    fn revoke(&self) -> Option<T> {
        let value = (self.getter)();
        if value.is_some() {
            (self.setter)(None);
        }
        value
    }
}

/// Operator over a plain slot owned by the operator itself.
pub struct SlotOperator<T> {
    slot: Mutex<Option<T>>,
}

impl<T> SlotOperator<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.slot.lock().unwrap().clone()
    }
}

impl<T> Default for SlotOperator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Operator<T> for SlotOperator<T> {
    fn accept(&self, instance: T) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(instance);
        true
    }

    fn revoke(&self) -> Option<T> {
        self.slot.lock().unwrap().take()
    }
}

// ----- Type-erased surface -----

pub(crate) trait ErasedOperator: Send + Sync {
    fn accept_any(&self, instance: BoxedResource) -> bool;
    fn revoke_any(&self) -> Option<BoxedResource>;
}

struct OperatorEraser<O, T> {
    inner: Arc<O>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, O> ErasedOperator for OperatorEraser<O, T>
where
    T: Send + 'static,
    O: Operator<T> + 'static,
{
    fn accept_any(&self, instance: BoxedResource) -> bool {
        match instance.downcast::<T>() {
            Ok(v) => self.inner.accept(*v),
            Err(_) => false,
        }
    }

    fn revoke_any(&self) -> Option<BoxedResource> {
        self.inner.revoke().map(|v| Box::new(v) as BoxedResource)
    }
}

/// A type-erased operator tagged with the resource key it consumes.
#[derive(Clone)]
pub struct AnyOperator {
    resource: TypeKey,
    inner: Arc<dyn ErasedOperator>,
}

impl AnyOperator {
    /// Erase a typed operator. `resource` may be a plain resource key or a
    /// provider-wrapped key when the operator consumes a provider itself.
    pub fn new<T, O>(resource: TypeKey, operator: Arc<O>) -> Self
    where
        T: Send + 'static,
        O: Operator<T> + 'static,
    {
        Self {
            resource,
            inner: Arc::new(OperatorEraser {
                inner: operator,
                _marker: PhantomData,
            }),
        }
    }

    /// The resource key this operator consumes.
    pub fn resource(&self) -> TypeKey {
        self.resource
    }

    /// Identity comparison of the underlying operator object.
    pub fn same_operator(&self, other: &AnyOperator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn accept_any(&self, instance: BoxedResource) -> bool {
        self.inner.accept_any(instance)
    }

    pub(crate) fn revoke_any(&self) -> Option<BoxedResource> {
        self.inner.revoke_any()
    }
}

impl std::fmt::Debug for AnyOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AnyOperator<{}>", self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_operator_holds_one_value() {
        let op = SlotOperator::new();
        assert!(op.accept(1));
        assert!(!op.accept(2));
        assert_eq!(op.revoke(), Some(1));
        assert!(op.accept(2));
    }

    #[test]
    fn erased_operator_round_trip() {
        let op = Arc::new(SlotOperator::<u32>::new());
        let any = AnyOperator::new(TypeKey::of::<u32>(), op.clone());
        assert!(any.accept_any(Box::new(7u32)));
        assert!(!any.accept_any(Box::new(8u32)));
        let back = any.revoke_any().unwrap().downcast::<u32>().unwrap();
        assert_eq!(*back, 7);
    }

    #[test]
    fn erased_operator_rejects_wrong_type() {
        let op = Arc::new(SlotOperator::<u32>::new());
        let any = AnyOperator::new(TypeKey::of::<u32>(), op);
        assert!(!any.accept_any(Box::new("oops")));
    }
}
