//! Controllers: resource-consuming lifecycle participants.

use std::sync::Arc;

use crate::error::ControllerError;
use crate::key::TypeKey;
use crate::operators::AnyOperator;
use crate::registry::InstanceRegistry;

type OperatorFactoryFn = Arc<dyn Fn() -> Result<AnyOperator, ControllerError> + Send + Sync>;

/// Descriptor of one resource-consuming member of a controller: the
/// resource key it imports plus the factory producing the operator sink.
pub struct OperatorMember {
    resource: TypeKey,
    factory: OperatorFactoryFn,
}

impl OperatorMember {
    pub fn new(
        resource: TypeKey,
        factory: impl Fn() -> Result<AnyOperator, ControllerError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            resource,
            factory: Arc::new(factory),
        }
    }

    /// The resource key this member consumes.
    pub fn resource(&self) -> TypeKey {
        self.resource
    }

    pub(crate) fn invoke(&self) -> Result<AnyOperator, ControllerError> {
        (self.factory)()
    }
}

impl Clone for OperatorMember {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource,
            factory: self.factory.clone(),
        }
    }
}

impl std::fmt::Debug for OperatorMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperatorMember<{}>", self.resource)
    }
}

/// A resource-consuming participant. Controllers have no state machine of
/// their own beyond the providers bound to their operators during setup.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use modulith::{AnyOperator, Controller, OperatorMember, SlotOperator, TypeKey};
///
/// struct NumberSink {
///     slot: Arc<SlotOperator<u32>>,
/// }
///
/// impl Controller for NumberSink {
///     fn operator_members(self: Arc<Self>) -> Vec<OperatorMember> {
///         let slot = self.slot.clone();
///         vec![OperatorMember::new(TypeKey::of::<u32>(), move || {
///             Ok(AnyOperator::new(TypeKey::of::<u32>(), slot.clone()))
///         })]
///     }
/// }
///
/// let ctrl = Arc::new(NumberSink { slot: Arc::new(SlotOperator::new()) });
/// assert_eq!(ctrl.clone().operator_members().len(), 1);
/// ```
pub trait Controller: Send + Sync + 'static {
    /// Descriptor table of this controller's resource-consuming members.
    fn operator_members(self: Arc<Self>) -> Vec<OperatorMember> {
        Vec::new()
    }

    /// Bind to component resources after operators are satisfied.
    fn setup(&self, resources: &InstanceRegistry) -> Result<bool, ControllerError> {
        let _ = resources;
        Ok(true)
    }

    /// Release component resources; reverse of [`setup`](Self::setup).
    fn teardown(&self, resources: &InstanceRegistry) -> Result<bool, ControllerError> {
        let _ = resources;
        Ok(true)
    }
}
