//! Type keys identifying producible resources.

use std::any::TypeId;

/// Ownership contract a provider-wrapped key denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Cloned, reference-counted access (`borrow`/`reclaim`).
    Shared,
    /// Exclusive access (`acquire`/`release`).
    Mut,
    /// A fresh instance per call (`create`/`destroy`).
    Factory,
    /// Ownership moved out exactly once (`take`/`dispose`).
    Forward,
}

impl ProviderKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            ProviderKind::Shared => "Shared",
            ProviderKind::Mut => "Mut",
            ProviderKind::Factory => "Factory",
            ProviderKind::Forward => "Forward",
        }
    }
}

/// Key for resource and provider lookup.
///
/// Identity is nominal: two keys are equal iff they denote the same
/// producible. A plain key denotes a concrete resource type; a
/// provider-wrapped key (`TypeKey::shared::<T>()` and friends) denotes a
/// provider of that resource under one of the four ownership contracts, and
/// has structural identity over the resource parameter.
///
/// The key also carries the resource's dotted module path, which indexes the
/// factory-registry tree.
///
/// # Examples
///
/// ```rust
/// use modulith::TypeKey;
///
/// let plain = TypeKey::of::<String>();
/// assert_eq!(plain, TypeKey::of::<String>());
/// assert_ne!(plain, TypeKey::of::<u32>());
///
/// let shared = TypeKey::shared::<String>();
/// assert_ne!(plain, shared);
/// assert_eq!(shared.resource_id(), plain.resource_id());
/// assert_eq!(plain.short_name(), "String");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    kind: Option<ProviderKind>,
    name: &'static str,
}

impl TypeKey {
    /// Key for a concrete resource type.
    pub fn of<T: 'static + ?Sized>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            kind: None,
            name: std::any::type_name::<T>(),
        }
    }

    /// Key for a shared provider of `T`.
    pub fn shared<T: 'static + ?Sized>() -> Self {
        Self::wrapped::<T>(ProviderKind::Shared)
    }

    /// Key for a mutable provider of `T`.
    pub fn mutable<T: 'static + ?Sized>() -> Self {
        Self::wrapped::<T>(ProviderKind::Mut)
    }

    /// Key for a factory provider of `T`.
    pub fn factory<T: 'static + ?Sized>() -> Self {
        Self::wrapped::<T>(ProviderKind::Factory)
    }

    /// Key for a forward provider of `T`.
    pub fn forward<T: 'static + ?Sized>() -> Self {
        Self::wrapped::<T>(ProviderKind::Forward)
    }

    fn wrapped<T: 'static + ?Sized>(kind: ProviderKind) -> Self {
        Self {
            id: TypeId::of::<T>(),
            kind: Some(kind),
            name: std::any::type_name::<T>(),
        }
    }

    /// `TypeId` of the underlying resource type.
    pub fn resource_id(&self) -> TypeId {
        self.id
    }

    /// Ownership contract for provider-wrapped keys, `None` for plain keys.
    pub fn kind(&self) -> Option<ProviderKind> {
        self.kind
    }

    /// Re-wrap the same resource under another ownership contract.
    pub fn with_kind(&self, kind: ProviderKind) -> Self {
        Self {
            kind: Some(kind),
            ..*self
        }
    }

    /// The underlying plain resource key.
    pub fn resource(&self) -> Self {
        Self { kind: None, ..*self }
    }

    /// Full path of the resource type, as reported by `type_name`.
    pub fn type_name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the resource type, generics stripped.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }

    /// Dotted module path segments of the resource type, without the type
    /// name itself. Primitives have an empty path.
    pub fn module_path(&self) -> impl Iterator<Item = &'static str> {
        let base = self.name.split('<').next().unwrap_or(self.name);
        let path = match base.rfind("::") {
            Some(idx) => &base[..idx],
            None => "",
        };
        path.split("::").filter(|s| !s.is_empty())
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

impl Eq for TypeKey {}

impl std::hash::Hash for TypeKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.kind.hash(state);
    }
}

impl std::fmt::Display for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}<{}>", kind.label(), self.short_name()),
            None => f.write_str(self.short_name()),
        }
    }
}
