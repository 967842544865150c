//! Error taxonomy for providers, resources, and the assembler.
//!
//! Errors are tagged variants, never panics through value-producing code
//! paths. Ownership errors carry the short name of the resource they refer
//! to; assembler errors additionally carry the dotted path of the failing
//! component or module.

use thiserror::Error;

use crate::lifetime::Lifetime;

/// Errors from borrowing a shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BorrowError {
    #[error("cannot borrow \"{0}\" as immutable because the value is empty")]
    Empty(String),
    #[error("cannot borrow \"{0}\" as immutable because the value was moved out")]
    MovedOut(String),
    #[error("cannot borrow \"{0}\" as immutable because it is also borrowed as mutable")]
    BorrowedAsMutable(String),
    #[error("cannot borrow \"{name}\" as immutable: {details}")]
    Unexpected { name: String, details: String },
    #[error("cannot borrow \"{0}\" because dependencies are not enough to satisfy")]
    InsufficientDeps(String),
}

/// Errors from acquiring a mutable resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BorrowMutError {
    #[error("cannot borrow \"{0}\" as mutable because the value is empty")]
    Empty(String),
    #[error("cannot borrow \"{0}\" as mutable because the value was moved out")]
    MovedOut(String),
    #[error("cannot borrow \"{0}\" as mutable more than once at a time")]
    AlreadyBorrowed(String),
    #[error("cannot borrow \"{0}\" as mutable because it is also borrowed as immutable")]
    BorrowedAsImmutable(String),
    #[error("cannot borrow \"{name}\" as mutable: {details}")]
    Unexpected { name: String, details: String },
    #[error("cannot borrow \"{0}\" because dependencies are not enough to satisfy")]
    InsufficientDeps(String),
}

/// Errors from creating an instance through a factory provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FactoryError {
    #[error("cannot construct \"{name}\" because an internal error occurred: {details}")]
    Internal { name: String, details: String },
    #[error("cannot construct \"{name}\": {details}")]
    Unexpected { name: String, details: String },
    #[error("cannot construct \"{0}\" because dependencies are not enough to satisfy")]
    InsufficientDeps(String),
}

/// Errors from moving a value out of a forward provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    #[error("cannot forward \"{0}\" because the value is empty")]
    Empty(String),
    #[error("cannot forward \"{0}\" because the value was moved out")]
    MovedOut(String),
    #[error("cannot forward \"{name}\": {details}")]
    Unexpected { name: String, details: String },
    #[error("cannot forward \"{0}\" because dependencies are not enough to satisfy")]
    InsufficientDeps(String),
}

/// Invalid transition requested on a scoped context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidContextState {
    #[error("context exit on idle state")]
    ExitOnIdle,
    #[error("context apply on idle state")]
    ApplyOnIdle,
    #[error("context apply on cancelled state")]
    ApplyOnCancelled,
    #[error("context cancel on idle state")]
    CancelOnIdle,
    #[error("context cancel on applied state")]
    CancelOnApplied,
}

/// Errors from container construction and descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("cannot find {target} as a child of current {current}")]
    NoSuchChildLifetime { target: Lifetime, current: Lifetime },
}

/// Errors from the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("resource provision error: {0}")]
    Provision(String),
    #[error("no such resource: \"{0}\"")]
    NoSuchResource(String),
    #[error("no such dependency: \"{0}\"")]
    NoSuchDependency(String),
}

/// Errors raised by controllers and their factories.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("dependency error occurred: {0}")]
    Deps(String),
    #[error("controller factory error: {0}")]
    Factory(String),
    #[error("no such resource: \"{0}\"")]
    NoSuchResource(String),
}

/// Errors raised by services and their factories.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("service unexpected error: {0}")]
    Unexpected(String),
    #[error("dependency error occurred: {0}")]
    Deps(String),
    #[error("service factory error: {0}")]
    Factory(String),
    #[error("no such resource: \"{0}\"")]
    NoSuchResource(String),
}

/// Errors raised while assembling a component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComponentError {
    #[error("{path}: resource error in component \"{name}\": {details}")]
    Resource {
        path: String,
        name: String,
        details: String,
    },
    #[error("{path}: controller error in component \"{name}\": {details}")]
    Ctrl {
        path: String,
        name: String,
        details: String,
    },
    #[error("{path}: service error in component \"{name}\": {details}")]
    Service {
        path: String,
        name: String,
        details: String,
    },
    #[error("{path}: submodule error in component \"{name}\": {details}")]
    Module {
        path: String,
        name: String,
        details: String,
    },
}

/// Errors raised while assembling a module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("{path}: component error in module: {details}")]
    Component { path: String, details: String },
    #[error("{path}: resource error in module: {details}")]
    Resource { path: String, details: String },
    #[error("{path}: provider claim violation: \"{claim}\"")]
    ProvPolicyViolation { path: String, claim: String },
    #[error("{path}: no provider found for claim \"{claim}\"")]
    NoProvFoundForPattern { path: String, claim: String },
}

/// Errors raised by the application facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    #[error("application module is not loaded")]
    NotLoaded,
    #[error(transparent)]
    Module(#[from] ModuleError),
}
