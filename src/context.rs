//! Re-entrant scoped contexts for the blocking-thread domain.
//!
//! A context manages acquisition and release of a value produced by a
//! factory. Nested entries on the same context share one underlying value:
//! the factory runs on the first entry, finalisation runs after the
//! matching last exit. Mutating contexts additionally serialise
//! commit/rollback through `apply`/`cancel`.

use std::any::TypeId;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::InvalidContextState;

static NEXT_CTX_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_ctx_id() -> u64 {
    NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed)
}

// ----- Current-context bookkeeping -----

/// Identity of an entered context: its numeric ident plus the type of the
/// value it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextHandle {
    id: u64,
    type_id: TypeId,
}

impl ContextHandle {
    pub(crate) fn new(id: u64, type_id: TypeId) -> Self {
        Self { id, type_id }
    }

    /// Numeric identity of the context instance.
    pub fn ident(&self) -> u64 {
        self.id
    }

    /// `TypeId` of the wrapped value.
    pub fn value_type(&self) -> TypeId {
        self.type_id
    }
}

/// Thread-local stacks for the sync domain, task-keyed stacks for the
/// async domain. Entries are never observed across threads or tasks.
pub(crate) mod scope_stack {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static CURRENT: RefCell<Vec<ContextHandle>> = const { RefCell::new(Vec::new()) };
        static BY_TYPE: RefCell<HashMap<TypeId, Vec<ContextHandle>>> =
            RefCell::new(HashMap::new());
    }

    type TaskStacks = HashMap<tokio::task::Id, (Vec<ContextHandle>, HashMap<TypeId, Vec<ContextHandle>>)>;

    static TASK_STACKS: Mutex<Option<TaskStacks>> = Mutex::new(None);

    pub(crate) fn push(handle: ContextHandle) {
        if let Some(task) = tokio::task::try_id() {
            let mut map = TASK_STACKS.lock().unwrap();
            let map = map.get_or_insert_with(HashMap::new);
            let entry = map.entry(task).or_default();
            entry.0.push(handle);
            entry.1.entry(handle.type_id).or_default().push(handle);
            return;
        }
        CURRENT.with(|c| c.borrow_mut().push(handle));
        BY_TYPE.with(|m| m.borrow_mut().entry(handle.type_id).or_default().push(handle));
    }

    pub(crate) fn pop(handle: ContextHandle) {
        if let Some(task) = tokio::task::try_id() {
            let mut map = TASK_STACKS.lock().unwrap();
            if let Some(map) = map.as_mut() {
                if let Some(entry) = map.get_mut(&task) {
                    remove_last(&mut entry.0, handle);
                    if let Some(stack) = entry.1.get_mut(&handle.type_id) {
                        remove_last(stack, handle);
                    }
                    if entry.0.is_empty() {
                        map.remove(&task);
                    }
                }
            }
            return;
        }
        CURRENT.with(|c| remove_last(&mut c.borrow_mut(), handle));
        BY_TYPE.with(|m| {
            if let Some(stack) = m.borrow_mut().get_mut(&handle.type_id) {
                remove_last(stack, handle);
            }
        });
    }

    fn remove_last(stack: &mut Vec<ContextHandle>, handle: ContextHandle) {
        if let Some(pos) = stack.iter().rposition(|h| *h == handle) {
            stack.remove(pos);
        }
    }

    pub(crate) fn top(kind: Option<TypeId>) -> Option<ContextHandle> {
        if let Some(task) = tokio::task::try_id() {
            let map = TASK_STACKS.lock().unwrap();
            let entry = map.as_ref()?.get(&task)?;
            return match kind {
                Some(ty) => entry.1.get(&ty).and_then(|s| s.last()).copied(),
                None => entry.0.last().copied(),
            };
        }
        match kind {
            Some(ty) => BY_TYPE.with(|m| m.borrow().get(&ty).and_then(|s| s.last()).copied()),
            None => CURRENT.with(|c| c.borrow().last().copied()),
        }
    }
}

/// The topmost entered context on this thread or task, optionally filtered
/// by the type of the wrapped value.
pub fn current_context(kind: Option<TypeId>) -> Option<ContextHandle> {
    scope_stack::top(kind)
}

/// A string identity for the current scope: the active context's ident if
/// one is entered, else the running task, else the running thread.
pub fn current_scope_id(kind: Option<TypeId>) -> String {
    if let Some(handle) = scope_stack::top(kind) {
        return format!("ctx:{}", handle.ident());
    }
    if let Some(task) = tokio::task::try_id() {
        return format!("task:{task}");
    }
    format!("thread:{:?}", std::thread::current().id())
}

// ----- Callbacks -----

type UnitFn = Arc<dyn Fn() + Send + Sync>;
type RefFn<T> = Arc<dyn Fn(&T) + Send + Sync>;
type RefMutFn<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

/// Observation hooks around a context's lifecycle.
///
/// Every hook is optional. Nested entries are observed through the
/// `on_nested_*` pair, never through `on_enter`/`on_exit`, which fire only
/// on the first entry and the matching last exit.
pub struct CtxCallbacks<T> {
    pub(crate) before_create: Option<UnitFn>,
    pub(crate) after_create: Option<RefFn<T>>,
    pub(crate) on_destroy: Option<RefMutFn<T>>,
    pub(crate) on_enter: Option<RefFn<T>>,
    pub(crate) on_exit: Option<RefFn<T>>,
    pub(crate) on_nested_enter: Option<RefFn<T>>,
    pub(crate) on_nested_exit: Option<RefFn<T>>,
}

impl<T> CtxCallbacks<T> {
    pub fn new() -> Self {
        Self {
            before_create: None,
            after_create: None,
            on_destroy: None,
            on_enter: None,
            on_exit: None,
            on_nested_enter: None,
            on_nested_exit: None,
        }
    }

    pub fn before_create(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_create = Some(Arc::new(f));
        self
    }

    pub fn after_create(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.after_create = Some(Arc::new(f));
        self
    }

    pub fn on_destroy(mut self, f: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        self.on_destroy = Some(Arc::new(f));
        self
    }

    pub fn on_enter(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Arc::new(f));
        self
    }

    pub fn on_exit(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Arc::new(f));
        self
    }

    pub fn on_nested_enter(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_nested_enter = Some(Arc::new(f));
        self
    }

    pub fn on_nested_exit(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_nested_exit = Some(Arc::new(f));
        self
    }
}

impl<T> Default for CtxCallbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CtxCallbacks<T> {
    fn clone(&self) -> Self {
        Self {
            before_create: self.before_create.clone(),
            after_create: self.after_create.clone(),
            on_destroy: self.on_destroy.clone(),
            on_enter: self.on_enter.clone(),
            on_exit: self.on_exit.clone(),
            on_nested_enter: self.on_nested_enter.clone(),
            on_nested_exit: self.on_nested_exit.clone(),
        }
    }
}

/// Hooks for a mutating context: the common set plus commit/rollback.
pub struct MutCtxCallbacks<T> {
    pub(crate) common: CtxCallbacks<T>,
    pub(crate) on_apply: Option<RefFn<T>>,
    pub(crate) on_cancel: Option<RefFn<T>>,
}

impl<T> MutCtxCallbacks<T> {
    pub fn new() -> Self {
        Self {
            common: CtxCallbacks::new(),
            on_apply: None,
            on_cancel: None,
        }
    }

    pub fn common(mut self, callbacks: CtxCallbacks<T>) -> Self {
        self.common = callbacks;
        self
    }

    pub fn on_apply(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_apply = Some(Arc::new(f));
        self
    }

    pub fn on_cancel(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Arc::new(f));
        self
    }
}

impl<T> Default for MutCtxCallbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MutCtxCallbacks<T> {
    fn clone(&self) -> Self {
        Self {
            common: self.common.clone(),
            on_apply: self.on_apply.clone(),
            on_cancel: self.on_cancel.clone(),
        }
    }
}

// ----- State machine -----

enum State<T> {
    Idle,
    InUse { count: usize, cell: Arc<Mutex<T>> },
    Applied { count: usize, cell: Arc<Mutex<T>> },
    Cancelled { count: usize, cell: Arc<Mutex<T>> },
}

/// Object-safe view of a context used for sub-context chaining.
pub(crate) trait RawContext: Send + Sync {
    fn enter_raw(&self);
    fn exit_raw(&self);
}

/// Object-safe view of a mutating context for apply/cancel propagation.
pub(crate) trait RawMutContext: RawContext {
    fn apply_raw(&self) -> Result<(), InvalidContextState>;
    fn cancel_raw(&self) -> Result<(), InvalidContextState>;
}

struct MutPart<T> {
    on_apply: Option<RefFn<T>>,
    on_cancel: Option<RefFn<T>>,
    force_rollback: bool,
    auto_apply: bool,
    mut_children: Vec<Arc<dyn RawMutContext>>,
}

struct CtxInner<T> {
    id: u64,
    factory: Arc<dyn Fn() -> T + Send + Sync>,
    callbacks: CtxCallbacks<T>,
    mut_part: Option<MutPart<T>>,
    finalizers: Vec<UnitFn>,
    sub_contexts: Vec<Arc<dyn RawContext>>,
    state: Mutex<State<T>>,
}

impl<T: Send + 'static> CtxInner<T> {
    fn handle(&self) -> ContextHandle {
        ContextHandle {
            id: self.id,
            type_id: TypeId::of::<T>(),
        }
    }

    fn enter_cell(&self) -> Arc<Mutex<T>> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Idle) {
            State::Idle => {
                for sub in &self.sub_contexts {
                    sub.enter_raw();
                }
                if let Some(cb) = &self.callbacks.before_create {
                    cb();
                }
                let value = (self.factory)();
                if let Some(cb) = &self.callbacks.after_create {
                    cb(&value);
                }
                scope_stack::push(self.handle());
                if let Some(cb) = &self.callbacks.on_enter {
                    cb(&value);
                }
                let cell = Arc::new(Mutex::new(value));
                *state = State::InUse {
                    count: 1,
                    cell: cell.clone(),
                };
                cell
            }
            State::InUse { count, cell }
            | State::Applied { count, cell }
            | State::Cancelled { count, cell } => {
                if let Some(cb) = &self.callbacks.on_nested_enter {
                    cb(&cell.lock().unwrap());
                }
                let out = cell.clone();
                *state = State::InUse {
                    count: count + 1,
                    cell,
                };
                out
            }
        }
    }

    fn exit_with(&self, panicking: bool) {
        let mut state = self.state.lock().unwrap();
        let taken = std::mem::replace(&mut *state, State::Idle);
        let (count, cell, was) = match taken {
            State::Idle => {
                debug_assert!(false, "context exit on idle state");
                return;
            }
            State::InUse { count, cell } => (count, cell, Variant::InUse),
            State::Applied { count, cell } => (count, cell, Variant::Applied),
            State::Cancelled { count, cell } => (count, cell, Variant::Cancelled),
        };

        if count > 1 {
            if let Some(cb) = &self.callbacks.on_nested_exit {
                cb(&cell.lock().unwrap());
            }
            *state = match was {
                Variant::InUse => State::InUse {
                    count: count - 1,
                    cell,
                },
                Variant::Applied => State::Applied {
                    count: count - 1,
                    cell,
                },
                Variant::Cancelled => State::Cancelled {
                    count: count - 1,
                    cell,
                },
            };
            return;
        }

        if let Some(part) = &self.mut_part {
            if part.force_rollback || panicking {
                self.auto_transition(&cell, was, Auto::Cancel, part);
            } else if part.auto_apply {
                self.auto_transition(&cell, was, Auto::Apply, part);
            }
        }
        if let Some(cb) = &self.callbacks.on_exit {
            cb(&cell.lock().unwrap());
        }
        scope_stack::pop(self.handle());
        if let Some(cb) = &self.callbacks.on_destroy {
            cb(&mut cell.lock().unwrap());
        }
        for sub in self.sub_contexts.iter().rev() {
            sub.exit_raw();
        }
        for finalizer in &self.finalizers {
            let finalizer = finalizer.clone();
            let _ = catch_unwind(AssertUnwindSafe(move || finalizer()));
        }
        *state = State::Idle;
    }

    fn auto_transition(&self, cell: &Arc<Mutex<T>>, was: Variant, auto: Auto, part: &MutPart<T>) {
        match (was, auto) {
            (Variant::InUse, Auto::Apply) => {
                for child in &part.mut_children {
                    let _ = child.apply_raw();
                }
                if let Some(cb) = &part.on_apply {
                    cb(&cell.lock().unwrap());
                }
            }
            (Variant::InUse, Auto::Cancel) => {
                for child in &part.mut_children {
                    let _ = child.cancel_raw();
                }
                if let Some(cb) = &part.on_cancel {
                    cb(&cell.lock().unwrap());
                }
            }
            (Variant::Applied, Auto::Apply) | (Variant::Cancelled, Auto::Cancel) => {}
            (Variant::Applied, Auto::Cancel) => {
                tracing::warn!(ctx = self.id, "exit rollback requested on applied context");
            }
            (Variant::Cancelled, Auto::Apply) => {
                tracing::warn!(ctx = self.id, "exit apply requested on cancelled context");
            }
        }
    }

    fn do_apply(&self) -> Result<(), InvalidContextState> {
        let part = self.mut_part.as_ref().expect("apply on non-mut context");
        let mut state = self.state.lock().unwrap();
        let (count, cell) = match &*state {
            State::Idle => return Err(InvalidContextState::ApplyOnIdle),
            State::Applied { .. } => return Ok(()),
            State::Cancelled { .. } => return Err(InvalidContextState::ApplyOnCancelled),
            State::InUse { count, cell } => (*count, cell.clone()),
        };
        for child in &part.mut_children {
            child.apply_raw()?;
        }
        if let Some(cb) = &part.on_apply {
            cb(&cell.lock().unwrap());
        }
        *state = State::Applied { count, cell };
        Ok(())
    }

    fn do_cancel(&self) -> Result<(), InvalidContextState> {
        let part = self.mut_part.as_ref().expect("cancel on non-mut context");
        let mut state = self.state.lock().unwrap();
        let (count, cell) = match &*state {
            State::Idle => return Err(InvalidContextState::CancelOnIdle),
            State::Cancelled { .. } => return Ok(()),
            State::Applied { .. } => return Err(InvalidContextState::CancelOnApplied),
            State::InUse { count, cell } => (*count, cell.clone()),
        };
        for child in &part.mut_children {
            child.cancel_raw()?;
        }
        if let Some(cb) = &part.on_cancel {
            cb(&cell.lock().unwrap());
        }
        *state = State::Cancelled { count, cell };
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Variant {
    InUse,
    Applied,
    Cancelled,
}

#[derive(Clone, Copy)]
enum Auto {
    Apply,
    Cancel,
}

// ----- Public context types -----

/// A re-entrant scope around a value for the blocking-thread domain.
///
/// Entering returns a guard; the value lives as long as at least one guard
/// does. The factory runs once on first entry and the value is destroyed
/// (hooks, sub-contexts, finalizers) after the matching last exit.
///
/// # Examples
///
/// ```rust
/// use modulith::SyncContext;
///
/// let ctx = SyncContext::new(|| 123);
/// {
///     let outer = ctx.enter();
///     let inner = ctx.enter();
///     assert_eq!(*inner.value(), 123);
///     drop(inner);
///     assert_eq!(*outer.value(), 123);
/// }
/// // fully exited: next enter re-runs the factory
/// let again = ctx.enter();
/// assert_eq!(*again.value(), 123);
/// ```
pub struct SyncContext<T> {
    inner: Arc<CtxInner<T>>,
}

impl<T> Clone for SyncContext<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> SyncContext<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        ContextBuilder::new(factory).build()
    }

    pub fn with_callbacks(
        factory: impl Fn() -> T + Send + Sync + 'static,
        callbacks: CtxCallbacks<T>,
    ) -> Self {
        ContextBuilder::new(factory).callbacks(callbacks).build()
    }

    /// Numeric identity, stable across entries.
    pub fn ident(&self) -> u64 {
        self.inner.id
    }

    /// Enter the context, constructing the value if this is the first
    /// entry.
    pub fn enter(&self) -> ContextGuard<T> {
        let cell = self.inner.enter_cell();
        ContextGuard {
            ctx: self.clone(),
            cell,
        }
    }
}

impl<T: Send + 'static> RawContext for SyncContext<T> {
    fn enter_raw(&self) {
        let _ = self.inner.enter_cell();
    }

    fn exit_raw(&self) {
        self.inner.exit_with(false);
    }
}

/// Guard over an entered [`SyncContext`]. Dropping it exits the context;
/// dropping during a panic counts as an error exit for the auto-rollback
/// rules of mutating contexts.
pub struct ContextGuard<T: Send + 'static> {
    ctx: SyncContext<T>,
    cell: Arc<Mutex<T>>,
}

impl<T: Send + 'static> ContextGuard<T> {
    /// Lock and access the wrapped value.
    pub fn value(&self) -> MutexGuard<'_, T> {
        self.cell.lock().unwrap()
    }
}

impl<T: Send + 'static> Drop for ContextGuard<T> {
    fn drop(&mut self) {
        self.ctx.inner.exit_with(std::thread::panicking());
    }
}

/// A mutating re-entrant scope adding commit/rollback on top of
/// [`SyncContext`].
///
/// # Examples
///
/// ```rust
/// use std::collections::HashMap;
/// use std::sync::{Arc, Mutex};
/// use modulith::{ContextBuilder, MutCtxCallbacks};
///
/// let store: Arc<Mutex<HashMap<String, i32>>> = Arc::new(Mutex::new(
///     [("counter".to_string(), 1)].into_iter().collect(),
/// ));
///
/// let read = store.clone();
/// let write = store.clone();
/// let ctx = ContextBuilder::new(move || read.lock().unwrap().clone())
///     .mut_callbacks(MutCtxCallbacks::new().on_apply(move |v: &HashMap<String, i32>| {
///         *write.lock().unwrap() = v.clone();
///     }))
///     .build_mut();
///
/// {
///     let guard = ctx.enter();
///     guard.value().insert("counter".into(), 2);
///     guard.apply().unwrap();
/// }
/// assert_eq!(store.lock().unwrap()["counter"], 2);
/// ```
pub struct SyncMutContext<T> {
    inner: Arc<CtxInner<T>>,
}

impl<T> Clone for SyncMutContext<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for SyncMutContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMutContext").finish()
    }
}

impl<T: Send + 'static> SyncMutContext<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        ContextBuilder::new(factory).build_mut()
    }

    pub fn with_callbacks(
        factory: impl Fn() -> T + Send + Sync + 'static,
        callbacks: MutCtxCallbacks<T>,
    ) -> Self {
        ContextBuilder::new(factory).mut_callbacks(callbacks).build_mut()
    }

    pub fn ident(&self) -> u64 {
        self.inner.id
    }

    pub fn enter(&self) -> MutContextGuard<T> {
        let cell = self.inner.enter_cell();
        MutContextGuard {
            ctx: self.clone(),
            cell,
        }
    }

    /// Commit: apply mutable children, then this context's `on_apply`.
    pub fn apply(&self) -> Result<(), InvalidContextState> {
        self.inner.do_apply()
    }

    /// Roll back: cancel mutable children, then this context's `on_cancel`.
    pub fn cancel(&self) -> Result<(), InvalidContextState> {
        self.inner.do_cancel()
    }
}

impl<T: Send + 'static> RawContext for SyncMutContext<T> {
    fn enter_raw(&self) {
        let _ = self.inner.enter_cell();
    }

    fn exit_raw(&self) {
        self.inner.exit_with(false);
    }
}

impl<T: Send + 'static> RawMutContext for SyncMutContext<T> {
    fn apply_raw(&self) -> Result<(), InvalidContextState> {
        self.inner.do_apply()
    }

    fn cancel_raw(&self) -> Result<(), InvalidContextState> {
        self.inner.do_cancel()
    }
}

/// Guard over an entered [`SyncMutContext`].
pub struct MutContextGuard<T: Send + 'static> {
    ctx: SyncMutContext<T>,
    cell: Arc<Mutex<T>>,
}

impl<T: Send + 'static> MutContextGuard<T> {
    pub fn value(&self) -> MutexGuard<'_, T> {
        self.cell.lock().unwrap()
    }

    pub fn apply(&self) -> Result<(), InvalidContextState> {
        self.ctx.apply()
    }

    pub fn cancel(&self) -> Result<(), InvalidContextState> {
        self.ctx.cancel()
    }
}

impl<T: Send + 'static> Drop for MutContextGuard<T> {
    fn drop(&mut self) {
        self.ctx.inner.exit_with(std::thread::panicking());
    }
}

// ----- Builder -----

/// Collects the ingredients of a context before building it: the value
/// factory, lifecycle callbacks, finalizers, and sub-contexts opened before
/// the value is constructed and closed in reverse after it is destroyed.
pub struct ContextBuilder<T> {
    factory: Arc<dyn Fn() -> T + Send + Sync>,
    callbacks: CtxCallbacks<T>,
    mut_callbacks: MutCtxCallbacks<T>,
    finalizers: Vec<UnitFn>,
    sub_contexts: Vec<Arc<dyn RawContext>>,
    mut_children: Vec<Arc<dyn RawMutContext>>,
    force_rollback: bool,
    auto_apply: bool,
}

impl<T> Clone for ContextBuilder<T> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            callbacks: self.callbacks.clone(),
            mut_callbacks: self.mut_callbacks.clone(),
            finalizers: self.finalizers.clone(),
            sub_contexts: self.sub_contexts.clone(),
            mut_children: self.mut_children.clone(),
            force_rollback: self.force_rollback,
            auto_apply: self.auto_apply,
        }
    }
}

impl<T: Send + 'static> ContextBuilder<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            callbacks: CtxCallbacks::new(),
            mut_callbacks: MutCtxCallbacks::new(),
            finalizers: Vec::new(),
            sub_contexts: Vec::new(),
            mut_children: Vec::new(),
            force_rollback: false,
            auto_apply: false,
        }
    }

    pub fn callbacks(mut self, callbacks: CtxCallbacks<T>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn mut_callbacks(mut self, callbacks: MutCtxCallbacks<T>) -> Self {
        self.mut_callbacks = callbacks;
        self
    }

    pub fn finalizer(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.finalizers.push(Arc::new(f));
        self
    }

    /// Open `ctx` before the value factory runs; close it in reverse order
    /// after destruction.
    pub fn sub_context<U: Send + 'static>(mut self, ctx: SyncContext<U>) -> Self {
        self.sub_contexts.push(Arc::new(ctx));
        self
    }

    /// Like [`sub_context`](Self::sub_context), additionally propagating
    /// apply/cancel to the child.
    pub fn mut_sub_context<U: Send + 'static>(mut self, ctx: SyncMutContext<U>) -> Self {
        self.sub_contexts.push(Arc::new(ctx.clone()));
        self.mut_children.push(Arc::new(ctx));
        self
    }

    /// On last exit, roll back even without a panic.
    pub fn force_rollback(mut self, yes: bool) -> Self {
        self.force_rollback = yes;
        self
    }

    /// On last exit, commit unless rolling back.
    pub fn auto_apply(mut self, yes: bool) -> Self {
        self.auto_apply = yes;
        self
    }

    pub fn build(self) -> SyncContext<T> {
        SyncContext {
            inner: Arc::new(CtxInner {
                id: next_ctx_id(),
                factory: self.factory,
                callbacks: self.callbacks,
                mut_part: None,
                finalizers: self.finalizers,
                sub_contexts: self.sub_contexts,
                state: Mutex::new(State::Idle),
            }),
        }
    }

    pub fn build_mut(self) -> SyncMutContext<T> {
        let MutCtxCallbacks {
            common,
            on_apply,
            on_cancel,
        } = self.mut_callbacks;
        // An explicit common set on the mut callbacks wins over .callbacks().
        let callbacks = merge_callbacks(self.callbacks, common);
        SyncMutContext {
            inner: Arc::new(CtxInner {
                id: next_ctx_id(),
                factory: self.factory,
                callbacks,
                mut_part: Some(MutPart {
                    on_apply,
                    on_cancel,
                    force_rollback: self.force_rollback,
                    auto_apply: self.auto_apply,
                    mut_children: self.mut_children,
                }),
                finalizers: self.finalizers,
                sub_contexts: self.sub_contexts,
                state: Mutex::new(State::Idle),
            }),
        }
    }
}

pub(crate) fn merge_callbacks<T>(base: CtxCallbacks<T>, over: CtxCallbacks<T>) -> CtxCallbacks<T> {
    CtxCallbacks {
        before_create: over.before_create.or(base.before_create),
        after_create: over.after_create.or(base.after_create),
        on_destroy: over.on_destroy.or(base.on_destroy),
        on_enter: over.on_enter.or(base.on_enter),
        on_exit: over.on_exit.or(base.on_exit),
        on_nested_enter: over.on_nested_enter.or(base.on_nested_enter),
        on_nested_exit: over.on_nested_exit.or(base.on_nested_exit),
    }
}
