//! Re-entrant scoped contexts for the cooperative task domain.
//!
//! Mirrors [`crate::context`] with a `tokio` mutex guarding the state
//! machine: only the first entry may suspend while constructing the value.
//! Exit is explicit (`guard.exit().await`); a guard dropped without exiting
//! falls back to a best-effort synchronous exit so finalizers still run
//! when the owning task is cancelled between enter and exit.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;

use crate::context::{next_ctx_id, scope_stack, ContextHandle, CtxCallbacks, MutCtxCallbacks};
use crate::error::InvalidContextState;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type AsyncFactory<T> = Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;
type RefFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum State<T> {
    Idle,
    InUse { count: usize, cell: Arc<StdMutex<T>> },
    Applied { count: usize, cell: Arc<StdMutex<T>> },
    Cancelled { count: usize, cell: Arc<StdMutex<T>> },
}

#[derive(Clone, Copy)]
enum Variant {
    InUse,
    Applied,
    Cancelled,
}

/// Object-safe async context view for sub-context chaining.
#[async_trait::async_trait]
pub(crate) trait RawAsyncContext: Send + Sync {
    async fn enter_raw(&self);
    async fn exit_raw(&self);
}

#[async_trait::async_trait]
pub(crate) trait RawAsyncMutContext: RawAsyncContext {
    async fn apply_raw(&self) -> Result<(), InvalidContextState>;
    async fn cancel_raw(&self) -> Result<(), InvalidContextState>;
}

struct MutPart<T> {
    on_apply: Option<RefFn<T>>,
    on_cancel: Option<RefFn<T>>,
    force_rollback: bool,
    auto_apply: bool,
    mut_children: Vec<Arc<dyn RawAsyncMutContext>>,
}

struct AsyncCtxInner<T> {
    id: u64,
    factory: AsyncFactory<T>,
    callbacks: CtxCallbacks<T>,
    mut_part: Option<MutPart<T>>,
    finalizers: Vec<Arc<dyn Fn() + Send + Sync>>,
    sub_contexts: Vec<Arc<dyn RawAsyncContext>>,
    state: AsyncMutex<State<T>>,
}

impl<T: Send + 'static> AsyncCtxInner<T> {
    fn handle(&self) -> ContextHandle {
        ContextHandle::new(self.id, std::any::TypeId::of::<T>())
    }

    async fn enter_cell(&self) -> Arc<StdMutex<T>> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Idle) {
            State::Idle => {
                for sub in &self.sub_contexts {
                    sub.enter_raw().await;
                }
                if let Some(cb) = &self.callbacks.before_create {
                    cb();
                }
                let value = (self.factory)().await;
                if let Some(cb) = &self.callbacks.after_create {
                    cb(&value);
                }
                scope_stack::push(self.handle());
                if let Some(cb) = &self.callbacks.on_enter {
                    cb(&value);
                }
                let cell = Arc::new(StdMutex::new(value));
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

    async fn exit_with(&self, panicking: bool) {
        let mut state = self.state.lock().await;
        if let Some(rest) = self.exit_locked(&mut state, panicking) {
            for sub in rest.iter().rev() {
                sub.exit_raw().await;
            }
            self.run_finalizers();
        }
    }

    /// Best-effort exit without awaiting, used when a guard is dropped by
    /// task cancellation. Async sub-contexts cannot be awaited here; their
    /// own drop fallbacks take over.
    fn exit_blocking(&self) {
        match self.state.try_lock() {
            Ok(mut state) => {
                if self.exit_locked(&mut state, std::thread::panicking()).is_some() {
                    self.run_finalizers();
                }
            }
            Err(_) => {
                tracing::warn!(ctx = self.id, "async context dropped while contended; cleanup skipped");
            }
        }
    }

    /// Shared non-awaiting part of the exit path. Returns the sub-context
    /// list when this was the last exit and they still must be closed.
    fn exit_locked(
        &self,
        state: &mut State<T>,
        panicking: bool,
    ) -> Option<&[Arc<dyn RawAsyncContext>]> {
        let taken = std::mem::replace(state, State::Idle);
        let (count, cell, was) = match taken {
            State::Idle => return None,
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
            return None;
        }

        if let Some(part) = &self.mut_part {
            let wants_cancel = part.force_rollback || panicking;
            if matches!(was, Variant::InUse) {
                if wants_cancel {
                    if let Some(cb) = &part.on_cancel {
                        cb(&cell.lock().unwrap());
                    }
                } else if part.auto_apply {
                    if let Some(cb) = &part.on_apply {
                        cb(&cell.lock().unwrap());
                    }
                }
            }
        }
        if let Some(cb) = &self.callbacks.on_exit {
            cb(&cell.lock().unwrap());
        }
        scope_stack::pop(self.handle());
        if let Some(cb) = &self.callbacks.on_destroy {
            cb(&mut cell.lock().unwrap());
        }
        Some(&self.sub_contexts)
    }

    fn run_finalizers(&self) {
        for finalizer in &self.finalizers {
            let finalizer = finalizer.clone();
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || finalizer()));
        }
    }

    async fn do_apply(&self) -> Result<(), InvalidContextState> {
        let part = self.mut_part.as_ref().expect("apply on non-mut context");
        let mut state = self.state.lock().await;
        let (count, cell) = match &*state {
            State::Idle => return Err(InvalidContextState::ApplyOnIdle),
            State::Applied { .. } => return Ok(()),
            State::Cancelled { .. } => return Err(InvalidContextState::ApplyOnCancelled),
            State::InUse { count, cell } => (*count, cell.clone()),
        };
        for child in &part.mut_children {
            child.apply_raw().await?;
        }
        if let Some(cb) = &part.on_apply {
            cb(&cell.lock().unwrap());
        }
        *state = State::Applied { count, cell };
        Ok(())
    }

    async fn do_cancel(&self) -> Result<(), InvalidContextState> {
        let part = self.mut_part.as_ref().expect("cancel on non-mut context");
        let mut state = self.state.lock().await;
        let (count, cell) = match &*state {
            State::Idle => return Err(InvalidContextState::CancelOnIdle),
            State::Cancelled { .. } => return Ok(()),
            State::Applied { .. } => return Err(InvalidContextState::CancelOnApplied),
            State::InUse { count, cell } => (*count, cell.clone()),
        };
        for child in &part.mut_children {
            child.cancel_raw().await?;
        }
        if let Some(cb) = &part.on_cancel {
            cb(&cell.lock().unwrap());
        }
        *state = State::Cancelled { count, cell };
        Ok(())
    }
}

/// Async re-entrant scope around a value.
pub struct AsyncContext<T> {
    inner: Arc<AsyncCtxInner<T>>,
}

impl<T> Clone for AsyncContext<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> AsyncContext<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        AsyncContextBuilder::new(factory).build()
    }

    pub fn ident(&self) -> u64 {
        self.inner.id
    }

    pub async fn enter(&self) -> AsyncContextGuard<T> {
        let cell = self.inner.enter_cell().await;
        AsyncContextGuard {
            ctx: self.clone(),
            cell,
            exited: false,
        }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> RawAsyncContext for AsyncContext<T> {
    async fn enter_raw(&self) {
        let _ = self.inner.enter_cell().await;
    }

    async fn exit_raw(&self) {
        self.inner.exit_with(false).await;
    }
}

/// Guard over an entered [`AsyncContext`]. Prefer `exit().await`; dropping
/// without it falls back to a synchronous cleanup.
pub struct AsyncContextGuard<T: Send + 'static> {
    ctx: AsyncContext<T>,
    cell: Arc<StdMutex<T>>,
    exited: bool,
}

impl<T: Send + 'static> AsyncContextGuard<T> {
    pub fn value(&self) -> MutexGuard<'_, T> {
        self.cell.lock().unwrap()
    }

    pub async fn exit(mut self) {
        self.exited = true;
        self.ctx.inner.exit_with(false).await;
    }
}

impl<T: Send + 'static> Drop for AsyncContextGuard<T> {
    fn drop(&mut self) {
        if !self.exited {
            self.ctx.inner.exit_blocking();
        }
    }
}

/// Async mutating re-entrant scope with commit/rollback.
pub struct AsyncMutContext<T> {
    inner: Arc<AsyncCtxInner<T>>,
}

impl<T> Clone for AsyncMutContext<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> AsyncMutContext<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        AsyncContextBuilder::new(factory).build_mut()
    }

    pub fn ident(&self) -> u64 {
        self.inner.id
    }

    pub async fn enter(&self) -> AsyncMutContextGuard<T> {
        let cell = self.inner.enter_cell().await;
        AsyncMutContextGuard {
            ctx: self.clone(),
            cell,
            exited: false,
        }
    }

    pub async fn apply(&self) -> Result<(), InvalidContextState> {
        self.inner.do_apply().await
    }

    pub async fn cancel(&self) -> Result<(), InvalidContextState> {
        self.inner.do_cancel().await
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> RawAsyncContext for AsyncMutContext<T> {
    async fn enter_raw(&self) {
        let _ = self.inner.enter_cell().await;
    }

    async fn exit_raw(&self) {
        self.inner.exit_with(false).await;
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> RawAsyncMutContext for AsyncMutContext<T> {
    async fn apply_raw(&self) -> Result<(), InvalidContextState> {
        self.inner.do_apply().await
    }

    async fn cancel_raw(&self) -> Result<(), InvalidContextState> {
        self.inner.do_cancel().await
    }
}

/// Guard over an entered [`AsyncMutContext`].
pub struct AsyncMutContextGuard<T: Send + 'static> {
    ctx: AsyncMutContext<T>,
    cell: Arc<StdMutex<T>>,
    exited: bool,
}

impl<T: Send + 'static> AsyncMutContextGuard<T> {
    pub fn value(&self) -> MutexGuard<'_, T> {
        self.cell.lock().unwrap()
    }

    pub async fn apply(&self) -> Result<(), InvalidContextState> {
        self.ctx.apply().await
    }

    pub async fn cancel(&self) -> Result<(), InvalidContextState> {
        self.ctx.cancel().await
    }

    pub async fn exit(mut self) {
        self.exited = true;
        self.ctx.inner.exit_with(false).await;
    }
}

impl<T: Send + 'static> Drop for AsyncMutContextGuard<T> {
    fn drop(&mut self) {
        if !self.exited {
            self.ctx.inner.exit_blocking();
        }
    }
}

/// Builder for async contexts; mirrors [`crate::ContextBuilder`].
pub struct AsyncContextBuilder<T> {
    factory: AsyncFactory<T>,
    callbacks: CtxCallbacks<T>,
    mut_callbacks: MutCtxCallbacks<T>,
    finalizers: Vec<Arc<dyn Fn() + Send + Sync>>,
    sub_contexts: Vec<Arc<dyn RawAsyncContext>>,
    mut_children: Vec<Arc<dyn RawAsyncMutContext>>,
    force_rollback: bool,
    auto_apply: bool,
}

impl<T: Send + 'static> AsyncContextBuilder<T> {
    /// Builder over a synchronous value factory.
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let factory = Arc::new(factory);
        Self::from_async(move || {
            let factory = factory.clone();
            Box::pin(async move { (factory)() }) as BoxFuture<T>
        })
    }

    /// Builder over an asynchronous value factory; only the first entry
    /// awaits it.
    pub fn from_async<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            factory: Arc::new(move || Box::pin(factory()) as BoxFuture<T>),
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

    pub fn sub_context<U: Send + 'static>(mut self, ctx: AsyncContext<U>) -> Self {
        self.sub_contexts.push(Arc::new(ctx));
        self
    }

    pub fn mut_sub_context<U: Send + 'static>(mut self, ctx: AsyncMutContext<U>) -> Self {
        self.sub_contexts.push(Arc::new(ctx.clone()));
        self.mut_children.push(Arc::new(ctx));
        self
    }

    pub fn force_rollback(mut self, yes: bool) -> Self {
        self.force_rollback = yes;
        self
    }

    pub fn auto_apply(mut self, yes: bool) -> Self {
        self.auto_apply = yes;
        self
    }

    pub fn build(self) -> AsyncContext<T> {
        AsyncContext {
            inner: Arc::new(AsyncCtxInner {
                id: next_ctx_id(),
                factory: self.factory,
                callbacks: self.callbacks,
                mut_part: None,
                finalizers: self.finalizers,
                sub_contexts: self.sub_contexts,
                state: AsyncMutex::new(State::Idle),
            }),
        }
    }

    pub fn build_mut(self) -> AsyncMutContext<T> {
        let MutCtxCallbacks {
            common,
            on_apply,
            on_cancel,
        } = self.mut_callbacks;
        let callbacks = crate::context::merge_callbacks(self.callbacks, common);
        AsyncMutContext {
            inner: Arc::new(AsyncCtxInner {
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
                state: AsyncMutex::new(State::Idle),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn nested_entries_share_one_value() {
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        let ctx = AsyncContextBuilder::from_async(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                7u32
            }
        })
        .build();

        let outer = ctx.enter().await;
        let inner = ctx.enter().await;
        assert_eq!(*inner.value(), 7);
        inner.exit().await;
        assert_eq!(created.load(Ordering::SeqCst), 1);
        outer.exit().await;

        let again = ctx.enter().await;
        assert_eq!(created.load(Ordering::SeqCst), 2);
        again.exit().await;
    }

    #[tokio::test]
    async fn dropped_guard_still_runs_finalizers() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let ctx = AsyncContextBuilder::new(|| ())
            .finalizer(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        {
            let _guard = ctx.enter().await;
            // cancelled task: guard dropped without exit().await
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mut_apply_round_trip() {
        let committed = Arc::new(AtomicUsize::new(0));
        let c = committed.clone();
        let ctx = AsyncContextBuilder::new(|| 1u8)
            .mut_callbacks(MutCtxCallbacks::new().on_apply(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .build_mut();

        let guard = ctx.enter().await;
        guard.apply().await.unwrap();
        assert_eq!(
            guard.cancel().await,
            Err(InvalidContextState::CancelOnApplied)
        );
        guard.exit().await;
        assert_eq!(committed.load(Ordering::SeqCst), 1);
    }
}
