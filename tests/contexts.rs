//! Context re-entrance, finalisation, and commit/rollback semantics.

use std::any::TypeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use modulith::{
    current_context, current_scope_id, ContextBuilder, CtxCallbacks, InvalidContextState,
    MutCtxCallbacks, SyncContext, SyncMutContext,
};

#[test]
fn nested_entries_run_the_factory_once() {
    let created = Arc::new(AtomicUsize::new(0));
    let finalised = Arc::new(AtomicUsize::new(0));

    let c = created.clone();
    let f = finalised.clone();
    let ctx = ContextBuilder::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
        "value".to_string()
    })
    .finalizer(move || {
        f.fetch_add(1, Ordering::SeqCst);
    })
    .build();

    {
        let g1 = ctx.enter();
        let g2 = ctx.enter();
        let g3 = ctx.enter();
        assert_eq!(&*g3.value(), "value");
        drop(g2);
        drop(g1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(finalised.load(Ordering::SeqCst), 0);
        drop(g3);
    }
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(finalised.load(Ordering::SeqCst), 1);
}

#[test]
fn enter_exit_hooks_fire_on_boundary_transitions_only() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2, l3, l4) = (log.clone(), log.clone(), log.clone(), log.clone());

    let ctx = ContextBuilder::new(|| 0u8)
        .callbacks(
            CtxCallbacks::new()
                .on_enter(move |_| l1.lock().unwrap().push("enter"))
                .on_exit(move |_| l2.lock().unwrap().push("exit"))
                .on_nested_enter(move |_| l3.lock().unwrap().push("nested-enter"))
                .on_nested_exit(move |_| l4.lock().unwrap().push("nested-exit")),
        )
        .build();

    {
        let _outer = ctx.enter();
        {
            let _inner = ctx.enter();
        }
    }
    assert_eq!(
        *log.lock().unwrap(),
        vec!["enter", "nested-enter", "nested-exit", "exit"]
    );
}

#[test]
fn apply_state_machine_rules() {
    let ctx = SyncMutContext::new(Vec::<u8>::new);

    assert_eq!(ctx.apply(), Err(InvalidContextState::ApplyOnIdle));

    let guard = ctx.enter();
    guard.apply().unwrap();
    guard.apply().unwrap(); // applied -> applied is a no-op
    assert_eq!(guard.cancel(), Err(InvalidContextState::CancelOnApplied));
    drop(guard);

    let guard = ctx.enter();
    guard.cancel().unwrap();
    guard.cancel().unwrap(); // cancelled -> cancelled is a no-op
    assert_eq!(guard.apply(), Err(InvalidContextState::ApplyOnCancelled));
}

#[test]
fn force_rollback_wins_over_auto_apply() {
    let applied = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));
    let (a, c) = (applied.clone(), cancelled.clone());

    let ctx = ContextBuilder::new(|| 0u8)
        .mut_callbacks(
            MutCtxCallbacks::new()
                .on_apply(move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                })
                .on_cancel(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .force_rollback(true)
        .auto_apply(true)
        .build_mut();

    {
        let _guard = ctx.enter();
    }
    assert_eq!(applied.load(Ordering::SeqCst), 0);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

#[test]
fn auto_apply_commits_on_clean_exit() {
    let applied = Arc::new(AtomicUsize::new(0));
    let a = applied.clone();

    let ctx = ContextBuilder::new(|| 0u8)
        .mut_callbacks(MutCtxCallbacks::new().on_apply(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        }))
        .auto_apply(true)
        .build_mut();

    {
        let _guard = ctx.enter();
    }
    assert_eq!(applied.load(Ordering::SeqCst), 1);
}

#[test]
fn mutable_children_apply_before_the_parent() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    let child = ContextBuilder::new(|| 0u8)
        .mut_callbacks(MutCtxCallbacks::new().on_apply(move |_| l.lock().unwrap().push("child")))
        .build_mut();

    let l = log.clone();
    let parent = ContextBuilder::new(|| 0u8)
        .mut_callbacks(MutCtxCallbacks::new().on_apply(move |_| l.lock().unwrap().push("parent")))
        .mut_sub_context(child)
        .build_mut();

    let guard = parent.enter();
    guard.apply().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["child", "parent"]);
    drop(guard);
}

#[test]
fn current_context_reflects_the_per_type_stack() {
    let ctx = SyncContext::new(|| 1.5f64);

    assert!(current_context(Some(TypeId::of::<f64>())).is_none());
    assert!(current_scope_id(None).starts_with("thread:"));

    let guard = ctx.enter();
    let handle = current_context(Some(TypeId::of::<f64>())).unwrap();
    assert_eq!(handle.ident(), ctx.ident());
    assert_eq!(current_scope_id(None), format!("ctx:{}", ctx.ident()));
    drop(guard);

    assert!(current_context(Some(TypeId::of::<f64>())).is_none());
}

#[test]
fn per_type_stacks_are_thread_local() {
    let ctx = SyncContext::new(|| 7u128);
    let _guard = ctx.enter();

    let seen = std::thread::spawn(|| current_context(Some(TypeId::of::<u128>())))
        .join()
        .unwrap();
    assert!(seen.is_none());
}

#[tokio::test]
async fn async_contexts_share_value_across_nested_entries() {
    use modulith::AsyncContextBuilder;

    let created = Arc::new(AtomicUsize::new(0));
    let c = created.clone();
    let ctx = AsyncContextBuilder::from_async(move || {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            vec![1u8, 2, 3]
        }
    })
    .build();

    let outer = ctx.enter().await;
    let inner = ctx.enter().await;
    assert_eq!(inner.value().len(), 3);
    inner.exit().await;
    outer.exit().await;
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let again = ctx.enter().await;
    again.exit().await;
    assert_eq!(created.load(Ordering::SeqCst), 2);
}
