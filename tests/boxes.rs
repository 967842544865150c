//! Provider box behaviour: borrow lifecycles, mutual exclusion, move-once
//! forwarding, and transactional context providers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use modulith::{
    BorrowError, BorrowFlags, BorrowMutError, ContextBuilder, ForwardBox, ForwardError,
    ForwardProvider, MutCtxRefBox, MutCtxCallbacks, MutProvider, MutRefBox, Operator,
    OwnerCtxRefBox, OwnerRefBox, PermanentForwardBox, SharedCtxRefBox, SharedProvider,
    SharedRefBox,
};

type Dict = HashMap<String, i64>;

#[test]
fn shared_borrow_lifecycle() {
    let bx = SharedRefBox::new(|| Some(123));

    let a = bx.borrow().unwrap();
    let b = bx.borrow().unwrap();
    assert_eq!(a, 123);
    assert_eq!(b, 123);
    bx.reclaim(a);
    bx.reclaim(b);

    // balanced again: further borrows keep working
    let c = bx.borrow().unwrap();
    assert_eq!(c, 123);
    bx.reclaim(c);
}

#[test]
fn mut_box_second_acquire_fails() {
    let bx = MutRefBox::new(|| Some(123));

    let first = bx.acquire().unwrap();
    let err = bx.acquire().unwrap_err();
    assert_eq!(err, BorrowMutError::AlreadyBorrowed("i32".into()));

    bx.release(first);
    assert_eq!(bx.acquire().unwrap(), 123);
}

#[test]
fn owner_box_mutual_exclusion() {
    let bx = OwnerRefBox::new(|| Some(123), || Some("123".to_string()));

    let a = bx.borrow().unwrap();
    let b = bx.borrow().unwrap();
    assert_eq!(b, 123);

    let err = bx.acquire().unwrap_err();
    assert_eq!(err, BorrowMutError::BorrowedAsImmutable("String".into()));

    bx.reclaim(a);
    bx.reclaim(b);

    let m = bx.acquire().unwrap();
    assert_eq!(m, "123");

    let err = bx.borrow().unwrap_err();
    assert_eq!(err, BorrowError::BorrowedAsMutable("i32".into()));

    bx.release(m);
    assert_eq!(bx.borrow().unwrap(), 123);
}

#[test]
fn forward_box_moves_exactly_once() {
    let bx = ForwardBox::<i64>::new();

    assert!(!bx.is_present());
    let err = bx.take().unwrap_err();
    assert_eq!(err, ForwardError::Empty("i64".into()));

    assert!(bx.accept(123));
    assert!(bx.is_present());

    let value = bx.take().unwrap();
    assert_eq!(value, 123);

    let err = bx.take().unwrap_err();
    assert_eq!(err, ForwardError::Empty("i64".into()));

    bx.dispose(value);
}

#[test]
fn forward_box_rejects_second_accept() {
    let bx = ForwardBox::new();
    assert!(bx.accept(1));
    assert!(!bx.accept(2));
    assert_eq!(bx.revoke(), Some(1));
    assert_eq!(bx.revoke(), None);
}

#[test]
fn permanent_forward_box_does_not_consume() {
    let bx = PermanentForwardBox::with_value(5u8);
    assert_eq!(bx.take().unwrap(), 5);
    assert_eq!(bx.take().unwrap(), 5);
    assert!(bx.is_present());
}

#[test]
fn shared_ctx_box_yields_contexts() {
    let bx = SharedCtxRefBox::new(ContextBuilder::new(|| 123));

    let first = bx.borrow().unwrap();
    let second = bx.borrow().unwrap();

    {
        let guard = first.enter();
        assert_eq!(*guard.value(), 123);
    }
    bx.reclaim(first);
    bx.reclaim(second);
}

#[test]
fn mut_ctx_box_is_exclusive() {
    let bx = MutCtxRefBox::new(ContextBuilder::new(|| 123));

    let ctx = bx.acquire().unwrap();
    let err = bx.acquire().unwrap_err();
    assert_eq!(err, BorrowMutError::AlreadyBorrowed("i32".into()));
    bx.release(ctx);

    let ctx = bx.acquire().unwrap();
    {
        let guard = ctx.enter();
        assert_eq!(*guard.value(), 123);
    }
    bx.release(ctx);
}

fn dict_owner_box() -> (Arc<Mutex<Dict>>, OwnerCtxRefBox<Dict, Dict>) {
    let store: Arc<Mutex<Dict>> = Arc::new(Mutex::new(
        [("counter".to_string(), 1)].into_iter().collect(),
    ));

    let read = store.clone();
    let shared = ContextBuilder::new(move || read.lock().unwrap().clone());

    let read = store.clone();
    let write = store.clone();
    let mutable = ContextBuilder::new(move || read.lock().unwrap().clone()).mut_callbacks(
        MutCtxCallbacks::new().on_apply(move |v: &Dict| {
            let mut store = write.lock().unwrap();
            store.clear();
            store.extend(v.clone());
        }),
    );

    let bx = OwnerCtxRefBox::new(shared, mutable).with_flags(BorrowFlags {
        allow_borrow_when_acquired: true,
        allow_acq_when_borrowed: true,
        allow_multiple_acquisition: false,
    });
    (store, bx)
}

#[test]
fn owning_context_commit_round_trip() {
    let (_store, bx) = dict_owner_box();

    // read the initial state
    let ctx = bx.borrow().unwrap();
    {
        let guard = ctx.enter();
        assert_eq!(guard.value()["counter"], 1);
    }
    bx.reclaim(ctx);

    // mutate without applying: nothing published
    let mut_ctx = bx.acquire().unwrap();
    {
        let guard = mut_ctx.enter();
        *guard.value().get_mut("counter").unwrap() += 1;
    }
    bx.release(mut_ctx);

    let ctx = bx.borrow().unwrap();
    {
        let guard = ctx.enter();
        assert_eq!(guard.value()["counter"], 1);
    }
    bx.reclaim(ctx);

    // mutate and apply: the next borrow observes the change
    let mut_ctx = bx.acquire().unwrap();
    {
        let guard = mut_ctx.enter();
        *guard.value().get_mut("counter").unwrap() += 1;
        guard.apply().unwrap();
    }
    bx.release(mut_ctx);

    let ctx = bx.borrow().unwrap();
    {
        let guard = ctx.enter();
        assert_eq!(guard.value()["counter"], 2);
    }
    bx.reclaim(ctx);
}

#[test]
fn owning_context_cancel_discards_the_change() {
    let (_store, bx) = dict_owner_box();

    let mut_ctx = bx.acquire().unwrap();
    {
        let guard = mut_ctx.enter();
        guard.value().insert("counter".into(), 99);
        guard.cancel().unwrap();
    }
    bx.release(mut_ctx);

    let ctx = bx.borrow().unwrap();
    {
        let guard = ctx.enter();
        assert_eq!(guard.value()["counter"], 1);
    }
    bx.reclaim(ctx);
}
