//! Property tests over the provider counter rules: counters never go
//! negative, mutual exclusion holds for every prefix of operations, and
//! forwarding moves at most once.

use proptest::prelude::*;

use modulith::{
    BorrowError, BorrowMutError, ForwardBox, ForwardError, ForwardProvider, MutProvider, Operator,
    OwnerRefBox, SharedProvider,
};

#[derive(Debug, Clone, Copy)]
enum Op {
    Borrow,
    Reclaim,
    Acquire,
    Release,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Borrow),
        Just(Op::Reclaim),
        Just(Op::Acquire),
        Just(Op::Release),
    ]
}

proptest! {
    #[test]
    fn owner_box_counters_obey_the_exclusion_table(ops in prop::collection::vec(op_strategy(), 0..64)) {
        let bx = OwnerRefBox::new(|| Some(1u32), || Some(2u64));
        let mut borrowed: Vec<u32> = Vec::new();
        let mut acquired: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                Op::Borrow => match bx.borrow() {
                    Ok(v) => {
                        prop_assert!(acquired.is_empty());
                        borrowed.push(v);
                    }
                    Err(e) => {
                        prop_assert!(!acquired.is_empty());
                        prop_assert!(matches!(e, BorrowError::BorrowedAsMutable(_)));
                    }
                },
                Op::Reclaim => {
                    if let Some(v) = borrowed.pop() {
                        bx.reclaim(v);
                    }
                }
                Op::Acquire => match bx.acquire() {
                    Ok(v) => {
                        prop_assert!(borrowed.is_empty());
                        prop_assert!(acquired.is_empty());
                        acquired.push(v);
                    }
                    Err(e) => {
                        prop_assert!(!borrowed.is_empty() || !acquired.is_empty());
                        if !acquired.is_empty() {
                            prop_assert!(matches!(e, BorrowMutError::AlreadyBorrowed(_)));
                        } else {
                            prop_assert!(matches!(e, BorrowMutError::BorrowedAsImmutable(_)));
                        }
                    }
                },
                Op::Release => {
                    if let Some(v) = acquired.pop() {
                        bx.release(v);
                    }
                }
            }
        }

        // return everything: a balanced sequence leaves both sides usable
        while let Some(v) = borrowed.pop() {
            bx.reclaim(v);
        }
        while let Some(v) = acquired.pop() {
            bx.release(v);
        }
        let m = bx.acquire();
        prop_assert!(m.is_ok());
        bx.release(m.unwrap());
        let s = bx.borrow();
        prop_assert!(s.is_ok());
        bx.reclaim(s.unwrap());
    }

    #[test]
    fn forward_box_never_yields_twice(values in prop::collection::vec(any::<i64>(), 0..8)) {
        let bx = ForwardBox::<i64>::new();
        let mut accepted = 0usize;
        for v in &values {
            if bx.accept(*v) {
                accepted += 1;
            }
        }
        // only the first accept lands
        prop_assert_eq!(accepted, usize::from(!values.is_empty()));

        let mut yields = 0usize;
        for _ in 0..4 {
            match bx.take() {
                Ok(v) => {
                    prop_assert_eq!(Some(&v), values.first());
                    yields += 1;
                }
                Err(e) => prop_assert!(matches!(e, ForwardError::Empty(_))),
            }
        }
        prop_assert!(yields <= 1);
    }
}
