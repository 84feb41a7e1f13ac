//! Cycle tolerance, nested construction, and construction failures.

use std::sync::{Arc, Mutex, OnceLock};

use signal_flow::{
    make_observer, try_make_observer, try_wait_for_all_updates, wait_for_all_updates, Error,
    Observer, Source,
};

#[test]
fn cycle_reads_previous_snapshot() {
    let source = Source::new(0usize);
    let b_slot: Arc<OnceLock<Observer<usize>>> = Arc::new(OnceLock::new());

    // `a` closes a cycle through `b` only when the source reads 1.
    let a = {
        let input = source.observer();
        let b_slot = b_slot.clone();
        make_observer(move || {
            let value = *input.get();
            if value == 1 {
                if let Some(b) = b_slot.get() {
                    let _ = *b.get();
                }
            }
            value
        })
    };
    let b = {
        let a = a.clone();
        make_observer(move || *a.get())
    };
    let _ = b_slot.set(b.clone());

    let collect = {
        let input = source.observer();
        let a = a.clone();
        let b = b.clone();
        make_observer(move || {
            let value = *input.get();
            let _ = *a.get();
            let _ = *b.get();
            value
        })
    };
    assert_eq!(*collect.get(), 0);

    for i in 1..=3 {
        source.set(i);
        wait_for_all_updates();

        assert_eq!(*collect.get(), i);
        assert_eq!(*a.get(), i);
        if i == 1 {
            // While the cycle is closed, `b` saw `a`'s previous snapshot.
            assert_eq!(*b.get(), 0);
        } else {
            assert_eq!(*b.get(), i);
        }
    }
}

fn chained(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    *make_observer(move || chained(n - 1) + 1).get()
}

#[test]
fn nested_construction_recurses() {
    assert_eq!(chained(32), 32);
}

#[test]
fn failed_first_evaluation_propagates() {
    let panicked = std::panic::catch_unwind(|| make_observer(|| -> i32 { panic!("boom") }));
    assert!(panicked.is_err());

    let nil = try_make_observer(|| None::<i32>);
    assert!(matches!(nil, Err(Error::NilResult)));

    let failed = try_make_observer(|| -> Option<i32> { panic!("boom") });
    assert!(matches!(
        failed,
        Err(Error::InitialEvaluationFailure { .. })
    ));
}

#[test]
fn nil_result_keeps_prior_snapshot() {
    let source = Source::new(41);
    let odd_doubled = {
        let input = source.observer();
        try_make_observer(move || {
            let value = *input.get();
            (value % 2 != 0).then(|| value * 2)
        })
        .unwrap()
    };
    assert_eq!(*odd_doubled.get(), 82);

    source.set(2);
    wait_for_all_updates();
    assert_eq!(*odd_doubled.get(), 82);
    assert!(odd_doubled.failure_count() >= 1);
    assert!(odd_doubled.last_failure().is_some());

    source.set(23);
    wait_for_all_updates();
    assert_eq!(*odd_doubled.get(), 46);
}

#[test]
fn runtime_panics_keep_prior_snapshot() {
    let source = Source::new(1);
    let fussy = {
        let input = source.observer();
        make_observer(move || {
            let value = *input.get();
            if value == 13 {
                panic!("unlucky");
            }
            value * 10
        })
    };
    let downstream = {
        let fussy = fussy.clone();
        make_observer(move || *fussy.get() + 1)
    };
    assert_eq!(*downstream.get(), 11);

    source.set(13);
    wait_for_all_updates();
    // The failed node keeps its snapshot and dependents are untouched.
    assert_eq!(*fussy.get(), 10);
    assert_eq!(*downstream.get(), 11);
    assert_eq!(fussy.failure_count(), 1);

    source.set(2);
    wait_for_all_updates();
    assert_eq!(*fussy.get(), 20);
    assert_eq!(*downstream.get(), 21);
}

#[test]
fn quiescence_wait_inside_evaluator_is_rejected() {
    let outcome = Arc::new(Mutex::new(None));
    let _observer = {
        let outcome = outcome.clone();
        make_observer(move || {
            *outcome.lock().unwrap() = Some(try_wait_for_all_updates());
            0
        })
    };
    let outcome = outcome.lock().unwrap().clone();
    assert!(matches!(
        outcome,
        Some(Err(Error::QuiescenceFromEvaluator))
    ));
}
