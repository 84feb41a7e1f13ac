//! Value-equality filtering adapter.
//!
//! A filtered observer republishes only when the new value differs from the
//! previously published one, which suppresses dependent propagation and
//! callback invocations for no-op updates.

use std::panic;
use std::sync::Arc;

use crate::node::{EqFn, EvalFn, InitialFailure};
use crate::observer::Observer;

/// Wrap `source` so dependents and callbacks only fire when the observed
/// value actually changes by `PartialEq`.
pub fn make_value_observer<T>(source: Observer<T>) -> Observer<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    let eval: EvalFn<T> = Box::new(move || Ok(source.get_snapshot().value()));
    construct_deduped(eval)
}

/// Closure flavor of [`make_value_observer`]: build the filtered observer
/// directly from an evaluator.
pub fn make_value_observer_with<T, F>(evaluator: F) -> Observer<T>
where
    T: PartialEq + Send + Sync + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    let eval: EvalFn<T> = Box::new(move || Ok(Arc::new(evaluator())));
    construct_deduped(eval)
}

fn construct_deduped<T>(eval: EvalFn<T>) -> Observer<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    let value_eq: EqFn<T> = Box::new(|previous, next| previous == next);
    match Observer::construct(eval, Some(value_eq)) {
        Ok(observer) => observer,
        Err(InitialFailure::Panicked(payload)) => panic::resume_unwind(payload),
        Err(InitialFailure::Nil) => unreachable!("filter evaluators cannot return nil"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::wait_for_all_updates;
    use crate::source::Source;

    #[test]
    fn filtered_observers_skip_equal_republications() {
        let source = Source::new(1);
        let filtered = make_value_observer(source.observer());
        let first = filtered.get_snapshot().version();

        source.set(1);
        wait_for_all_updates();
        assert_eq!(filtered.get_snapshot().version(), first);

        source.set(2);
        wait_for_all_updates();
        assert_eq!(*filtered.get(), 2);
        assert!(filtered.get_snapshot().version() > first);
    }
}
