//! Poll-with-callback sources and observer-of-observer unwrapping.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use signal_flow::{
    make_observer, make_static_observer, observe_source, unwrap_observer, wait_for_all_updates,
    ChangeNotifier, ObservableSource, Source,
};

struct FeedState {
    value: AtomicI32,
    fetches: AtomicUsize,
    fetch_delay: Duration,
    detached: AtomicBool,
    notifier: Mutex<Option<ChangeNotifier>>,
}

impl FeedState {
    fn new(value: i32) -> Self {
        Self::with_delay(value, Duration::ZERO)
    }

    fn with_delay(value: i32, fetch_delay: Duration) -> Self {
        FeedState {
            value: AtomicI32::new(value),
            fetches: AtomicUsize::new(0),
            fetch_delay,
            detached: AtomicBool::new(false),
            notifier: Mutex::new(None),
        }
    }

    fn notify(&self) {
        self.notifier
            .lock()
            .unwrap()
            .as_ref()
            .expect("subscription not established")
            .notify();
    }
}

struct FakeFeed {
    state: Arc<FeedState>,
}

impl ObservableSource for FakeFeed {
    type Value = i32;

    fn current_value(&self) -> i32 {
        self.state.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.state.fetch_delay.is_zero() {
            std::thread::sleep(self.state.fetch_delay);
        }
        self.state.value.load(Ordering::SeqCst)
    }

    fn subscribe_for_changes(&self, notifier: ChangeNotifier) {
        *self.state.notifier.lock().unwrap() = Some(notifier);
    }

    fn detach(&self) {
        self.state.detached.store(true, Ordering::SeqCst);
    }
}

#[test]
fn poll_source_lifecycle() {
    let state = Arc::new(FeedState::new(42));
    let observer = observe_source(FakeFeed {
        state: state.clone(),
    });

    // One fetch before the subscription and one after, closing the race.
    assert_eq!(*observer.get(), 42);
    assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
    assert!(state.notifier.lock().unwrap().is_some());

    state.value.store(24, Ordering::SeqCst);
    state.notify();
    wait_for_all_updates();
    assert_eq!(*observer.get(), 24);
    assert_eq!(state.fetches.load(Ordering::SeqCst), 3);

    drop(observer);
    wait_for_all_updates();
    assert!(state.detached.load(Ordering::SeqCst));

    // Notifications after detach cannot start another fetch.
    let fetches = state.fetches.load(Ordering::SeqCst);
    state.notify();
    wait_for_all_updates();
    assert_eq!(state.fetches.load(Ordering::SeqCst), fetches);
}

#[test]
fn poll_source_coalesces_notification_bursts() {
    let state = Arc::new(FeedState::with_delay(7, Duration::from_micros(500)));
    let observer = observe_source(FakeFeed {
        state: state.clone(),
    });
    wait_for_all_updates();

    for _ in 0..1_000 {
        state.notify();
    }
    wait_for_all_updates();

    assert_eq!(*observer.get(), 7);
    assert!(state.fetches.load(Ordering::SeqCst) < 500);
}

#[test]
fn unwrap_through_selector() {
    let selector = Source::new(true);
    let on_true = Source::new(1);
    let on_false = Source::new(2);

    let chosen = {
        let selector = selector.observer();
        let on_true = on_true.observer();
        let on_false = on_false.observer();
        make_observer(move || {
            if *selector.get() {
                on_true.clone()
            } else {
                on_false.clone()
            }
        })
    };
    let unwrapped = unwrap_observer(chosen);
    assert_eq!(*unwrapped.get(), 1);

    selector.set(false);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get(), 2);

    on_false.set(3);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get(), 3);

    on_true.set(4);
    selector.set(true);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get(), 4);
}

#[test]
fn source_of_observers_unwraps() {
    let first = Source::new(1);
    let second = Source::new(2);
    let holder = Source::new(first.observer());
    let unwrapped = unwrap_observer(holder.observer());

    assert_eq!(*unwrapped.get(), 1);

    first.set(3);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get(), 3);

    holder.set(second.observer());
    wait_for_all_updates();
    assert_eq!(*unwrapped.get(), 2);

    second.set(4);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get(), 4);

    // The detached inner source no longer propagates through the unwrap.
    let version = unwrapped.get_snapshot().version();
    first.set(9);
    wait_for_all_updates();
    assert_eq!(unwrapped.get_snapshot().version(), version);
}

#[test]
fn static_observers_and_default_sources() {
    let fixed = make_static_observer("hello".to_string());
    assert_eq!(*fixed.get(), "hello");

    let numbers: Source<i32> = Source::new_default();
    assert_eq!(*numbers.observer().get(), 0);

    let strings: Source<String> = Source::default();
    assert_eq!(*strings.observer().get(), "");
}
