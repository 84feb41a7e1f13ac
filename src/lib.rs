#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod error;
mod filter;
mod manager;
mod node;
mod observer;
mod recorder;
mod snapshot;
mod source;

pub use error::Error;
pub use filter::{make_value_observer, make_value_observer_with};
pub use manager::{
    currently_evaluating, run_on_manager_thread, try_wait_for_all_updates, wait_for_all_updates,
};
pub use observer::{
    make_observer, make_static_observer, try_make_observer, unwrap_observer, CallbackHandle,
    Observer,
};
pub use snapshot::{Epoch, NodeId, Snapshot, Version};
pub use source::{observe_source, ChangeNotifier, ObservableSource, Source};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Source<i32>>();
        assert_sync::<Source<i32>>();
        assert_send::<Observer<i32>>();
        assert_sync::<Observer<i32>>();
        assert_send::<Snapshot<i32>>();
        assert_sync::<Snapshot<i32>>();
        assert_send::<CallbackHandle>();
        assert_send::<ChangeNotifier>();
        assert_sync::<ChangeNotifier>();
    }
}
