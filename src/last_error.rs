//! Per-thread last-error slot.
//!
//! The reader and task-runner threads have no `Result` channel back to the
//! user; faults they encounter are logged and parked here, where the
//! embedding application can collect them from any callback running on the
//! same thread.

use crate::FeedError;
use std::cell::RefCell;

thread_local! {
    static LAST_ERROR: RefCell<Option<FeedError>> = const { RefCell::new(None) };
}

/// Records `error` as the current thread's last error.
///
/// Idempotent in the sense that a later error simply replaces the earlier
/// one; there is no accumulation.
pub(crate) fn set_last_error(error: FeedError) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(error));
}

/// Takes and clears the current thread's last error.
pub fn pop_last_error() -> Option<FeedError> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}
