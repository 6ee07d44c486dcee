//! Named fault-injection points.
//!
//! A failpoint is armed for the current thread with [`enable`], or for the whole
//! process through the comma-separated `STRATA_FAILPOINTS` variable. Code under
//! test calls [`maybe_fail`] at the point where a crash should be simulated.

use std::cell::RefCell;
use std::collections::HashSet;

use crate::error::{Error, Result};

/// Fires after an insert record reaches the log but before the page is touched.
pub const INSERT_AFTER_LOG: &str = "data_manager::insert::after_log";
/// Fires after an update record reaches the log but before the write latch is dropped.
pub const UPDATE_AFTER_LOG: &str = "data_item::after::after_log";

const FAILPOINTS_VAR: &str = "STRATA_FAILPOINTS";

thread_local! {
    static ARMED: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Arms `name` on this thread until [`disable`] or [`clear`].
pub fn enable(name: &str) {
    ARMED.with(|armed| {
        armed.borrow_mut().insert(name.to_owned());
    });
}

pub fn disable(name: &str) {
    ARMED.with(|armed| {
        armed.borrow_mut().remove(name);
    });
}

/// Disarms every failpoint armed on this thread. The environment is not consulted.
pub fn clear() {
    ARMED.with(|armed| armed.borrow_mut().clear());
}

/// Whether `name` fires here: armed on this thread, or listed in `STRATA_FAILPOINTS`.
pub fn is_enabled(name: &str) -> bool {
    ARMED.with(|armed| armed.borrow().contains(name)) || armed_by_env(name)
}

fn armed_by_env(name: &str) -> bool {
    match std::env::var(FAILPOINTS_VAR) {
        Ok(list) => list.split(',').map(str::trim).any(|armed| armed == name),
        Err(_) => false,
    }
}

/// Returns `Error::Injected` when `name` is enabled.
pub fn maybe_fail(name: &str) -> Result<()> {
    if is_enabled(name) {
        tracing::warn!(failpoint = name, "failpoint triggered");
        Err(Error::Injected {
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}
