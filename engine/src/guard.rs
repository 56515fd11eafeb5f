//! Process-wide slot remembering the last started connection manager.
//!
//! Only consulted when [`SyncConfig::reinit_guard`](crate::SyncConfig) is on.
//! It exists for hosts that re-create their engine without shutting the
//! previous one down (dev reloads); hosts that own their engine explicitly
//! can leave it off.

use std::sync::{Arc, Mutex, Weak};

use crate::ConnectionManager;

static LAST_MANAGER: Mutex<Option<Weak<ConnectionManager>>> = Mutex::new(None);

/// Record `manager` as the live one and return the previous live manager,
/// if it is a different one.
pub(crate) fn claim(manager: &Arc<ConnectionManager>) -> Option<Arc<ConnectionManager>> {
    let mut slot = LAST_MANAGER.lock().unwrap_or_else(|e| e.into_inner());
    let previous = slot
        .replace(Arc::downgrade(manager))
        .and_then(|weak| weak.upgrade());
    previous.filter(|prev| !Arc::ptr_eq(prev, manager))
}

/// Forget `manager` if it is the one recorded.
pub(crate) fn release(manager: &Arc<ConnectionManager>) {
    let mut slot = LAST_MANAGER.lock().unwrap_or_else(|e| e.into_inner());
    if slot
        .as_ref()
        .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(manager)))
    {
        *slot = None;
    }
}
