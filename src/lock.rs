//! Poison-recovering lock acquisition.
//!
//! A panic while a store lock is held poisons it. Cached values are always
//! refetchable, so recovery unwraps the inner guard and logs instead of
//! propagating the poison to every later caller.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                source,
                lock_kind = "rwlock.read",
                result = "poisoned_recovered",
                hint = "cached state may be stale after a panic in another thread",
                "Recovered from poisoned store lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                source,
                lock_kind = "rwlock.write",
                result = "poisoned_recovered",
                hint = "cached state may be stale after a panic in another thread",
                "Recovered from poisoned store lock"
            );
            poisoned.into_inner()
        }
    }
}
