//! Lock acquisition helpers that recover from poisoning.
//!
//! Every shared structure in the crate sits behind one `std::sync` critical
//! section. A panic while a guard is held poisons the lock; subsequent
//! accessors recover the inner value and log a warning instead of
//! propagating the poison.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    component: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                component,
                op,
                lock_kind = "mutex",
                "recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    component: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                component,
                op,
                lock_kind = "rwlock.read",
                "recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    component: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                component,
                op,
                lock_kind = "rwlock.write",
                "recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn mutex_recovers_after_poison() {
        let lock = Mutex::new(0_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("first acquisition");
            panic!("poison the lock");
        }));

        *mutex_lock(&lock, "test", "poisoned") += 1;
        assert_eq!(*mutex_lock(&lock, "test", "read_back"), 1);
    }
}
