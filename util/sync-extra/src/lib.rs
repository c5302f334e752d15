use std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub trait MutexExtra {
    type Value: ?Sized;

    fn lock_unwrap(&self) -> MutexGuard<'_, Self::Value>;
}

impl<T: ?Sized> MutexExtra for Mutex<T> {
    type Value = T;

    fn lock_unwrap(&self) -> MutexGuard<'_, Self::Value> {
        self.lock().expect("lock is poisioned")
    }
}

pub trait RwLockExtra {
    type Value: ?Sized;

    fn read_unwrap(&self) -> RwLockReadGuard<'_, Self::Value>;
    fn write_unwrap(&self) -> RwLockWriteGuard<'_, Self::Value>;
}

impl<T: ?Sized> RwLockExtra for RwLock<T> {
    type Value = T;

    fn read_unwrap(&self) -> RwLockReadGuard<'_, Self::Value> {
        self.read().expect("lock is poisioned")
    }

    fn write_unwrap(&self) -> RwLockWriteGuard<'_, Self::Value> {
        self.write().expect("lock is poisioned")
    }
}

pub trait CondvarExtra {
    fn wait_unwrap<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T>;

    /// Wait for at most `timeout`. Returns the guard and whether the wait timed out.
    fn wait_timeout_unwrap<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool);
}

impl CondvarExtra for Condvar {
    fn wait_unwrap<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait(guard).expect("lock is poisioned")
    }

    fn wait_timeout_unwrap<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let (guard, result) = self
            .wait_timeout(guard, timeout)
            .expect("lock is poisioned");
        (guard, result.timed_out())
    }
}
