use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Which waiters, if any, to wake when a [`Guarded`] is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notify {
    /// Wake nobody.
    None,
    /// Wake exactly one waiter.
    One,
    /// Wake every waiter.
    All,
}

/// A mutually-excluded value with an attached condition variable.
///
/// Mirrors the `NotifyingGuardedValue` the supervisor (C4) keeps its
/// per-stub-PID table behind: callers acquire the value plainly, acquire it
/// only once a predicate holds (re-checked on every notification), or
/// release it while waking some subset of waiters.
pub struct GuardedValue<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> GuardedValue<T> {
    /// Wraps `value` behind a fresh mutex and condition variable.
    pub fn new(value: T) -> Self {
        Self {
            mutex: Mutex::new(value),
            condvar: Condvar::new(),
        }
    }

    /// Acquires the value unconditionally. `notify` says what to do when
    /// the returned guard is dropped.
    pub fn acquire(&self, notify: Notify) -> Guarded<'_, T> {
        let guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        Guarded {
            guard,
            condvar: &self.condvar,
            notify,
        }
    }

    /// Blocks until `predicate` holds, re-checking it every time another
    /// thread notifies this value's condition variable. The returned guard
    /// notifies nobody on release by default — callers that mutate after
    /// acquiring-when should still pick the right [`Notify`] by building
    /// their own follow-up `acquire`.
    pub fn acquire_when<F>(&self, mut predicate: F) -> Guarded<'_, T>
    where
        F: FnMut(&T) -> bool,
    {
        let guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let guard = self
            .condvar
            .wait_while(guard, |value| !predicate(value))
            .unwrap_or_else(|e| e.into_inner());
        Guarded {
            guard,
            condvar: &self.condvar,
            notify: Notify::None,
        }
    }
}

/// A held lock on a [`GuardedValue`]. On drop, wakes waiters per the
/// [`Notify`] mode it was acquired with.
pub struct Guarded<'a, T> {
    guard: MutexGuard<'a, T>,
    condvar: &'a Condvar,
    notify: Notify,
}

impl<'a, T> Guarded<'a, T> {
    /// Changes the notification that will happen when this guard drops.
    pub fn set_notify(&mut self, notify: Notify) {
        self.notify = notify;
    }
}

impl<T> Deref for Guarded<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Guarded<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for Guarded<'_, T> {
    fn drop(&mut self) {
        match self.notify {
            Notify::None => {}
            Notify::One => self.condvar.notify_one(),
            Notify::All => self.condvar.notify_all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn acquire_when_wakes_on_notify_all() {
        let value = Arc::new(GuardedValue::new(false));

        let setter = {
            let value = Arc::clone(&value);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let mut guard = value.acquire(Notify::All);
                *guard = true;
            })
        };

        let guard = value.acquire_when(|ready| *ready);
        assert!(*guard);
        setter.join().unwrap();
    }
}
