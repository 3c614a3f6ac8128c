use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

struct Versioned<T> {
    generation: u64,
    value: T,
}

/// A value paired with a condition variable that fires whenever it changes.
///
/// [`acquire`](Self::acquire) locks the value so a caller can inspect it and
/// then [`wait`](ConditionGuard::wait) for the next change without missing an
/// update in between.
pub struct UpdateCondition<T> {
    state: Mutex<Versioned<T>>,
    changed: Condvar,
}

impl<T> UpdateCondition<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(Versioned {
                generation: 0,
                value,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> ConditionGuard<'_, T> {
        ConditionGuard {
            guard: self.state.lock(),
            changed: &self.changed,
        }
    }

    /// Modify the value and wake every waiter.
    pub(crate) fn update(&self, f: impl FnOnce(&mut T)) {
        let mut state = self.state.lock();
        f(&mut state.value);
        state.generation = state.generation.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Number of updates so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

impl<T: Default> Default for UpdateCondition<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Holds the lock of an [`UpdateCondition`].
///
/// Do not call back into the stream manager while holding a guard; the
/// reader thread takes the manager lock before this one.
pub struct ConditionGuard<'a, T> {
    guard: MutexGuard<'a, Versioned<T>>,
    changed: &'a Condvar,
}

impl<T> ConditionGuard<'_, T> {
    pub fn value(&self) -> &T {
        &self.guard.value
    }

    /// Number of updates so far.
    pub fn generation(&self) -> u64 {
        self.guard.generation
    }

    /// Release the lock until the value next changes, then re-acquire it.
    ///
    /// Returns `false` if `timeout` elapsed first. Spurious wakeups are
    /// absorbed.
    pub fn wait(&mut self, timeout: Option<Duration>) -> bool {
        let seen = self.guard.generation;
        match timeout {
            None => {
                while self.guard.generation == seen {
                    self.changed.wait(&mut self.guard);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while self.guard.generation == seen {
                    if self.changed.wait_until(&mut self.guard, deadline).timed_out() {
                        return self.guard.generation != seen;
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_wait_times_out_without_update() {
        let condition = UpdateCondition::new(0u32);
        let mut guard = condition.acquire();
        assert!(!guard.wait(Some(Duration::from_millis(10))));
        assert_eq!(*guard.value(), 0);
    }

    #[test]
    fn test_wait_sees_next_update() {
        let condition = Arc::new(UpdateCondition::new(0u32));
        let mut guard = condition.acquire();

        let writer = {
            let condition = Arc::clone(&condition);
            thread::spawn(move || condition.update(|v| *v = 5))
        };
        assert!(guard.wait(Some(Duration::from_secs(5))));
        assert_eq!(*guard.value(), 5);
        drop(guard);
        writer.join().unwrap();
        assert_eq!(condition.generation(), 1);
    }
}
