//! Shared-read guarded cell
//!
//! A value wrapped by a reader-writer lock. Writers are exclusive, readers
//! may overlap, and the timed try variants return an empty handle on expiry
//! rather than panicking on contention. Used for the handle registry and
//! the publication-to-subscription index, both of which are read from the
//! router task while federate callers mutate them during registration.

use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard};

/// A value guarded by a reader-writer lock.
#[derive(Debug, Default)]
pub struct Guarded<T> {
    inner: RwLock<T>,
}

/// A scoped shared-read handle.
///
/// Handles produced by the timed try variants may be empty; check
/// [`SharedHandle::is_valid`] or use [`SharedHandle::get`].
pub struct SharedHandle<'a, T> {
    guard: Option<RwLockReadGuard<'a, T>>,
}

impl<'a, T> SharedHandle<'a, T> {
    /// Whether the lock was actually acquired.
    pub fn is_valid(&self) -> bool {
        self.guard.is_some()
    }

    /// The guarded value, or `None` if the lock attempt expired.
    pub fn get(&self) -> Option<&T> {
        self.guard.as_deref()
    }
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Run `f` with shared access and return its result.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run `f` with exclusive access and return its result.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Copy the guarded value out.
    pub fn load(&self) -> T
    where
        T: Clone,
    {
        self.inner.read().clone()
    }

    /// Replace the guarded value.
    pub fn store(&self, value: T) {
        *self.inner.write() = value;
    }

    /// Acquire a shared handle, waiting as long as necessary.
    pub fn lock_shared(&self) -> SharedHandle<'_, T> {
        SharedHandle {
            guard: Some(self.inner.read()),
        }
    }

    /// Attempt a shared handle without waiting.
    pub fn try_lock_shared(&self) -> SharedHandle<'_, T> {
        SharedHandle {
            guard: self.inner.try_read(),
        }
    }

    /// Attempt a shared handle, waiting at most `timeout`.
    pub fn try_lock_shared_for(&self, timeout: Duration) -> SharedHandle<'_, T> {
        SharedHandle {
            guard: self.inner.try_read_for(timeout),
        }
    }

    /// Attempt a shared handle, waiting until `deadline`.
    pub fn try_lock_shared_until(&self, deadline: Instant) -> SharedHandle<'_, T> {
        SharedHandle {
            guard: self.inner.try_read_until(deadline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_modify_load_store() {
        let cell = Guarded::new(vec![1, 2, 3]);
        assert_eq!(cell.read(|v| v.len()), 3);

        cell.modify(|v| v.push(4));
        assert_eq!(cell.load(), vec![1, 2, 3, 4]);

        cell.store(vec![9]);
        assert_eq!(cell.read(|v| v[0]), 9);
    }

    #[test]
    fn test_shared_handles_overlap() {
        let cell = Guarded::new(7u32);
        let a = cell.lock_shared();
        let b = cell.try_lock_shared();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert_eq!(*b.get().unwrap(), 7);
    }

    #[test]
    fn test_timed_try_expires_under_writer() {
        let cell = std::sync::Arc::new(Guarded::new(0u32));
        let held = std::sync::Arc::clone(&cell);

        // Hold the write side in another thread while we attempt a timed read.
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let writer = std::thread::spawn(move || {
            held.modify(|v| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                *v += 1;
            });
        });

        started_rx.recv().unwrap();
        let handle = cell.try_lock_shared_for(Duration::from_millis(10));
        assert!(!handle.is_valid());
        assert!(handle.get().is_none());

        release_tx.send(()).unwrap();
        writer.join().unwrap();

        let handle = cell.try_lock_shared_until(Instant::now() + Duration::from_millis(50));
        assert!(handle.is_valid());
        assert_eq!(*handle.get().unwrap(), 1);
    }
}
