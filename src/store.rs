use std::sync::{Mutex, PoisonError};

/// Shared state cell whose mutations apply as one transaction.
///
/// Every read-modify-write goes through [`Store::update`], which runs the closure while
/// holding the lock. Callers must not await inside the closure; network results are written
/// back with a fresh `update` that re-reads current state.
#[derive(Debug, Default)]
pub struct Store<T> {
    inner: Mutex<T>,
}

impl<T> Store<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Swaps in a whole new value, returning the old one.
    pub fn replace(&self, value: T) -> T {
        self.update(|current| std::mem::replace(current, value))
    }
}

impl<T: Clone> Store<T> {
    pub fn snapshot(&self) -> T {
        self.read(Clone::clone)
    }
}
