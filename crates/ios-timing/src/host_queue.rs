use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe inbox of `(delay, event)` pairs produced off the emulation thread.
///
/// Cloning shares the same inbox.
#[derive(Debug)]
pub struct HostEventQueue<E> {
    inner: Arc<Mutex<Vec<(u64, E)>>>,
}

impl<E> Clone for HostEventQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for HostEventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> HostEventQueue<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, E)>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, delay: u64, event: E) {
        self.lock().push((delay, event));
    }

    pub fn drain(&self) -> Vec<(u64, E)> {
        std::mem::take(&mut *self.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the undelivered events, oldest first.
    pub fn pending(&self) -> Vec<(u64, E)>
    where
        E: Clone,
    {
        self.lock().clone()
    }
}
