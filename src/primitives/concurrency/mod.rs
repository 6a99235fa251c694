#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Binary semaphore serializing write transactions inside one process.
///
/// Readers never touch it. The background flush uses [`try_acquire`] so it
/// only runs while no writer is active.
///
/// [`try_acquire`]: WriterSemaphore::try_acquire
#[derive(Clone, Default)]
pub struct WriterSemaphore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    held: Mutex<bool>,
    released: Condvar,
}

/// Snapshot of semaphore state for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct SemaphoreSnapshot {
    /// Whether a writer currently holds the permit.
    pub writer: bool,
}

/// Permit representing the held writer slot; released on drop.
pub struct WriterPermit {
    inner: Arc<Inner>,
}

impl WriterSemaphore {
    /// Creates a free semaphore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the writer slot is free and takes it.
    pub fn acquire(&self) -> WriterPermit {
        let mut held = self.inner.held.lock();
        while *held {
            self.inner.released.wait(&mut held);
        }
        *held = true;
        trace!("writer.acquire");
        WriterPermit {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Takes the writer slot if it is free.
    pub fn try_acquire(&self) -> Option<WriterPermit> {
        let mut held = self.inner.held.lock();
        if *held {
            return None;
        }
        *held = true;
        Some(WriterPermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Waits up to `timeout` for the writer slot.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<WriterPermit> {
        let mut held = self.inner.held.lock();
        while *held {
            if self
                .inner
                .released
                .wait_for(&mut held, timeout)
                .timed_out()
            {
                if *held {
                    return None;
                }
                break;
            }
        }
        *held = true;
        Some(WriterPermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Returns a snapshot of the current state.
    pub fn snapshot(&self) -> SemaphoreSnapshot {
        SemaphoreSnapshot {
            writer: *self.inner.held.lock(),
        }
    }
}

impl Drop for WriterPermit {
    fn drop(&mut self) {
        let mut held = self.inner.held.lock();
        *held = false;
        drop(held);
        self.inner.released.notify_one();
        trace!("writer.release");
    }
}
