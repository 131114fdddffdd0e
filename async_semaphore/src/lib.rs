//! A weighted, async-acquirable counting semaphore. The backend layer (§4.G)
//! uses one of these per resource class (cpu, mem, tmp) to gate admission:
//! `submit` enqueues a job, `launch` pops as many as the available permits
//! allow, and resources are released when the job ends or is killed.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};

#[derive(Clone)]
pub struct AsyncSemaphore {
    inner: Arc<Semaphore>,
    total: usize,
}

/// A held permit for `weight` units of a resource. Dropping it releases the
/// units back to the pool — this is what lets the backend layer simply drop
/// the guard on job end/kill rather than tracking release bookkeeping.
pub struct Permit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl AsyncSemaphore {
    pub fn new(total: usize) -> AsyncSemaphore {
        AsyncSemaphore {
            inner: Arc::new(Semaphore::new(total)),
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Acquires `weight` units, waiting if necessary. A `weight` larger than
    /// `total` would wait forever; callers (the backend layer) are expected
    /// to reject jobs whose resource request exceeds the pool's capacity
    /// before ever calling this.
    pub async fn acquire(&self, weight: usize) -> Permit<'_> {
        let permit = self
            .inner
            .acquire_many(weight as u32)
            .await
            .expect("semaphore is never closed");
        Permit { _permit: permit }
    }

    /// Non-blocking variant used by the backend's `launch()` admission loop,
    /// which wants to pop as many queued jobs as currently fit without
    /// waiting for any one of them.
    pub fn try_acquire(&self, weight: usize) -> Option<Permit<'_>> {
        self.inner
            .try_acquire_many(weight as u32)
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// `'static` variant of [`acquire`](Self::acquire), used by the backend
    /// layer (§4.G) which holds a resource permit inside a per-job table
    /// entry for the job's whole lifetime rather than a single stack frame.
    pub async fn acquire_owned(&self, weight: usize) -> OwnedPermit {
        let permit = Arc::clone(&self.inner)
            .acquire_many_owned(weight as u32)
            .await
            .expect("semaphore is never closed");
        OwnedPermit { _permit: permit }
    }

    pub fn try_acquire_owned(&self, weight: usize) -> Option<OwnedPermit> {
        Arc::clone(&self.inner)
            .try_acquire_many_owned(weight as u32)
            .ok()
            .map(|permit| OwnedPermit { _permit: permit })
    }
}

/// An owned, `'static` held permit — see [`AsyncSemaphore::acquire_owned`].
pub struct OwnedPermit {
    _permit: OwnedSemaphorePermit,
}
