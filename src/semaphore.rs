//! Resizable FIFO counting semaphore bounding outbound concurrency.
//!
//! [`Semaphore::acquire()`] suspends until a slot is free and returns a
//! [`SemaphorePermit`] that gives the slot back when released or dropped.
//! Releasing hands the slot directly to the longest-waiting acquirer.
//!
//! # Resizing
//!
//! [`Semaphore::resize()`] swaps in a fresh slot pool. Permits obtained from
//! the previous pool keep running and return their slots to that pool; only
//! acquisitions made after the swap observe the new capacity. Waiters already
//! queued on the old pool are served by it, and a slot detached with
//! [`SemaphorePermit::forget()`] is returned to the pool it came from.
//!
//! ```rust
//! # use bifrost::semaphore::Semaphore;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> bifrost::Result<()> {
//! let semaphore = Semaphore::new(2)?;
//! let permit = semaphore.acquire().await;
//! assert_eq!(semaphore.available(), 1);
//! permit.release()?;
//! assert_eq!(semaphore.available(), 2);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::error;

use crate::telemetry;
use crate::{BifrostError, Result};

/// One generation of slots with a fixed capacity.
#[derive(Debug)]
struct Slots {
    capacity: usize,
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    held: usize,
    /// Held slots whose permit was forgotten.
    detached: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Slots {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(SlotState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot immediately, or enqueue a waiter.
    fn try_take_or_wait(&self) -> std::result::Result<(), oneshot::Receiver<()>> {
        let mut state = self.lock();
        if state.held < self.capacity {
            state.held += 1;
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Err(rx)
    }

    fn try_take(&self) -> bool {
        let mut state = self.lock();
        if state.held < self.capacity {
            state.held += 1;
            true
        } else {
            false
        }
    }

    /// Return a slot, handing it to the oldest live waiter if any.
    fn release(&self) -> Result<()> {
        let mut state = self.lock();
        if state.held == 0 {
            return Err(BifrostError::UnmatchedRelease);
        }
        while let Some(waiter) = state.waiters.pop_front() {
            // A failed send means the waiter gave up; try the next one.
            if waiter.send(()).is_ok() {
                return Ok(());
            }
        }
        state.held -= 1;
        Ok(())
    }

    fn detach(&self) {
        self.lock().detached += 1;
    }

    /// Return a detached slot. `None` when this pool has none.
    fn release_detached(&self) -> Option<Result<()>> {
        {
            let mut state = self.lock();
            if state.detached == 0 {
                return None;
            }
            state.detached -= 1;
        }
        Some(self.release())
    }

    /// Whether any slot of this pool is still held, detached or not.
    fn in_use(&self) -> bool {
        self.lock().held > 0
    }

    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.lock().held)
    }

    fn waiting(&self) -> usize {
        self.lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }
}

/// Counting semaphore with FIFO hand-off and atomic resize.
#[derive(Debug)]
pub struct Semaphore {
    current: RwLock<Arc<Slots>>,
    /// Replaced generations, oldest first, kept while any of their slots is held.
    retired: Mutex<Vec<Arc<Slots>>>,
}

impl Semaphore {
    /// Create a semaphore with `capacity` slots.
    ///
    /// Returns [`BifrostError::InvalidConcurrency`] for a capacity of zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BifrostError::InvalidConcurrency(capacity));
        }
        Ok(Self {
            current: RwLock::new(Arc::new(Slots::new(capacity))),
            retired: Mutex::new(Vec::new()),
        })
    }

    fn slots(&self) -> Arc<Slots> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> SemaphorePermit {
        let slots = self.slots();
        let started = Instant::now();
        loop {
            match slots.try_take_or_wait() {
                Ok(()) => break,
                Err(rx) => {
                    let mut waiter = Waiter {
                        rx: Some(rx),
                        slots: slots.clone(),
                    };
                    if let Some(rx) = waiter.rx.as_mut()
                        && rx.await.is_ok()
                    {
                        waiter.rx = None;
                        metrics::histogram!(telemetry::SEMAPHORE_WAIT_SECONDS)
                            .record(started.elapsed().as_secs_f64());
                        break;
                    }
                }
            }
        }
        SemaphorePermit { slots: Some(slots) }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<SemaphorePermit> {
        let slots = self.slots();
        slots
            .try_take()
            .then(|| SemaphorePermit {
                slots: Some(slots.clone()),
            })
    }

    /// Return a slot previously detached with [`SemaphorePermit::forget()`].
    ///
    /// Slots detached from a replaced generation go back to that
    /// generation, oldest first. Returns [`BifrostError::UnmatchedRelease`]
    /// when no detached slot is outstanding.
    pub fn release(&self) -> Result<()> {
        {
            let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
            let owed = retired.iter().find_map(|slots| slots.release_detached());
            retired.retain(|slots| slots.in_use());
            if let Some(result) = owed {
                return result;
            }
        }
        self.slots()
            .release_detached()
            .unwrap_or(Err(BifrostError::UnmatchedRelease))
    }

    /// Swap in a new capacity for future acquisitions.
    pub fn resize(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(BifrostError::InvalidConcurrency(capacity));
        }
        let previous = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, Arc::new(Slots::new(capacity)))
        };
        // Held permits may still be forgotten later, so a generation is kept
        // until nothing from it is held.
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        retired.retain(|slots| slots.in_use());
        if previous.in_use() {
            retired.push(previous);
        }
        Ok(())
    }

    /// Capacity of the current generation.
    pub fn capacity(&self) -> usize {
        self.slots().capacity
    }

    /// Free slots in the current generation.
    pub fn available(&self) -> usize {
        self.slots().available()
    }

    /// Acquirers currently suspended on the current generation.
    pub fn waiting(&self) -> usize {
        self.slots().waiting()
    }
}

/// Pending acquisition. If dropped after being handed a slot but before
/// observing it, the slot is passed on instead of leaking.
struct Waiter {
    rx: Option<oneshot::Receiver<()>>,
    slots: Arc<Slots>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok()
                && let Err(e) = self.slots.release()
            {
                error!(error = %e, "failed to pass on abandoned semaphore slot");
            }
        }
    }
}

/// A held slot. Released exactly once: explicitly, or on drop.
#[derive(Debug)]
#[must_use = "dropping a permit releases its slot immediately"]
pub struct SemaphorePermit {
    slots: Option<Arc<Slots>>,
}

impl SemaphorePermit {
    /// Give the slot back to the generation it was taken from.
    pub fn release(mut self) -> Result<()> {
        match self.slots.take() {
            Some(slots) => slots.release(),
            None => Err(BifrostError::UnmatchedRelease),
        }
    }

    /// Detach the slot from this permit without releasing it.
    ///
    /// The slot must later be returned with [`Semaphore::release()`].
    pub fn forget(mut self) {
        if let Some(slots) = self.slots.take() {
            slots.detach();
        }
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.take()
            && let Err(e) = slots.release()
        {
            error!(error = %e, "semaphore permit release failed");
        }
    }
}
