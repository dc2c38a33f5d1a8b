//! Admission control for concurrently supervised runs.
//!
//! [`AdmissionControl`] is sized once when the process wires itself up and
//! shared by `Arc` with every run. A capacity of zero means unlimited: no
//! pool exists and acquiring never blocks.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Callback receiving `+1` when a run starts waiting and `-1` when it stops.
pub type WaitingRunHook = Arc<dyn Fn(i64) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Admission canceled")]
    Canceled,

    #[error("Admission pool has been closed")]
    Closed,
}

/// Permission for one run to execute. The slot returns to the pool on drop.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionSlot {
    /// Return the slot now. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }
}

/// Bounded gate on how many runs execute at once.
pub struct AdmissionControl {
    pool: Option<Arc<Semaphore>>,
    capacity: usize,
    queued: AtomicI64,
    hook: Mutex<Option<WaitingRunHook>>,
}

impl fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("capacity", &self.capacity)
            .field("queued", &self.queued_run_count())
            .finish_non_exhaustive()
    }
}

impl AdmissionControl {
    /// Create a gate admitting `max_concurrent` runs; `0` admits everyone.
    pub fn new(max_concurrent: usize) -> Self {
        let pool = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));
        info!(
            max_concurrent,
            unlimited = pool.is_none(),
            "Admission control created"
        );
        Self {
            pool,
            capacity: max_concurrent,
            queued: AtomicI64::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Configured capacity, or `None` when unlimited.
    pub fn capacity(&self) -> Option<usize> {
        self.pool.as_ref().map(|_| self.capacity)
    }

    /// Free slots, or `None` when unlimited.
    pub fn available_permits(&self) -> Option<usize> {
        self.pool.as_ref().map(|pool| pool.available_permits())
    }

    /// Runs currently blocked in [`acquire`](Self::acquire).
    pub fn queued_run_count(&self) -> i64 {
        self.queued.load(Ordering::SeqCst)
    }

    /// Install (or clear) the waiting-run hook.
    pub fn set_waiting_run_hook(&self, hook: Option<WaitingRunHook>) {
        if let Ok(mut slot) = self.hook.lock() {
            *slot = hook;
        }
    }

    /// Wait for a free slot.
    ///
    /// Cancellation takes priority: a token that is already canceled never
    /// consumes a slot.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AdmissionSlot, AdmissionError> {
        let Some(pool) = &self.pool else {
            return Ok(AdmissionSlot { _permit: None });
        };

        let _waiting = Waiting::enter(self);
        debug!(
            queued = self.queued_run_count(),
            "Waiting for admission slot"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AdmissionError::Canceled),
            permit = Arc::clone(pool).acquire_owned() => {
                let permit = permit.map_err(|_| AdmissionError::Closed)?;
                Ok(AdmissionSlot { _permit: Some(permit) })
            }
        }
    }

    fn notify(&self, delta: i64) {
        let hook = self.hook.lock().ok().and_then(|guard| guard.clone());
        if let Some(hook) = hook {
            hook(delta);
        }
    }
}

/// Counts one caller as queued for as long as it lives.
struct Waiting<'a> {
    control: &'a AdmissionControl,
}

impl<'a> Waiting<'a> {
    fn enter(control: &'a AdmissionControl) -> Self {
        control.queued.fetch_add(1, Ordering::SeqCst);
        control.notify(1);
        Self { control }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.control.queued.fetch_sub(1, Ordering::SeqCst);
        self.control.notify(-1);
    }
}
