//! Injectable wall clock. Everything that reads "now" or arms a delayed
//! callback goes through `Clock` so schedules can be tested deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

pub type SharedClock = Arc<dyn Clock>;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;

    /// Run `callback` once after `delay`, unless the returned timer is stopped.
    fn after_func(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Timer;
}

/// Handle to a pending `after_func` callback.
pub struct Timer {
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Real clock
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn after_func(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Timer {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                callback();
            }
        });
        Timer {
            stopped,
            handle: Some(handle),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake clock (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
struct PendingCallback {
    due: OffsetDateTime,
    stopped: Arc<AtomicBool>,
    callback: Box<dyn FnOnce() + Send>,
}

/// Manually advanced clock. Callbacks armed with `after_func` fire inside
/// `advance` once their due time is reached.
#[cfg(test)]
#[derive(Clone)]
pub struct FakeClock {
    current: Arc<Mutex<OffsetDateTime>>,
    pending: Arc<Mutex<Vec<PendingCallback>>>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = now;
        self.fire_due(now);
    }

    pub fn advance(&self, by: Duration) {
        let now = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            *current += by;
            *current
        };
        self.fire_due(now);
    }

    fn fire_due(&self, now: OffsetDateTime) {
        let due: Vec<PendingCallback> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let (due, keep): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.due <= now);
            *pending = keep;
            due
        };
        // Callbacks run outside the lock so they may arm new timers.
        for p in due {
            if !p.stopped.load(Ordering::SeqCst) {
                (p.callback)();
            }
        }
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> OffsetDateTime {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn after_func(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Timer {
        let stopped = Arc::new(AtomicBool::new(false));
        let due = self.now() + delay;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PendingCallback {
                due,
                stopped: Arc::clone(&stopped),
                callback,
            });
        Timer {
            stopped,
            handle: None,
        }
    }
}
