//! # Scheduler Module
//!
//! Periodic and one-shot timers that post to per-consumer wake signals.
//!
//! Every polling loop blocks on its own [`Wake`]. A wake holds at most one
//! pending signal, so a consumer still busy with the previous tick sees a
//! single coalesced wake instead of a growing backlog.
//!
//! ```
//! use callbox::scheduler::{Scheduler, TimerMode, Wake};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> callbox::error::Result<()> {
//! let scheduler = Scheduler::new();
//! let wake = Wake::new();
//! let timer = scheduler.schedule(Duration::from_millis(10), TimerMode::Once, wake.clone())?;
//! assert!(wake.wait().await);
//! scheduler.cancel(timer);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::error::{CallboxError, Result};

/// Coalescing wake signal for one consumer
#[derive(Debug, Clone, Default)]
pub struct Wake {
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl Wake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a wake. Repeated posts before the consumer waits collapse into one.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Block until woken. Returns `false` once the wake has been closed.
    pub async fn wait(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.notify.notified().await;
        !self.is_closed()
    }

    /// Release the consumer for good: the final wake makes `wait` return `false`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Timer firing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Once,
    Periodic,
}

/// Identifies a scheduled timer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

type TimerTable = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

fn lock_table(table: &TimerTable) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns every timer task; the only source of ticks in the application
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: TimerTable,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `wake` every `interval` (or once, after `interval`)
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CallboxError::SchedulerClosed`] after [`Scheduler::shutdown`].
    pub fn schedule(&self, interval: Duration, mode: TimerMode, wake: Wake) -> Result<TimerHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallboxError::SchedulerClosed);
        }

        let period = interval.max(Duration::from_millis(1));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let table = Arc::clone(&self.timers);

        // Hold the table while spawning so a one-shot timer cannot try to
        // deregister itself before it has been registered.
        let mut timers = lock_table(&self.timers);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                wake.wake();
                if mode == TimerMode::Once {
                    lock_table(&table).remove(&id);
                    break;
                }
            }
        });
        timers.insert(id, task);

        debug!("Scheduled timer {} every {:?} ({:?})", id, period, mode);
        Ok(TimerHandle(id))
    }

    /// Stop future firings. Safe to call more than once.
    pub fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = lock_table(&self.timers).remove(&handle.0) {
            task.abort();
            debug!("Cancelled timer {}", handle.0);
        }
    }

    /// Cancel every timer and refuse new ones
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = lock_table(&self.timers).drain().collect();
        for (_, task) in drained {
            task.abort();
        }
    }

    /// Number of timers still registered
    pub fn active_timers(&self) -> usize {
        lock_table(&self.timers).len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, task) in lock_table(&self.timers).drain() {
            task.abort();
        }
    }
}
