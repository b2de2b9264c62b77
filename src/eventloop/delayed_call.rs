//! One scheduled unit of work, its cancellation handle, and dispatch timing.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Result;

use super::{Callback, LoopHandle, lock};

/// Shared between a queued [`DelayedCall`] and every [`CallHandle`] to it
struct CallSlot<S> {
    callback: Mutex<Option<Callback<S>>>,
    canceled: AtomicBool,
}

trait Cancel: Send + Sync {
    fn cancel(&self);
    fn is_canceled(&self) -> bool;
    fn is_pending(&self) -> bool;
}

impl<S> Cancel for CallSlot<S> {
    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        let callback = lock(&self.callback).take();
        // Captured state is released here, not when the heap entry is eventually popped
        drop(callback);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn is_pending(&self) -> bool {
        lock(&self.callback).is_some()
    }
}

/// Handle to a scheduled timeout, idle or urgent call
///
/// Cloning the handle does not clone the call. Cancelling is idempotent and has no
/// effect once dispatch has started.
#[derive(Clone)]
pub struct CallHandle {
    slot: Arc<dyn Cancel>,
}

impl CallHandle {
    /// Prevent the call from running and drop everything it captured
    pub fn cancel(&self) {
        self.slot.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_canceled(&self) -> bool {
        self.slot.is_canceled()
    }

    /// Whether the call is still waiting to run
    pub fn is_pending(&self) -> bool {
        self.slot.is_pending()
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("canceled", &self.is_canceled())
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// A callback plus the name it is logged and timed under
pub(crate) struct DelayedCall<S> {
    name: String,
    slot: Arc<CallSlot<S>>,
}

impl<S: 'static> DelayedCall<S> {
    pub(crate) fn new(name: String, callback: Callback<S>) -> (Self, CallHandle) {
        let slot = Arc::new(CallSlot {
            callback: Mutex::new(Some(callback)),
            canceled: AtomicBool::new(false),
        });
        let handle = CallHandle {
            slot: slot.clone() as Arc<dyn Cancel>,
        };
        (Self { name, slot }, handle)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.slot.is_canceled()
    }

    /// Run the callback, returning `false` if it failed
    ///
    /// Canceled calls do nothing, are not timed and count as successful.
    pub(crate) fn dispatch(
        self,
        state: &mut S,
        handle: &LoopHandle<S>,
        tracker: &mut SlowCallTracker,
    ) -> bool {
        let callback = lock(&self.slot.callback).take();
        match callback {
            Some(callback) => run_guarded(&self.name, tracker, || callback(state, handle)),
            None => true,
        }
    }
}

/// Run `f`, trapping both `Err` and panics, and record how long it took
pub(crate) fn run_guarded(
    name: &str,
    tracker: &mut SlowCallTracker,
    f: impl FnOnce() -> Result<()>,
) -> bool {
    let start = Instant::now();
    let success = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(callback = name, error = %e, "While handling {}", name);
            false
        }
        Err(payload) => {
            tracing::error!(
                callback = name,
                panic = %panic_message(payload.as_ref()),
                "While handling {}",
                name
            );
            false
        }
    };
    tracker.record(name, start.elapsed());
    success
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What [`SlowCallTracker::record`] reported
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SlowReport {
    pub(crate) single: bool,
    pub(crate) cumulative: bool,
}

/// Per-name dispatch timing
pub(crate) struct SlowCallTracker {
    single_threshold: Duration,
    cumulative_threshold: Duration,
    cumulative: HashMap<String, Duration>,
}

impl SlowCallTracker {
    pub(crate) fn new(single_threshold: Duration, cumulative_threshold: Duration) -> Self {
        Self {
            single_threshold,
            cumulative_threshold,
            cumulative: HashMap::new(),
        }
    }

    pub(crate) fn record(&mut self, name: &str, elapsed: Duration) -> SlowReport {
        let mut report = SlowReport::default();
        if elapsed > self.single_threshold {
            tracing::warn!(
                target: "timing",
                callback = name,
                elapsed_ms = elapsed.as_millis() as u64,
                "{} too slow ({:.3} secs)",
                name,
                elapsed.as_secs_f64()
            );
            report.single = true;
        }

        let total = self.cumulative.entry(name.to_string()).or_default();
        *total += elapsed;
        if *total > self.cumulative_threshold {
            tracing::warn!(
                target: "timing",
                callback = name,
                elapsed_ms = total.as_millis() as u64,
                "{} cumulative is too slow ({:.3} secs)",
                name,
                total.as_secs_f64()
            );
            *total = Duration::ZERO;
            report.cumulative = true;
        }
        report
    }

    #[cfg(test)]
    pub(crate) fn cumulative(&self, name: &str) -> Duration {
        self.cumulative.get(name).copied().unwrap_or_default()
    }
}
