//! One-shot timed callbacks.
//!
//! Timers are created through [`Hub::schedule_call_global`] and
//! [`Hub::schedule_call_local`]. A global timer always fires once due; a
//! local timer belongs to the fiber that scheduled it and is skipped if
//! that fiber has finished by then.
//!
//! # Example
//!
//! ```ignore
//! use fiberhub::Hub;
//! use std::time::Duration;
//!
//! let hub = Hub::current();
//! let timer = hub.schedule_call_global(Duration::from_millis(10), || println!("tick"));
//! timer.cancel();
//! ```

pub(crate) mod store;

use crate::fiber::Caller;
use crate::hub::{Hub, WeakHub};
use crate::utils::slab::Key;

use std::rc::Rc;
use std::time::{Duration, Instant};

/// Longest delay a timer is scheduled with. Longer delays, up to
/// `Duration::MAX`, mean "never" and are clamped to this.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Global,
    Local,
}

/// Snapshot of a pending timer, as returned by [`Hub::pending_timers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerInfo {
    pub due: Instant,
    pub kind: TimerKind,
}

/// Handle to a scheduled timer.
///
/// Cancelling is idempotent and a no-op once the timer has fired.
#[derive(Clone)]
pub struct TimerHandle {
    hub: WeakHub,
    key: Key,
}

impl TimerHandle {
    pub fn cancel(&self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };

        let callback = hub.inner.timers.borrow_mut().cancel(self.key);
        // Dropped here, outside the borrow: the closure may own fibers.
        drop(callback);
    }

    /// True while the timer is scheduled and not canceled.
    pub fn is_pending(&self) -> bool {
        self.hub
            .upgrade()
            .map(|hub| hub.inner.timers.borrow().is_pending(self.key))
            .unwrap_or(false)
    }

    pub fn due(&self) -> Option<Instant> {
        self.hub
            .upgrade()
            .and_then(|hub| hub.inner.timers.borrow().due(self.key))
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Hub {
    /// Schedules `callback` to run after `delay`, unconditionally.
    pub fn schedule_call_global<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.schedule(delay, TimerKind::Global, Box::new(callback))
    }

    /// Schedules `callback` to run after `delay`, unless the fiber calling
    /// this has finished by then.
    pub fn schedule_call_local<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.schedule(delay, TimerKind::Local, Box::new(callback))
    }

    fn schedule(&self, delay: Duration, kind: TimerKind, callback: store::TimerCallback) -> TimerHandle {
        let owner = match (kind, self.caller()) {
            (TimerKind::Local, Caller::Fiber(fiber)) => Some(Rc::downgrade(&fiber)),
            _ => None,
        };

        let due = Instant::now() + delay.min(FAR_FUTURE);
        let key = self
            .inner
            .timers
            .borrow_mut()
            .schedule(due, kind, owner, callback);

        TimerHandle {
            hub: self.downgrade(),
            key,
        }
    }

    /// Pending (non-canceled) timers ordered by due time.
    pub fn pending_timers(&self) -> Vec<TimerInfo> {
        self.inner.timers.borrow().pending()
    }

    pub fn timer_count(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    pub(crate) fn prepare_timers(&self) {
        self.inner.timers.borrow_mut().merge();
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.inner.timers.borrow_mut().next_due()
    }

    /// Runs every live timer due at `now`, yielding to the root context
    /// between callbacks when it has been woken.
    pub(crate) fn fire_timers(&self, now: Instant) {
        loop {
            let due = self.inner.timers.borrow_mut().pop_due(now);
            let Some(timer) = due else {
                break;
            };

            if !timer.is_live() {
                continue;
            }

            let report = self.inner.timer_exceptions.get();
            self.invoke(timer.callback, report);
            self.yield_to_root_if_woken();
        }
    }

    pub(crate) fn clear_timers(&self) {
        let callbacks = self.inner.timers.borrow_mut().clear();
        drop(callbacks);
    }
}
