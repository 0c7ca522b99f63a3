//! Blocking-style waits on descriptors and time.
//!
//! [`trampoline`] registers one listener per requested direction and an
//! optional timeout, switches to the hub, and removes all of them again
//! however it was resumed. It is the only call a blocking-style I/O
//! wrapper needs:
//!
//! ```ignore
//! use fiberhub::{Direction, Interest, trampoline};
//! use std::io::Read;
//! use std::os::unix::io::AsRawFd;
//! use std::time::Duration;
//!
//! loop {
//!     match stream.read(&mut buf) {
//!         Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
//!             trampoline(stream.as_raw_fd(), Interest::READ, Some(Duration::from_secs(5)))?;
//!         }
//!         other => break other,
//!     }
//! }
//! ```

use crate::error::{Error, Result};
use crate::fiber::{Caller, Resume};
use crate::hub::{Direction, Hub, ListenerHandle, Readiness};
use crate::poller::Interest;
use crate::timer::TimerHandle;

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wakeup {
    Ready(Direction),
    Closed,
    TimedOut,
}

/// Listeners and timer of one wait, removed on drop.
struct Registration<'a> {
    hub: &'a Hub,
    listeners: Vec<ListenerHandle>,
    timer: Option<TimerHandle>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        for handle in self.listeners.drain(..) {
            self.hub.remove(&handle);
        }
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Configurable form of [`trampoline`].
#[derive(Debug)]
pub struct Trampoline {
    fd: RawFd,
    interest: Interest,
    timeout: Option<Duration>,
    timeout_error: Error,
}

impl Trampoline {
    pub fn new(fd: RawFd, interest: Interest) -> Self {
        Self {
            fd,
            interest,
            timeout: None,
            timeout_error: Error::Timeout,
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Error returned when the timeout fires, [`Error::Timeout`] by default.
    pub fn timeout_error(mut self, error: Error) -> Self {
        self.timeout_error = error;
        self
    }

    /// Waits on the current thread's hub.
    pub fn wait(self) -> Result<Direction> {
        let hub = Hub::try_current()?;
        self.wait_on(&hub)
    }

    /// Suspends the caller until `fd` is ready in one of the requested
    /// directions, and returns that direction.
    pub fn wait_on(self, hub: &Hub) -> Result<Direction> {
        let caller = hub.caller();
        if matches!(caller, Caller::Hub) {
            return Err(Error::BlockingInHub);
        }
        if self.interest.is_empty() {
            return Err(Error::EmptyInterest);
        }

        let wakeup = Rc::new(Cell::new(None));
        let mut registration = Registration {
            hub,
            listeners: Vec::with_capacity(2),
            timer: None,
        };

        for direction in Direction::ALL {
            if !direction.in_interest(self.interest) {
                continue;
            }

            let wake = waker(hub, &caller, &wakeup);
            let handle = hub.add(direction, self.fd, move |readiness| {
                wake(match readiness {
                    Readiness::Ready | Readiness::Error => Wakeup::Ready(direction),
                    Readiness::Closed => Wakeup::Closed,
                })
            })?;
            registration.listeners.push(handle);
        }

        if let Some(timeout) = self.timeout {
            let wake = waker(hub, &caller, &wakeup);
            registration.timer = Some(hub.schedule_call_local(timeout, move || wake(Wakeup::TimedOut)));
        }

        hub.switch()?;
        drop(registration);

        match wakeup.get() {
            Some(Wakeup::Ready(direction)) => Ok(direction),
            Some(Wakeup::Closed) => Err(Error::DescriptorClosed { fd: self.fd }),
            Some(Wakeup::TimedOut) => Err(self.timeout_error),
            None => Err(Error::Interrupted),
        }
    }
}

/// Builds a callback that records the first wake-up and resumes `caller`.
fn waker(hub: &Hub, caller: &Caller, wakeup: &Rc<Cell<Option<Wakeup>>>) -> impl Fn(Wakeup) + 'static {
    let hub = hub.downgrade();
    let caller = caller.clone();
    let wakeup = wakeup.clone();

    move |reason| {
        if wakeup.get().is_some() {
            return;
        }
        wakeup.set(Some(reason));

        if let Some(hub) = hub.upgrade() {
            hub.switch_to(&caller, Resume::Wake);
        }
    }
}

/// Suspends the caller until `fd` is ready in one of the directions of
/// `interest`, or until `timeout` elapses ([`Error::Timeout`]).
///
/// Returns [`Error::DescriptorClosed`] if the descriptor is invalidated
/// while waiting, and [`Error::BlockingInHub`] when called from a hub
/// callback.
pub fn trampoline(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> Result<Direction> {
    Trampoline::new(fd, interest).timeout(timeout).wait()
}

/// Suspends the caller for `duration`.
pub fn sleep(duration: Duration) -> Result<()> {
    Hub::try_current()?.sleep(duration)
}

impl Hub {
    /// Suspends the caller for `duration`. A zero duration just lets every
    /// other runnable fiber go first.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let caller = self.caller();
        if matches!(caller, Caller::Hub) {
            return Err(Error::BlockingInHub);
        }

        let hub = self.downgrade();
        let timer = self.schedule_call_global(duration, move || {
            if let Some(hub) = hub.upgrade() {
                hub.switch_to(&caller, Resume::Wake);
            }
        });

        let _registration = Registration {
            hub: self,
            listeners: Vec::new(),
            timer: Some(timer),
        };

        self.switch()
    }
}
