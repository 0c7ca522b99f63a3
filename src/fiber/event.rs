//! One-shot result slot.
//!
//! An [`Event`] is sent once and can be waited on by any number of fibers
//! (or the root context). Sending never switches: each waiter is woken by
//! a zero-delay timer, so it runs on a later hub tick.

use crate::error::{Error, Result};
use crate::fiber::{Caller, Resume};
use crate::hub::{Hub, WeakHub};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

struct Waiter {
    id: u64,
    caller: Caller,
    hub: WeakHub,
    active: Rc<Cell<bool>>,
}

struct EventInner<T> {
    value: RefCell<Option<Result<T>>>,
    waiters: RefCell<Vec<Waiter>>,
    next_waiter: Cell<u64>,
}

pub struct Event<T> {
    inner: Rc<EventInner<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(EventInner {
                value: RefCell::new(None),
                waiters: RefCell::new(Vec::new()),
                next_waiter: Cell::new(0),
            }),
        }
    }

    pub fn send(&self, value: T) -> Result<()> {
        self.send_result(Ok(value))
    }

    /// Makes every current and future `wait` return `error`.
    pub fn send_error(&self, error: Error) -> Result<()> {
        self.send_result(Err(error))
    }

    pub(crate) fn send_result(&self, result: Result<T>) -> Result<()> {
        {
            let mut value = self.inner.value.borrow_mut();
            if value.is_some() {
                return Err(Error::AlreadySent);
            }
            *value = Some(result);
        }

        let waiters = self.inner.waiters.borrow();
        for waiter in waiters.iter() {
            let Some(hub) = waiter.hub.upgrade() else {
                continue;
            };

            let weak = hub.downgrade();
            let caller = waiter.caller.clone();
            let active = waiter.active.clone();
            hub.schedule_call_global(Duration::ZERO, move || {
                if !active.get() {
                    return;
                }
                if let Some(hub) = weak.upgrade() {
                    hub.switch_to(&caller, Resume::Wake);
                }
            });
        }

        Ok(())
    }

    /// Whether a value or an error has been sent.
    pub fn ready(&self) -> bool {
        self.inner.value.borrow().is_some()
    }

    pub fn has_waiters(&self) -> bool {
        !self.inner.waiters.borrow().is_empty()
    }
}

impl<T: Clone> Event<T> {
    /// The sent result, without blocking.
    pub fn poll(&self) -> Option<Result<T>> {
        self.inner.value.borrow().clone()
    }

    /// Blocks the caller until a result is sent, then returns a copy of it.
    pub fn wait(&self) -> Result<T> {
        if let Some(result) = self.poll() {
            return result;
        }

        let hub = Hub::try_current()?;
        self.wait_on(&hub)
    }

    /// Like [`Event::wait`], suspending the caller through `hub`.
    pub fn wait_on(&self, hub: &Hub) -> Result<T> {
        loop {
            if let Some(result) = self.poll() {
                return result;
            }

            let id = self.inner.next_waiter.get();
            self.inner.next_waiter.set(id + 1);

            let active = Rc::new(Cell::new(true));
            self.inner.waiters.borrow_mut().push(Waiter {
                id,
                caller: hub.caller(),
                hub: hub.downgrade(),
                active: active.clone(),
            });

            let _registered = Registered {
                event: &self.inner,
                id,
                active,
            };
            hub.switch()?;
        }
    }
}

/// Unregisters a waiter however its wait ends.
struct Registered<'a, T> {
    event: &'a EventInner<T>,
    id: u64,
    active: Rc<Cell<bool>>,
}

impl<T> Drop for Registered<'_, T> {
    fn drop(&mut self) {
        self.active.set(false);
        self.event.waiters.borrow_mut().retain(|waiter| waiter.id != self.id);
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("ready", &self.ready())
            .field("waiters", &self.inner.waiters.borrow().len())
            .finish()
    }
}
