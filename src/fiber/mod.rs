//! Stackful fibers scheduled by the hub.
//!
//! A fiber runs on its own stack and suspends itself by switching to the
//! hub, typically through [`trampoline`](crate::trampoline()) or
//! [`sleep`](crate::sleep()). It is resumed by whatever callback it left
//! behind: a listener, a timer or an [`Event`].
//!
//! ```text
//! NotStarted --start--> Running --switch--> Suspended --resume--> Running --return--> Finished
//! ```
//!
//! [`kill`] moves any unfinished fiber to `Finished`: a fiber that has not
//! started never runs its body, a suspended one sees the error at its next
//! resumption.

pub mod event;
mod spawn;

pub use event::Event;
pub use spawn::{
    FiberHandle, LinkId, kill, kill_with, spawn, spawn_after, spawn_after_local, spawn_n,
};

use crate::error::Error;
use crate::hub::{Hub, WeakHub, context};
use crate::timer::TimerHandle;

use generator::{Generator, Gn};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem::ManuallyDrop;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    NotStarted,
    Running,
    Suspended,
    Finished,
}

/// Why a suspended context is being resumed.
#[derive(Debug)]
pub(crate) enum Resume {
    Start,
    Wake,
    Throw(Error),
}

/// The execution context that is currently running on a hub.
#[derive(Clone)]
pub(crate) enum Caller {
    /// The thread's own stack, outside any fiber.
    Root,
    Hub,
    Fiber(Rc<FiberCore>),
}

/// A suspendable stack.
///
/// A coroutine dropped while suspended is leaked instead of unwound; its
/// destructors would otherwise run against a hub that may be going away.
pub(crate) struct Coroutine {
    inner: ManuallyDrop<Generator<'static, (), ()>>,
    started: bool,
}

/// Carries a fiber body into its coroutine.
///
/// The coroutine API wants a `Send` body because a generator may be resumed
/// from any thread. Ours never leaves the thread that created its hub:
/// `Coroutine` is only reachable through `Rc`s.
struct LocalBody<F>(F);

unsafe impl<F> Send for LocalBody<F> {}

impl<F: FnOnce()> LocalBody<F> {
    fn run(self) {
        (self.0)()
    }
}

impl Coroutine {
    pub(crate) fn new<F>(stack_words: usize, body: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        let body = LocalBody(body);
        let inner = Gn::<()>::new_opt(stack_words, move || body.run());

        Self {
            inner: ManuallyDrop::new(inner),
            started: false,
        }
    }

    pub(crate) fn resume(&mut self) {
        self.started = true;
        self.inner.resume();
    }

    pub(crate) fn is_done(&self) -> bool {
        self.inner.is_done()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        if !self.started || self.inner.is_done() {
            unsafe { ManuallyDrop::drop(&mut self.inner) };
        }
    }
}

/// Gives control back to whoever resumed the running coroutine.
#[allow(deprecated)]
pub(crate) fn suspend() {
    generator::yield_with(());
}

pub(crate) struct FiberCore {
    pub(crate) id: FiberId,
    pub(crate) hub: WeakHub,
    pub(crate) state: Cell<FiberState>,
    pub(crate) coroutine: RefCell<Option<Coroutine>>,
    pub(crate) resume: RefCell<Option<Resume>>,
    /// Error to raise at the next resumption, set by `kill`.
    pub(crate) pending_kill: RefCell<Option<Error>>,
    pub(crate) start_timer: RefCell<Option<TimerHandle>>,
}

impl FiberCore {
    pub(crate) fn new(hub: &Hub) -> Rc<Self> {
        Rc::new(Self {
            id: FiberId(hub.next_fiber_id()),
            hub: hub.downgrade(),
            state: Cell::new(FiberState::NotStarted),
            coroutine: RefCell::new(None),
            resume: RefCell::new(None),
            pending_kill: RefCell::new(None),
            start_timer: RefCell::new(None),
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.get() == FiberState::Finished
    }
}

/// Opaque reference to a fiber, enough to kill it or check on it.
#[derive(Clone)]
pub struct FiberRef {
    pub(crate) core: Rc<FiberCore>,
}

impl FiberRef {
    pub fn id(&self) -> FiberId {
        self.core.id
    }

    pub fn state(&self) -> FiberState {
        self.core.state.get()
    }

    pub fn is_dead(&self) -> bool {
        self.core.is_finished()
    }
}

impl AsRef<FiberRef> for FiberRef {
    fn as_ref(&self) -> &FiberRef {
        self
    }
}

impl PartialEq for FiberRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for FiberRef {}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("id", &self.core.id)
            .field("state", &self.core.state.get())
            .finish()
    }
}

/// The fiber running on this thread's hub, if the caller is one.
pub fn current_fiber() -> Option<FiberRef> {
    match context::peek()?.caller() {
        Caller::Fiber(core) => Some(FiberRef { core }),
        _ => None,
    }
}
