//! The per-thread scheduler.
//!
//! A [`Hub`] owns the polling backend, the listener registry and the timer
//! store, and runs its event loop inside a dedicated fiber. Code that wants
//! to wait (a fiber, or the thread's root context) registers a listener or
//! a timer whose callback will resume it, then calls [`Hub::switch`].
//!
//! Each loop iteration runs the callbacks deferred by
//! [`Hub::notify_close`], fires every due timer in `(due, seq)` order and
//! then blocks in the backend until the next timer is due.
//!
//! # Example
//!
//! ```ignore
//! use fiberhub::{Hub, sleep, spawn};
//! use std::time::Duration;
//!
//! let fiber = spawn(|| {
//!     sleep(Duration::from_millis(10))?;
//!     Ok(42)
//! });
//!
//! assert_eq!(fiber.wait().unwrap(), 42);
//! ```

pub(crate) mod context;
pub mod listener;
pub(crate) mod wake;

pub use listener::{Direction, ListenerHandle, ListenerInfo, Readiness};
pub use wake::WakeHandle;

use crate::builder::HubConfig;
use crate::error::{Error, Result};
use crate::fiber::{Caller, Coroutine, FiberCore, FiberState, Resume};
use crate::poller::{Backend, BackendKind, Interest, PollEvent};
use crate::timer::store::TimerStore;

use listener::{Listener, Registry};
use wake::WakeChannel;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

pub(crate) type ExceptionHook = Rc<dyn Fn(&Error)>;

pub(crate) struct HubInner {
    pub(crate) config: HubConfig,
    pub(crate) registry: RefCell<Registry>,
    pub(crate) closing: RefCell<Vec<Listener>>,
    pub(crate) timers: RefCell<TimerStore>,
    pub(crate) backend: RefCell<Box<dyn Backend>>,
    wake: WakeChannel,
    events: RefCell<Vec<PollEvent>>,

    coroutine: RefCell<Option<Coroutine>>,
    current: RefCell<Caller>,
    root_resume: RefCell<Option<Resume>>,
    exit: RefCell<Option<Error>>,
    running: Cell<bool>,
    stopping: Cell<bool>,

    pub(crate) single_owner: Cell<bool>,
    pub(crate) debug_listeners: Cell<bool>,
    pub(crate) timer_exceptions: Cell<bool>,
    debug_blocking: Cell<Option<Duration>>,
    hook: RefCell<ExceptionHook>,
    next_fiber_id: Cell<u64>,
}

/// Handle to a hub. Cheap to clone; all clones drive the same loop.
///
/// A hub is bound to the thread that created it. Use [`Hub::wake_handle`]
/// to reach it from other threads.
#[derive(Clone)]
pub struct Hub {
    pub(crate) inner: Rc<HubInner>,
}

/// Non-owning reference to a [`Hub`], held by callbacks the hub stores.
#[derive(Clone)]
pub struct WeakHub {
    inner: Weak<HubInner>,
}

impl WeakHub {
    pub fn upgrade(&self) -> Option<Hub> {
        self.inner.upgrade().map(|inner| Hub { inner })
    }
}

fn default_hook(error: &Error) {
    match error {
        Error::Blocked(_) => log::warn!("{}", error),
        _ => log::error!("unhandled error in hub callback: {}", error),
    }
}

impl Hub {
    pub(crate) fn new(config: HubConfig, mut backend: Box<dyn Backend>) -> Result<Self> {
        let wake = WakeChannel::new()?;
        backend.register(wake.fd(), Interest::READ)?;

        let inner = HubInner {
            registry: RefCell::new(Registry::default()),
            closing: RefCell::new(Vec::new()),
            timers: RefCell::new(TimerStore::new(config.compaction_threshold)),
            backend: RefCell::new(backend),
            wake,
            events: RefCell::new(Vec::new()),

            coroutine: RefCell::new(None),
            current: RefCell::new(Caller::Root),
            root_resume: RefCell::new(None),
            exit: RefCell::new(None),
            running: Cell::new(false),
            stopping: Cell::new(false),

            single_owner: Cell::new(config.single_owner),
            debug_listeners: Cell::new(config.debug_listeners),
            timer_exceptions: Cell::new(config.timer_exceptions),
            debug_blocking: Cell::new(config.debug_blocking),
            hook: RefCell::new(Rc::new(default_hook)),
            next_fiber_id: Cell::new(1),
            config,
        };

        Ok(Hub {
            inner: Rc::new(inner),
        })
    }

    /// Returns the hub of the current thread, creating it on first use.
    ///
    /// # Panics
    /// Panics if no polling backend can be opened. Use [`Hub::try_current`]
    /// to handle that case.
    pub fn current() -> Hub {
        context::current()
            .unwrap_or_else(|err| panic!("failed to create the hub for this thread: {}", err))
    }

    pub fn try_current() -> Result<Hub> {
        context::current()
    }

    /// Runs `function` with this hub installed as the thread's hub.
    pub fn enter<F, R>(&self, function: F) -> R
    where
        F: FnOnce() -> R,
    {
        context::enter(self.clone(), function)
    }

    pub fn downgrade(&self) -> WeakHub {
        WeakHub {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.borrow().kind()
    }

    pub fn wake_handle(&self) -> WakeHandle {
        self.inner.wake.handle()
    }

    /// True while the event loop is running (possibly suspended in favour
    /// of the root context).
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn set_single_owner(&self, enabled: bool) {
        self.inner.single_owner.set(enabled);
    }

    /// Captures a backtrace at every `add`, reported in listener conflicts.
    pub fn set_debug_listeners(&self, enabled: bool) {
        self.inner.debug_listeners.set(enabled);
    }

    /// Whether panics in timer callbacks are passed to the exception hook.
    pub fn set_timer_exceptions(&self, enabled: bool) {
        self.inner.timer_exceptions.set(enabled);
    }

    /// Reports every callback that keeps the hub busy for longer than
    /// `resolution` as [`Error::Blocked`]. `None` turns detection off.
    pub fn set_debug_blocking(&self, resolution: Option<Duration>) {
        self.inner.debug_blocking.set(resolution);
    }

    /// Replaces the function that receives errors nobody else will see:
    /// callback panics, failed fibers nobody waits for, blocking reports.
    pub fn set_exception_hook<F>(&self, hook: F)
    where
        F: Fn(&Error) + 'static,
    {
        *self.inner.hook.borrow_mut() = Rc::new(hook);
    }

    pub(crate) fn report(&self, error: &Error) {
        let hook = self.inner.hook.borrow().clone();
        hook(error);
    }

    pub(crate) fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub(crate) fn next_fiber_id(&self) -> u64 {
        let id = self.inner.next_fiber_id.get();
        self.inner.next_fiber_id.set(id + 1);
        id
    }

    /// Who is executing right now: the root context, the hub fiber or a
    /// spawned fiber.
    pub(crate) fn caller(&self) -> Caller {
        self.inner.current.borrow().clone()
    }

    /// Suspends the caller and gives control to the hub.
    ///
    /// Returns once something switches back to the caller. An error means
    /// the caller was killed while suspended, or, from the root context,
    /// that the hub fiber died ([`Error::HubExited`]).
    pub fn switch(&self) -> Result<()> {
        match self.caller() {
            Caller::Hub => Err(Error::BlockingInHub),
            Caller::Root => self.switch_from_root(),
            Caller::Fiber(core) => switch_from_fiber(&core),
        }
    }

    fn switch_from_root(&self) -> Result<()> {
        self.inner.root_resume.borrow_mut().take();

        let existing = self.inner.coroutine.borrow_mut().take();
        let mut coroutine = match existing {
            Some(coroutine) if !coroutine.is_done() => coroutine,
            _ => self.hub_coroutine(),
        };

        let previous = self.inner.current.replace(Caller::Hub);
        context::enter(self.clone(), || coroutine.resume());
        self.inner.current.replace(previous);

        if coroutine.is_done() {
            drop(coroutine);

            let exit = self.inner.exit.borrow_mut().take();
            if let Some(err) = exit {
                self.inner.root_resume.borrow_mut().take();
                log::debug!("hub fiber exited with error: {}", err);
                return Err(Error::HubExited(Box::new(err)));
            }
        } else {
            *self.inner.coroutine.borrow_mut() = Some(coroutine);
        }

        match self.inner.root_resume.borrow_mut().take() {
            Some(Resume::Throw(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn hub_coroutine(&self) -> Coroutine {
        let weak = self.downgrade();

        Coroutine::new(self.inner.config.hub_stack_size, move || {
            let Some(hub) = weak.upgrade() else {
                return;
            };

            let exit = match panic::catch_unwind(AssertUnwindSafe(|| hub.run_loop())) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(payload) => Some(Error::from_panic(payload)),
            };
            *hub.inner.exit.borrow_mut() = exit;
        })
    }

    /// Makes `target` runnable again with `resume`.
    ///
    /// Fibers are resumed on the spot; the root context is resumed as soon
    /// as the current hub callback returns.
    pub(crate) fn switch_to(&self, target: &Caller, resume: Resume) {
        match target {
            Caller::Root => {
                let mut slot = self.inner.root_resume.borrow_mut();
                if !matches!(*slot, Some(Resume::Throw(_))) {
                    *slot = Some(resume);
                }
            }
            Caller::Fiber(core) => self.resume_fiber(core, resume),
            Caller::Hub => {}
        }
    }

    pub(crate) fn resume_fiber(&self, core: &Rc<FiberCore>, resume: Resume) {
        if core.is_finished() {
            return;
        }

        let taken = core.coroutine.borrow_mut().take();
        let Some(mut coroutine) = taken else {
            // The fiber is on the current call chain; try again next tick.
            let hub = self.downgrade();
            let core = core.clone();
            self.schedule_call_global(Duration::ZERO, move || {
                if let Some(hub) = hub.upgrade() {
                    hub.resume_fiber(&core, resume);
                }
            });
            return;
        };

        *core.resume.borrow_mut() = Some(resume);
        core.state.set(FiberState::Running);

        let previous = self.inner.current.replace(Caller::Fiber(core.clone()));
        // The fiber's free-function calls must land on this hub, whichever
        // hub the thread had installed.
        let outcome = context::enter(self.clone(), || {
            panic::catch_unwind(AssertUnwindSafe(|| coroutine.resume()))
        });
        self.inner.current.replace(previous);

        if outcome.is_err() || coroutine.is_done() {
            core.state.set(FiberState::Finished);
            drop(coroutine);
        } else {
            if core.state.get() == FiberState::Running {
                core.state.set(FiberState::Suspended);
            }
            *core.coroutine.borrow_mut() = Some(coroutine);
        }

        if let Err(payload) = outcome {
            self.report(&Error::from_panic(payload));
        }
    }

    /// Suspends the hub fiber in favour of the root context once the root
    /// has been made runnable.
    pub(crate) fn yield_to_root_if_woken(&self) {
        let woken = self.inner.root_resume.borrow().is_some();
        if woken && matches!(self.caller(), Caller::Hub) {
            crate::fiber::suspend();
        }
    }

    /// Runs one hub callback, routing a panic to the exception hook and
    /// timing it when blocking detection is on.
    pub(crate) fn invoke<F>(&self, callback: F, report: bool)
    where
        F: FnOnce(),
    {
        let started = self
            .inner
            .debug_blocking
            .get()
            .map(|limit| (limit, Instant::now()));

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            if report {
                self.report(&Error::from_panic(payload));
            }
        }

        if let Some((limit, started)) = started {
            let elapsed = started.elapsed();
            if elapsed > limit {
                self.report(&Error::Blocked(elapsed));
            }
        }
    }

    /// Runs the event loop until it is stopped with [`Hub::abort`].
    ///
    /// Only the root context can do this; inside a fiber the loop is
    /// already running and [`Error::AlreadyRunning`] is returned.
    pub fn run(&self) -> Result<()> {
        if !matches!(self.caller(), Caller::Root) {
            return Err(Error::AlreadyRunning);
        }

        loop {
            self.switch()?;
            if !self.inner.running.get() {
                return Ok(());
            }
        }
    }

    /// Stops the loop after its current iteration.
    ///
    /// With `wait`, also switches to the hub so the loop gets to finish;
    /// from the root context this returns once it has.
    pub fn abort(&self, wait: bool) -> Result<()> {
        if wait && matches!(self.caller(), Caller::Hub) {
            return Err(Error::AbortFromHub);
        }

        self.inner.stopping.set(true);
        if !wait {
            return Ok(());
        }

        match self.caller() {
            Caller::Root => {
                while self.inner.running.get() {
                    self.switch()?;
                }
                Ok(())
            }
            _ => self.switch(),
        }
    }

    fn run_loop(&self) -> Result<()> {
        if self.inner.running.replace(true) {
            return Err(Error::AlreadyRunning);
        }
        self.inner.stopping.set(false);

        struct Running<'a>(&'a Hub);

        impl Drop for Running<'_> {
            fn drop(&mut self) {
                self.0.inner.running.set(false);
                self.0.inner.stopping.set(false);
                self.0.clear_timers();
            }
        }

        let _running = Running(self);
        log::debug!("hub loop started");

        while !self.inner.stopping.get() {
            self.close_pending();

            self.prepare_timers();
            self.fire_timers(Instant::now());
            self.prepare_timers();

            if self.inner.stopping.get() {
                break;
            }

            let sleep = match self.next_due() {
                Some(due) => due.saturating_duration_since(Instant::now()),
                None => self.inner.config.default_idle,
            };
            self.wait(sleep)?;
        }

        log::debug!("hub loop stopped");
        Ok(())
    }

    /// Blocks in the backend for at most `timeout` and dispatches what it
    /// reports.
    fn wait(&self, timeout: Duration) -> Result<()> {
        let mut events = std::mem::take(&mut *self.inner.events.borrow_mut());
        events.clear();

        let waited = self.inner.backend.borrow_mut().wait(timeout, &mut events);
        if let Err(err) = waited {
            log::error!("polling backend failed: {}", err);
            return Err(err.into());
        }

        for event in events.drain(..) {
            self.dispatch(event);
        }

        *self.inner.events.borrow_mut() = events;
        Ok(())
    }

    fn dispatch(&self, event: PollEvent) {
        let fd = event.fd;

        if fd == self.inner.wake.fd() {
            if self.inner.wake.drain() {
                log::debug!("hub abort requested through wake handle");
                self.inner.stopping.set(true);
            }
            return;
        }

        if event.invalid {
            log::debug!("fd {} was invalidated", fd);
            self.remove_descriptor(fd);
            self.yield_to_root_if_woken();
            return;
        }

        if event.readable || event.error {
            let readiness = if event.readable {
                Readiness::Ready
            } else {
                Readiness::Error
            };
            self.fire_listener(Direction::Read, fd, readiness);
        }

        if event.writable || event.error {
            let readiness = if event.writable {
                Readiness::Ready
            } else {
                Readiness::Error
            };
            self.fire_listener(Direction::Write, fd, readiness);
        }
    }

    fn fire_listener(&self, direction: Direction, fd: RawFd, readiness: Readiness) {
        // Looked up at dispatch time: an earlier callback may have removed it.
        let callback = self.inner.registry.borrow().callback(direction, fd);
        let Some(callback) = callback else {
            return;
        };

        self.invoke(|| callback(readiness), true);
        self.yield_to_root_if_woken();
    }
}

/// Suspends a fiber until the hub resumes it, surfacing a pending kill.
fn switch_from_fiber(core: &Rc<FiberCore>) -> Result<()> {
    if let Some(err) = core.pending_kill.borrow_mut().take() {
        return Err(err);
    }

    crate::fiber::suspend();

    let resume = core.resume.borrow_mut().take();
    if let Some(err) = core.pending_kill.borrow_mut().take() {
        return Err(err);
    }

    match resume {
        Some(Resume::Throw(err)) => Err(err),
        _ => Ok(()),
    }
}

impl PartialEq for Hub {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Hub {}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("backend", &self.backend_kind())
            .field("running", &self.inner.running.get())
            .field("timers", &self.timer_count())
            .finish()
    }
}

impl fmt::Debug for WeakHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHub")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
