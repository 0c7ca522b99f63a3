use super::event::Event;
use super::{Caller, Coroutine, FiberCore, FiberRef, FiberState, Resume};
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::timer::TimerKind;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

type LinkCallback<T> = Box<dyn FnOnce(&FiberHandle<T>)>;

/// Identifies a callback registered with [`FiberHandle::link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

struct Shared<T> {
    exit: Event<T>,
    links: RefCell<Vec<(LinkId, LinkCallback<T>)>>,
    next_link: Cell<u64>,
}

/// A spawned fiber together with its result.
pub struct FiberHandle<T> {
    fiber: FiberRef,
    shared: Rc<Shared<T>>,
}

impl<T> Clone for FiberHandle<T> {
    fn clone(&self) -> Self {
        Self {
            fiber: self.fiber.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> FiberHandle<T> {
    /// Blocks until the fiber finishes and returns its result. Every caller
    /// gets the same result, errors included.
    pub fn wait(&self) -> Result<T>
    where
        T: Clone,
    {
        match self.fiber.core.hub.upgrade() {
            Some(hub) => self.shared.exit.wait_on(&hub),
            None => self.shared.exit.wait(),
        }
    }

    /// The result, if the fiber has finished.
    pub fn result(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.shared.exit.poll()
    }

    /// Runs `callback` once the fiber has finished, from the hub, on a loop
    /// tick after the one that finished it. Linking to a finished fiber
    /// schedules the callback right away.
    pub fn link<F>(&self, callback: F) -> LinkId
    where
        F: FnOnce(&FiberHandle<T>) + 'static,
    {
        let id = LinkId(self.shared.next_link.get());
        self.shared.next_link.set(id.0 + 1);

        if self.is_dead() {
            if let Some(hub) = self.fiber.core.hub.upgrade() {
                schedule_link(&hub, self.clone(), Box::new(callback));
            }
        } else {
            self.shared.links.borrow_mut().push((id, Box::new(callback)));
        }

        id
    }

    /// Removes a link that has not run yet. Returns whether it was found.
    pub fn unlink(&self, id: LinkId) -> bool {
        let removed = {
            let mut links = self.shared.links.borrow_mut();
            links
                .iter()
                .position(|(link, _)| *link == id)
                .map(|position| links.remove(position))
        };

        removed.is_some()
    }

    /// Kills the fiber with [`Error::Cancelled`].
    pub fn cancel(&self) -> Result<()> {
        kill(&self.fiber)
    }

    pub fn is_dead(&self) -> bool {
        self.fiber.is_dead()
    }

    pub fn state(&self) -> FiberState {
        self.fiber.state()
    }

    pub fn id(&self) -> super::FiberId {
        self.fiber.id()
    }

    pub fn fiber(&self) -> &FiberRef {
        &self.fiber
    }

    fn finish(&self, hub: &Hub, result: Result<T>) {
        self.fiber.core.state.set(FiberState::Finished);

        let links = std::mem::take(&mut *self.shared.links.borrow_mut());
        if let Err(err) = &result {
            if links.is_empty() && !self.shared.exit.has_waiters() && !err.is_cancelled() {
                hub.report(err);
            }
        }

        let _ = self.shared.exit.send_result(result);

        for (_, callback) in links {
            schedule_link(hub, self.clone(), callback);
        }
    }
}

fn schedule_link<T: 'static>(hub: &Hub, handle: FiberHandle<T>, callback: LinkCallback<T>) {
    hub.schedule_call_global(Duration::ZERO, move || callback(&handle));
}

impl<T> AsRef<FiberRef> for FiberHandle<T> {
    fn as_ref(&self) -> &FiberRef {
        &self.fiber
    }
}

impl<T> fmt::Debug for FiberHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("fiber", &self.fiber)
            .finish()
    }
}

/// Runs the body unless the fiber was killed before it started.
fn run_body<T, F>(core: &FiberCore, body: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let start = core.resume.borrow_mut().take();
    if let Some(Resume::Throw(err)) = start {
        return Err(err);
    }

    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}

impl Hub {
    /// Spawns `body` as a fiber that starts on the next loop iteration.
    pub fn spawn<T, F>(&self, body: F) -> FiberHandle<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        self.spawn_with(Duration::ZERO, TimerKind::Global, body)
    }

    /// Spawns `body` as a fiber that starts after `delay`.
    pub fn spawn_after<T, F>(&self, delay: Duration, body: F) -> FiberHandle<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        self.spawn_with(delay, TimerKind::Global, body)
    }

    /// Like [`Hub::spawn_after`], but the fiber never starts if the fiber
    /// calling this has finished by then.
    pub fn spawn_after_local<T, F>(&self, delay: Duration, body: F) -> FiberHandle<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        self.spawn_with(delay, TimerKind::Local, body)
    }

    /// Spawns a fire-and-forget fiber. Its errors go to the exception hook.
    pub fn spawn_n<F>(&self, body: F) -> FiberRef
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let hub = self.downgrade();

        self.start_fiber(Duration::ZERO, TimerKind::Global, move |core| {
            let result = run_body(&core, body);
            core.state.set(FiberState::Finished);

            if let (Err(err), Some(hub)) = (result, hub.upgrade()) {
                if !err.is_cancelled() {
                    hub.report(&err);
                }
            }
        })
    }

    fn spawn_with<T, F>(&self, delay: Duration, kind: TimerKind, body: F) -> FiberHandle<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T> + 'static,
    {
        let shared = Rc::new(Shared {
            exit: Event::new(),
            links: RefCell::new(Vec::new()),
            next_link: Cell::new(0),
        });

        let hub = self.downgrade();
        let inner = shared.clone();

        let fiber = self.start_fiber(delay, kind, move |core| {
            let result = run_body(&core, body);

            let handle = FiberHandle {
                fiber: FiberRef { core },
                shared: inner,
            };
            if let Some(hub) = hub.upgrade() {
                handle.finish(&hub, result);
            }
        });

        FiberHandle { fiber, shared }
    }

    /// Creates a fiber around `run` and schedules its start.
    fn start_fiber<F>(&self, delay: Duration, kind: TimerKind, run: F) -> FiberRef
    where
        F: FnOnce(Rc<FiberCore>) + 'static,
    {
        let core = FiberCore::new(self);
        let weak = Rc::downgrade(&core);

        let coroutine = Coroutine::new(self.config().fiber_stack_size, move || {
            if let Some(core) = weak.upgrade() {
                run(core);
            }
        });
        *core.coroutine.borrow_mut() = Some(coroutine);

        let hub = self.downgrade();
        let starting = core.clone();
        let start = move || {
            starting.start_timer.borrow_mut().take();
            if let Some(hub) = hub.upgrade() {
                hub.resume_fiber(&starting, Resume::Start);
            }
        };

        let timer = match kind {
            TimerKind::Global => self.schedule_call_global(delay, start),
            TimerKind::Local => self.schedule_call_local(delay, start),
        };
        *core.start_timer.borrow_mut() = Some(timer);
        log::trace!("spawned {}", core.id);

        FiberRef { core }
    }
}

/// Spawns `body` on the current thread's hub.
///
/// # Example
///
/// ```ignore
/// let fiber = fiberhub::spawn(|| Ok(1 + 1));
/// assert_eq!(fiber.wait().unwrap(), 2);
/// ```
pub fn spawn<T, F>(body: F) -> FiberHandle<T>
where
    T: 'static,
    F: FnOnce() -> Result<T> + 'static,
{
    Hub::current().spawn(body)
}

pub fn spawn_after<T, F>(delay: Duration, body: F) -> FiberHandle<T>
where
    T: 'static,
    F: FnOnce() -> Result<T> + 'static,
{
    Hub::current().spawn_after(delay, body)
}

pub fn spawn_after_local<T, F>(delay: Duration, body: F) -> FiberHandle<T>
where
    T: 'static,
    F: FnOnce() -> Result<T> + 'static,
{
    Hub::current().spawn_after_local(delay, body)
}

pub fn spawn_n<F>(body: F) -> FiberRef
where
    F: FnOnce() -> Result<()> + 'static,
{
    Hub::current().spawn_n(body)
}

/// Kills `fiber` with [`Error::Cancelled`]. See [`kill_with`].
pub fn kill<F: AsRef<FiberRef>>(fiber: F) -> Result<()> {
    kill_with(fiber, Error::Cancelled)
}

/// Finishes `fiber` with `error`.
///
/// A fiber that has not started finishes without running its body. A
/// suspended fiber gets `error` from the call it is blocked in once it is
/// resumed. Unless called from the hub itself, this yields to the hub
/// before returning so the target has observed the error by then.
/// Killing the calling fiber returns `error` straight away.
pub fn kill_with<F: AsRef<FiberRef>>(fiber: F, error: Error) -> Result<()> {
    let core = &fiber.as_ref().core;
    let Some(hub) = core.hub.upgrade() else {
        return Ok(());
    };

    if core.is_finished() {
        return Ok(());
    }

    let caller = hub.caller();
    if let Caller::Fiber(current) = &caller {
        if Rc::ptr_eq(current, core) {
            return Err(error);
        }
    }
    log::trace!("killing {}: {}", core.id, error);

    if core.state.get() == FiberState::NotStarted {
        let timer = core.start_timer.borrow_mut().take();
        if let Some(timer) = timer {
            timer.cancel();
        }
        hub.resume_fiber(core, Resume::Throw(error));
    } else {
        *core.pending_kill.borrow_mut() = Some(error);

        if matches!(caller, Caller::Hub) {
            deliver_kill(&hub, core);
        } else {
            let weak = hub.downgrade();
            let target = core.clone();
            hub.schedule_call_global(Duration::ZERO, move || {
                if let Some(hub) = weak.upgrade() {
                    deliver_kill(&hub, &target);
                }
            });
        }
    }

    if matches!(caller, Caller::Hub) {
        Ok(())
    } else {
        hub.sleep(Duration::ZERO)
    }
}

fn deliver_kill(hub: &Hub, core: &Rc<FiberCore>) {
    let pending = core.pending_kill.borrow().is_some();
    if pending && !core.is_finished() {
        hub.resume_fiber(core, Resume::Wake);
    }
}
