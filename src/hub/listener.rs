//! Per-descriptor listener registry.
//!
//! For every `(fd, direction)` there is at most one primary listener, the
//! one the backend reports readiness to. Further registrations wait in a
//! FIFO of secondaries and the head is promoted when the primary goes away.

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::poller::Interest;

use std::backtrace::Backtrace;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub(crate) const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }

    pub(crate) fn in_interest(self, interest: Interest) -> bool {
        match self {
            Direction::Read => interest.read,
            Direction::Write => interest.write,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// What a listener callback is being told about its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Hang-up or error condition; the next I/O call will report it.
    Error,
    /// The descriptor was invalidated and the listener has been removed.
    Closed,
}

pub(crate) type ListenerCallback = Rc<dyn Fn(Readiness)>;

pub(crate) struct Listener {
    id: u64,
    fd: RawFd,
    direction: Direction,
    pub(crate) callback: ListenerCallback,
    registered_at: Option<Arc<str>>,
}

impl Listener {
    fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            fd: self.fd,
            direction: self.direction,
            registered_at: self.registered_at.clone(),
        }
    }
}

/// Returned by [`Hub::add`]; pass it to [`Hub::remove`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    id: u64,
    fd: RawFd,
    direction: Direction,
}

impl ListenerHandle {
    /// Matches [`ListenerInfo::id`].
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Description of a registered primary listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub id: u64,
    pub fd: RawFd,
    pub direction: Direction,
    /// Backtrace of the `add` call, captured when debug listeners are on.
    pub registered_at: Option<Arc<str>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    primary: [HashMap<RawFd, Listener>; 2],
    secondary: [HashMap<RawFd, VecDeque<Listener>>; 2],
    next_id: u64,
}

impl Registry {
    pub(crate) fn primary(&self, direction: Direction, fd: RawFd) -> Option<&Listener> {
        self.primary[direction.index()].get(&fd)
    }

    pub(crate) fn callback(&self, direction: Direction, fd: RawFd) -> Option<ListenerCallback> {
        self.primary(direction, fd).map(|l| l.callback.clone())
    }

    /// Interest the backend should hold for `fd`.
    pub(crate) fn interest(&self, fd: RawFd) -> Interest {
        Interest {
            read: self.primary[0].contains_key(&fd),
            write: self.primary[1].contains_key(&fd),
        }
    }

    /// Stores a listener, as primary when the slot is free. Returns its handle.
    fn insert(
        &mut self,
        direction: Direction,
        fd: RawFd,
        callback: ListenerCallback,
        registered_at: Option<Arc<str>>,
    ) -> ListenerHandle {
        let id = self.next_id;
        self.next_id += 1;

        let listener = Listener {
            id,
            fd,
            direction,
            callback,
            registered_at,
        };

        let index = direction.index();
        if self.primary[index].contains_key(&fd) {
            self.secondary[index].entry(fd).or_default().push_back(listener);
        } else {
            self.primary[index].insert(fd, listener);
        }

        ListenerHandle { id, fd, direction }
    }

    /// Removes the listener behind `handle`. The flag tells whether it was
    /// the primary, in which case the next secondary has been promoted.
    fn remove(&mut self, handle: &ListenerHandle) -> Option<(Listener, bool)> {
        let index = handle.direction.index();

        if self.primary[index].get(&handle.fd).map(|l| l.id) == Some(handle.id) {
            let removed = self.primary[index].remove(&handle.fd)?;
            self.promote(handle.direction, handle.fd);
            return Some((removed, true));
        }

        let queue = self.secondary[index].get_mut(&handle.fd)?;
        let position = queue.iter().position(|l| l.id == handle.id)?;
        let removed = queue.remove(position);
        if queue.is_empty() {
            self.secondary[index].remove(&handle.fd);
        }

        removed.map(|listener| (listener, false))
    }

    fn promote(&mut self, direction: Direction, fd: RawFd) {
        let index = direction.index();
        let Some(queue) = self.secondary[index].get_mut(&fd) else {
            return;
        };

        if let Some(next) = queue.pop_front() {
            self.primary[index].insert(fd, next);
        }
        if queue.is_empty() {
            self.secondary[index].remove(&fd);
        }
    }

    /// Removes every listener of `fd`, primaries first.
    fn remove_fd(&mut self, fd: RawFd) -> Vec<Listener> {
        let mut removed = Vec::new();

        for direction in Direction::ALL {
            let index = direction.index();
            removed.extend(self.primary[index].remove(&fd));
            removed.extend(self.secondary[index].remove(&fd).into_iter().flatten());
        }

        removed
    }

    fn infos(&self, direction: Direction) -> Vec<ListenerInfo> {
        let mut infos: Vec<_> = self.primary[direction.index()]
            .values()
            .map(Listener::info)
            .collect();
        infos.sort_by_key(|info| info.id);

        infos
    }

    fn count(&self, fd: RawFd) -> usize {
        Direction::ALL
            .into_iter()
            .map(|direction| {
                let index = direction.index();
                let primary = usize::from(self.primary[index].contains_key(&fd));
                let secondary = self.secondary[index].get(&fd).map_or(0, VecDeque::len);
                primary + secondary
            })
            .sum()
    }
}

impl Hub {
    /// Registers `callback` for readiness of `fd` in `direction`.
    ///
    /// The caller is responsible for putting `fd` in non-blocking mode.
    /// With the single-owner policy on, a second primary listener for the
    /// same `(fd, direction)` is refused with [`Error::ConflictingListener`];
    /// with it off the new listener is queued behind the current one.
    pub fn add<F>(&self, direction: Direction, fd: RawFd, callback: F) -> Result<ListenerHandle>
    where
        F: Fn(Readiness) + 'static,
    {
        let registered_at: Option<Arc<str>> = self
            .inner
            .debug_listeners
            .get()
            .then(|| Backtrace::force_capture().to_string().into());

        let interest = {
            let registry = self.inner.registry.borrow();

            match registry.primary(direction, fd) {
                Some(existing) if self.inner.single_owner.get() => {
                    return Err(Error::ConflictingListener {
                        direction,
                        fd,
                        registered_at: existing.registered_at.clone(),
                    });
                }
                Some(_) => None,
                None => {
                    let mut interest = registry.interest(fd);
                    match direction {
                        Direction::Read => interest.read = true,
                        Direction::Write => interest.write = true,
                    }
                    Some(interest)
                }
            }
        };

        if let Some(interest) = interest {
            let registered = self.inner.backend.borrow_mut().register(fd, interest);

            if let Err(err) = registered {
                if err.raw_os_error() == Some(libc::EBADF) {
                    self.remove_descriptor(fd);
                }
                return Err(err.into());
            }
        }

        let handle = self.inner.registry.borrow_mut().insert(
            direction,
            fd,
            Rc::new(callback),
            registered_at,
        );
        log::trace!("added {} listener {} for fd {}", direction, handle.id, fd);

        Ok(handle)
    }

    /// Unregisters a listener. Removing an already removed listener is a
    /// no-op.
    pub fn remove(&self, handle: &ListenerHandle) {
        let removed = self.inner.registry.borrow_mut().remove(handle);
        let Some((listener, was_primary)) = removed else {
            return;
        };

        if was_primary {
            self.sync_interest(handle.fd);
        }
        log::trace!("removed {} listener {} for fd {}", handle.direction, handle.id, handle.fd);

        drop(listener);
    }

    /// Drops every listener of `fd` and tells each of them, once, that the
    /// descriptor is gone.
    pub fn remove_descriptor(&self, fd: RawFd) {
        let listeners = self.detach_descriptor(fd);
        self.notify_closed(listeners);
    }

    /// Like [`Hub::remove_descriptor`], but the callbacks run at the start
    /// of the next loop iteration. Call it before closing `fd`.
    pub fn notify_close(&self, fd: RawFd) {
        let listeners = self.detach_descriptor(fd);
        self.inner.closing.borrow_mut().extend(listeners);
    }

    fn detach_descriptor(&self, fd: RawFd) -> Vec<Listener> {
        let listeners = self.inner.registry.borrow_mut().remove_fd(fd);
        if let Err(err) = self.inner.backend.borrow_mut().deregister(fd) {
            log::debug!("deregistering fd {} failed: {}", fd, err);
        }

        listeners
    }

    fn notify_closed(&self, listeners: Vec<Listener>) {
        for listener in listeners {
            let callback = listener.callback;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(Readiness::Closed))) {
                self.report(&Error::from_panic(payload));
            }
        }
    }

    /// Runs callbacks deferred by [`Hub::notify_close`].
    pub(crate) fn close_pending(&self) {
        let listeners = std::mem::take(&mut *self.inner.closing.borrow_mut());
        if !listeners.is_empty() {
            self.notify_closed(listeners);
        }
    }

    /// Brings the backend's interest for `fd` in line with the registry.
    fn sync_interest(&self, fd: RawFd) {
        let interest = self.inner.registry.borrow().interest(fd);
        if let Err(err) = self.inner.backend.borrow_mut().register(fd, interest) {
            log::debug!("updating interest for fd {} failed: {}", fd, err);
        }
    }

    /// Primary read listeners.
    pub fn get_readers(&self) -> Vec<ListenerInfo> {
        self.inner.registry.borrow().infos(Direction::Read)
    }

    /// Primary write listeners.
    pub fn get_writers(&self) -> Vec<ListenerInfo> {
        self.inner.registry.borrow().infos(Direction::Write)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.listener_count(fd) > 0
    }

    /// Listeners of `fd` in both directions, queued secondaries included.
    pub fn listener_count(&self, fd: RawFd) -> usize {
        self.inner.registry.borrow().count(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ListenerCallback {
        Rc::new(|_| {})
    }

    #[test]
    fn secondaries_are_promoted_in_order() {
        let mut registry = Registry::default();
        let first = registry.insert(Direction::Read, 5, noop(), None);
        let second = registry.insert(Direction::Read, 5, noop(), None);
        let third = registry.insert(Direction::Read, 5, noop(), None);

        assert_eq!(registry.infos(Direction::Read).len(), 1);
        assert_eq!(registry.count(5), 3);

        let (_, was_primary) = registry.remove(&first).unwrap();
        assert!(was_primary);
        assert_eq!(registry.primary(Direction::Read, 5).map(|l| l.id), Some(second.id));

        let (_, was_primary) = registry.remove(&third).unwrap();
        assert!(!was_primary);
        assert_eq!(registry.count(5), 1);
    }

    #[test]
    fn removal_is_idempotent() {
        let mut registry = Registry::default();
        let handle = registry.insert(Direction::Write, 3, noop(), None);

        assert!(registry.remove(&handle).is_some());
        assert!(registry.remove(&handle).is_none());
        assert_eq!(registry.interest(3), Interest::NONE);
    }

    #[test]
    fn remove_fd_takes_both_directions() {
        let mut registry = Registry::default();
        registry.insert(Direction::Read, 7, noop(), None);
        registry.insert(Direction::Read, 7, noop(), None);
        registry.insert(Direction::Write, 7, noop(), None);
        registry.insert(Direction::Read, 8, noop(), None);

        assert_eq!(registry.interest(7), Interest::BOTH);
        assert_eq!(registry.remove_fd(7).len(), 3);
        assert_eq!(registry.count(7), 0);
        assert_eq!(registry.count(8), 1);
    }
}
