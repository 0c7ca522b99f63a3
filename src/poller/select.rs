//! `select(2)` backend, the last resort.
//!
//! Descriptors at or above `FD_SETSIZE` cannot be represented and are
//! rejected at registration.

use super::common::{is_valid_fd, retry_interrupted};
use super::{Backend, BackendKind, Interest, PollEvent};

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Default)]
pub struct SelectBackend {
    interests: BTreeMap<RawFd, Interest>,
}

struct FdSets {
    read: libc::fd_set,
    write: libc::fd_set,
    except: libc::fd_set,
}

impl SelectBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_sets(&self) -> (FdSets, RawFd) {
        let mut sets: FdSets = unsafe {
            FdSets {
                read: mem::zeroed(),
                write: mem::zeroed(),
                except: mem::zeroed(),
            }
        };
        unsafe {
            libc::FD_ZERO(&mut sets.read);
            libc::FD_ZERO(&mut sets.write);
            libc::FD_ZERO(&mut sets.except);
        }

        let mut max_fd = -1;
        for (&fd, interest) in &self.interests {
            unsafe {
                if interest.read {
                    libc::FD_SET(fd, &mut sets.read);
                }
                if interest.write {
                    libc::FD_SET(fd, &mut sets.write);
                }
                libc::FD_SET(fd, &mut sets.except);
            }
            max_fd = max_fd.max(fd);
        }

        (sets, max_fd)
    }

    /// Reports every registered descriptor the kernel no longer knows.
    fn probe_invalid(&self, events: &mut Vec<PollEvent>) {
        for &fd in self.interests.keys() {
            if !is_valid_fd(fd) {
                let mut event = PollEvent::new(fd);
                event.invalid = true;
                events.push(event);
            }
        }
    }
}

impl Backend for SelectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Select
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {fd} exceeds FD_SETSIZE for select"),
            ));
        }

        if interest.is_empty() {
            self.interests.remove(&fd);
        } else {
            self.interests.insert(fd, interest);
        }

        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, events: &mut Vec<PollEvent>) -> io::Result<()> {
        let result = retry_interrupted(timeout, |remaining| {
            // select() clobbers its arguments, so rebuild them every attempt.
            let (mut sets, max_fd) = self.build_sets();
            let mut tv = timeval(remaining);

            let ret = unsafe {
                libc::select(
                    max_fd + 1,
                    &mut sets.read,
                    &mut sets.write,
                    &mut sets.except,
                    &mut tv,
                )
            };

            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok((ret, sets))
            }
        });

        let sets = match result {
            Ok((0, _)) => {
                // Not every kernel fails a stale descriptor with EBADF; some
                // just let the wait time out.
                self.probe_invalid(events);
                return Ok(());
            }
            Ok((_, sets)) => sets,
            Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
                self.probe_invalid(events);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for (&fd, interest) in &self.interests {
            let mut event = PollEvent::new(fd);
            unsafe {
                event.readable = interest.read && libc::FD_ISSET(fd, &sets.read);
                event.writable = interest.write && libc::FD_ISSET(fd, &sets.write);
                event.error = libc::FD_ISSET(fd, &sets.except);
            }

            if !event.is_empty() {
                events.push(event);
            }
        }

        Ok(())
    }
}

/// Converts a timeout to a `timeval`, rounding up to the next microsecond.
fn timeval(timeout: Duration) -> libc::timeval {
    let micros = timeout.as_nanos().div_ceil(1_000);
    let secs = (micros / 1_000_000).min(libc::time_t::MAX as u128);

    libc::timeval {
        tv_sec: secs as libc::time_t,
        tv_usec: (micros % 1_000_000) as libc::suseconds_t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_descriptors_past_fd_setsize() {
        let mut backend = SelectBackend::new();
        let err = backend
            .register(libc::FD_SETSIZE as RawFd, Interest::READ)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn bad_descriptor_is_probed_and_reported() {
        let mut backend = SelectBackend::new();
        backend.register(901, Interest::READ).unwrap();

        let mut events = Vec::new();
        backend.wait(Duration::from_millis(10), &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, 901);
        assert!(events[0].invalid);
    }

    #[test]
    fn timeval_rounds_up() {
        let tv = timeval(Duration::from_nanos(1));
        assert_eq!((tv.tv_sec, tv.tv_usec), (0, 1));

        let tv = timeval(Duration::from_nanos(1_500_000_001));
        assert_eq!((tv.tv_sec, tv.tv_usec), (1, 500_001));

        let tv = timeval(Duration::from_secs(2));
        assert_eq!((tv.tv_sec, tv.tv_usec), (2, 0));
    }

    #[test]
    fn timeout_reports_nothing_for_idle_descriptors() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let mut backend = SelectBackend::new();
        backend.register(fds[0], Interest::READ).unwrap();

        let mut events = Vec::new();
        backend.wait(Duration::from_millis(5), &mut events).unwrap();
        assert!(events.is_empty());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn readable_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1) };

        let mut backend = SelectBackend::new();
        backend.register(fds[0], Interest::READ).unwrap();

        let mut events = Vec::new();
        backend.wait(Duration::from_millis(10), &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);
        assert!(!events[0].writable);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
