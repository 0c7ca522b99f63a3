//! Level-triggered epoll backend (Linux).

use super::common::{cvt, retry_interrupted, timeout_millis};
use super::{Backend, BackendKind, Interest, PollEvent};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const INITIAL_EVENTS: usize = 64;

pub struct EpollBackend {
    epoll_fd: RawFd,
    interests: HashMap<RawFd, Interest>,
    buffer: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

        Ok(Self {
            epoll_fd,
            interests: HashMap::new(),
            buffer: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENTS],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_flags(interest),
            u64: fd as u64,
        };

        cvt(unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) }).map(|_| ())
    }
}

fn epoll_flags(interest: Interest) -> u32 {
    let mut flags = 0;
    if interest.read {
        flags |= libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP;
    }
    if interest.write {
        flags |= libc::EPOLLOUT;
    }

    flags as u32
}

impl Backend for EpollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Epoll
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.is_empty() {
            return self.deregister(fd);
        }

        let known = self.interests.contains_key(&fd);
        let op = if known {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        // The fd may have been closed and reused behind our back, which
        // makes the kernel's view disagree with ours in either direction.
        let result = match self.ctl(op, fd, interest) {
            Err(err) if known && err.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
            }
            Err(err) if !known && err.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.interests.insert(fd, interest);
                Ok(())
            }
            Err(err) => {
                self.interests.remove(&fd);
                Err(err)
            }
        }
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.interests.remove(&fd).is_none() {
            return Ok(());
        }

        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // Closing an fd removes it from the epoll set on its own.
                Some(libc::ENOENT) | Some(libc::EBADF) | Some(libc::EPERM) => {}
                _ => return Err(err),
            }
        }

        Ok(())
    }

    fn wait(&mut self, timeout: Duration, events: &mut Vec<PollEvent>) -> io::Result<()> {
        let epoll_fd = self.epoll_fd;
        let buffer = &mut self.buffer;

        let ready = retry_interrupted(timeout, |remaining| {
            cvt(unsafe {
                libc::epoll_wait(
                    epoll_fd,
                    buffer.as_mut_ptr(),
                    buffer.len() as libc::c_int,
                    timeout_millis(remaining),
                )
            })
        })? as usize;

        for raw in &self.buffer[..ready] {
            let flags = raw.events as libc::c_int;
            let mut event = PollEvent::new(raw.u64 as RawFd);

            event.readable = flags & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) != 0;
            event.writable = flags & libc::EPOLLOUT != 0;
            event.error = flags & (libc::EPOLLERR | libc::EPOLLHUP) != 0;

            if !event.is_empty() {
                events.push(event);
            }
        }

        if ready == self.buffer.len() {
            let grown = self.buffer.len() * 2;
            self.buffer
                .resize(grown, libc::epoll_event { events: 0, u64: 0 });
        }

        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fds: &[RawFd]) {
        for fd in fds {
            unsafe { libc::close(*fd) };
        }
    }

    #[test]
    fn pipe_readiness() {
        let mut backend = EpollBackend::new().unwrap();
        let (read_fd, write_fd) = pipe();
        backend.register(read_fd, Interest::READ).unwrap();

        let mut events = Vec::new();
        backend.wait(Duration::ZERO, &mut events).unwrap();
        assert!(events.is_empty());

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
        backend.wait(Duration::from_millis(100), &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, read_fd);
        assert!(events[0].readable);

        close(&[read_fd, write_fd]);
    }

    #[test]
    fn reregistering_replaces_interest() {
        let mut backend = EpollBackend::new().unwrap();
        let (read_fd, write_fd) = pipe();

        backend.register(write_fd, Interest::WRITE).unwrap();
        backend.register(write_fd, Interest::NONE).unwrap();

        let mut events = Vec::new();
        backend.wait(Duration::ZERO, &mut events).unwrap();
        assert!(events.is_empty());

        backend.register(write_fd, Interest::WRITE).unwrap();
        backend.wait(Duration::ZERO, &mut events).unwrap();
        assert!(events[0].writable);

        close(&[read_fd, write_fd]);
    }

    #[test]
    fn timeout_without_events() {
        let mut backend = EpollBackend::new().unwrap();
        let mut events = Vec::new();

        let start = std::time::Instant::now();
        backend.wait(Duration::from_millis(20), &mut events).unwrap();

        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn deregistering_unknown_fd_is_ok() {
        let mut backend = EpollBackend::new().unwrap();
        backend.deregister(1000).unwrap();
    }
}
