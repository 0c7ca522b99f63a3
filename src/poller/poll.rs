//! Portable `poll(2)` backend.

use super::common::{retry_interrupted, timeout_millis};
use super::{Backend, BackendKind, Interest, PollEvent};

use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Default)]
pub struct PollBackend {
    interests: BTreeMap<RawFd, Interest>,
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for PollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
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
        self.fds.clear();
        self.fds.extend(self.interests.iter().map(|(&fd, interest)| {
            let mut wanted = 0;
            if interest.read {
                wanted |= libc::POLLIN | libc::POLLPRI;
            }
            if interest.write {
                wanted |= libc::POLLOUT;
            }

            libc::pollfd {
                fd,
                events: wanted,
                revents: 0,
            }
        }));

        let fds = &mut self.fds;
        retry_interrupted(timeout, |remaining| {
            let ret = unsafe {
                libc::poll(
                    fds.as_mut_ptr(),
                    fds.len() as libc::nfds_t,
                    timeout_millis(remaining),
                )
            };

            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        })?;

        for pollfd in &self.fds {
            let revents = pollfd.revents;
            if revents == 0 {
                continue;
            }

            let mut event = PollEvent::new(pollfd.fd);
            event.readable = revents & (libc::POLLIN | libc::POLLPRI) != 0;
            event.writable = revents & libc::POLLOUT != 0;
            event.error = revents & (libc::POLLERR | libc::POLLHUP) != 0;
            event.invalid = revents & libc::POLLNVAL != 0;

            events.push(event);
        }

        Ok(())
    }
}
