//! kqueue backend (macOS and the BSDs).

use super::common::{cvt, retry_interrupted};
use super::{Backend, BackendKind, Interest, PollEvent};

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

const INITIAL_EVENTS: usize = 64;

pub struct KqueueBackend {
    kqueue: RawFd,
    interests: HashMap<RawFd, Interest>,
    buffer: Vec<libc::kevent>,
}

fn change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    let mut event: libc::kevent = unsafe { mem::zeroed() };
    event.ident = fd as _;
    event.filter = filter as _;
    event.flags = flags as _;
    event
}

impl KqueueBackend {
    pub fn new() -> io::Result<Self> {
        let kqueue = cvt(unsafe { libc::kqueue() })?;
        unsafe {
            libc::fcntl(kqueue, libc::F_SETFD, libc::FD_CLOEXEC);
        }

        Ok(Self {
            kqueue,
            interests: HashMap::new(),
            buffer: vec![unsafe { mem::zeroed() }; INITIAL_EVENTS],
        })
    }

    fn apply(&self, event: libc::kevent) -> io::Result<()> {
        let ret = unsafe {
            libc::kevent(
                self.kqueue,
                &event,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        cvt(ret).map(|_| ())
    }

    fn update(&self, fd: RawFd, filter: i16, was: bool, now: bool) -> io::Result<()> {
        match (was, now) {
            (false, true) => self.apply(change(fd, filter, (libc::EV_ADD | libc::EV_ENABLE) as u16)),
            (true, false) => match self.apply(change(fd, filter, libc::EV_DELETE as u16)) {
                Err(err)
                    if matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) =>
                {
                    Ok(())
                }
                other => other,
            },
            _ => Ok(()),
        }
    }
}

impl Backend for KqueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kqueue
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.is_empty() {
            return self.deregister(fd);
        }

        let old = self.interests.get(&fd).copied().unwrap_or(Interest::NONE);

        let result = self
            .update(fd, libc::EVFILT_READ as i16, old.read, interest.read)
            .and_then(|_| self.update(fd, libc::EVFILT_WRITE as i16, old.write, interest.write));

        match result {
            Ok(()) => {
                self.interests.insert(fd, interest);
                Ok(())
            }
            Err(err) => {
                let _ = self.deregister(fd);
                Err(err)
            }
        }
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(old) = self.interests.remove(&fd) else {
            return Ok(());
        };

        self.update(fd, libc::EVFILT_READ as i16, old.read, false)?;
        self.update(fd, libc::EVFILT_WRITE as i16, old.write, false)
    }

    fn wait(&mut self, timeout: Duration, events: &mut Vec<PollEvent>) -> io::Result<()> {
        let kqueue = self.kqueue;
        let buffer = &mut self.buffer;

        let ready = retry_interrupted(timeout, |remaining| {
            let spec = libc::timespec {
                tv_sec: remaining.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                tv_nsec: remaining.subsec_nanos() as _,
            };

            cvt(unsafe {
                libc::kevent(
                    kqueue,
                    ptr::null(),
                    0,
                    buffer.as_mut_ptr(),
                    buffer.len() as libc::c_int,
                    &spec,
                )
            })
        })? as usize;

        // One fd may show up once per filter; fold those into one event.
        let start = events.len();
        for raw in &self.buffer[..ready] {
            let fd = raw.ident as RawFd;
            let index = match events[start..].iter().position(|e| e.fd == fd) {
                Some(offset) => start + offset,
                None => {
                    events.push(PollEvent::new(fd));
                    events.len() - 1
                }
            };
            let event = &mut events[index];

            if raw.flags & (libc::EV_ERROR as u16) != 0 {
                event.error = true;
                if raw.data as i64 == libc::EBADF as i64 {
                    event.invalid = true;
                }
                continue;
            }

            if raw.filter == libc::EVFILT_READ as i16 {
                event.readable = true;
            } else if raw.filter == libc::EVFILT_WRITE as i16 {
                event.writable = true;
            }

            if raw.flags & (libc::EV_EOF as u16) != 0 {
                event.error = true;
            }
        }

        if ready == self.buffer.len() {
            let grown = self.buffer.len() * 2;
            self.buffer.resize(grown, unsafe { mem::zeroed() });
        }

        Ok(())
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kqueue);
        }
    }
}
