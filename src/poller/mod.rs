//! OS readiness notification.
//!
//! A [`Backend`] keeps one interest set per descriptor and reports which
//! descriptors became ready during [`Backend::wait`]. The hub owns exactly
//! one backend, chosen at creation time from [`BackendKind::PREFERENCE`] or
//! from an explicit override.
//!
//! All backends are level-triggered: a descriptor that stays readable is
//! reported again on every wait until it is drained or deregistered.

pub(crate) mod common;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
pub mod kqueue;

pub mod poll;
pub mod select;

use crate::error::{Error, Result};

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::Duration;

/// Directions a backend should watch for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// Readiness of one descriptor, as reported by [`Backend::wait`].
///
/// `error` covers hang-up and error conditions and wakes both directions.
/// `invalid` means the descriptor is no longer usable (closed under the
/// backend) and every listener on it should be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub invalid: bool,
}

impl PollEvent {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            readable: false,
            writable: false,
            error: false,
            invalid: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error || self.invalid)
    }
}

/// An OS polling facility.
///
/// `register` replaces the interest set of `fd`; registering
/// [`Interest::NONE`] is equivalent to `deregister`. `deregister` on an
/// unknown descriptor is not an error.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks for at most `timeout`, appending ready descriptors to
    /// `events`. Interrupted waits are retried with the remaining time.
    fn wait(&mut self, timeout: Duration, events: &mut Vec<PollEvent>) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Epoll,
    Kqueue,
    Poll,
    Select,
}

impl BackendKind {
    /// Order in which backends are tried when none is requested.
    pub const PREFERENCE: [BackendKind; 4] = [
        BackendKind::Epoll,
        BackendKind::Kqueue,
        BackendKind::Poll,
        BackendKind::Select,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Poll => "poll",
            BackendKind::Select => "select",
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            BackendKind::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            BackendKind::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd"
            )),
            BackendKind::Poll | BackendKind::Select => true,
        }
    }

    /// Opens a backend of this kind.
    pub fn open(self) -> Result<Box<dyn Backend>> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            BackendKind::Epoll => Ok(Box::new(epoll::EpollBackend::new()?)),

            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd"
            ))]
            BackendKind::Kqueue => Ok(Box::new(kqueue::KqueueBackend::new()?)),

            BackendKind::Poll => Ok(Box::new(poll::PollBackend::new())),
            BackendKind::Select => Ok(Box::new(select::SelectBackend::new())),

            #[allow(unreachable_patterns)]
            other => Err(Error::BackendUnavailable(other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epoll" => Ok(BackendKind::Epoll),
            "kqueue" => Ok(BackendKind::Kqueue),
            "poll" => Ok(BackendKind::Poll),
            "select" => Ok(BackendKind::Select),
            _ => Err(Error::UnknownBackend(s.to_string())),
        }
    }
}

/// Opens `requested`, or the first backend of [`BackendKind::PREFERENCE`]
/// that this platform supports and that opens successfully.
pub(crate) fn open(requested: Option<BackendKind>) -> Result<Box<dyn Backend>> {
    if let Some(kind) = requested {
        log::debug!("opening requested polling backend {}", kind);
        return kind.open();
    }

    for kind in BackendKind::PREFERENCE {
        if !kind.is_available() {
            continue;
        }

        match kind.open() {
            Ok(backend) => {
                log::debug!("selected polling backend {}", kind);
                return Ok(backend);
            }
            Err(err) => log::debug!("polling backend {} failed to open: {}", kind, err),
        }
    }

    Err(Error::NoBackend)
}
