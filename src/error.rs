//! Error type shared by the hub, the polling backends and fibers.
//!
//! [`Error`] is `Clone` because a fiber's result is delivered to every
//! waiter; OS errors are therefore kept behind an [`Arc`].

use crate::hub::listener::Direction;
use crate::poller::BackendKind;

use std::any::Any;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A second primary listener was requested for `(fd, direction)` while
    /// the single-owner policy is enabled.
    #[error("{direction} listener already registered for fd {fd}{}", registered_suffix(.registered_at))]
    ConflictingListener {
        direction: Direction,
        fd: RawFd,
        registered_at: Option<Arc<str>>,
    },

    #[error("timed out")]
    Timeout,

    #[error("fiber was cancelled")]
    Cancelled,

    #[error("fd {fd} was closed while a fiber was waiting on it")]
    DescriptorClosed { fd: RawFd },

    #[error("blocking call made from inside the hub")]
    BlockingInHub,

    #[error("cannot abort with wait from inside the hub")]
    AbortFromHub,

    #[error("the hub loop is already running")]
    AlreadyRunning,

    #[error("blocking call resumed without an event")]
    Interrupted,

    #[error("hub fiber exited: {0}")]
    HubExited(#[source] Box<Error>),

    #[error("panicked: {0}")]
    Panicked(Arc<str>),

    #[error("callback blocked the hub for {0:?}")]
    Blocked(Duration),

    #[error("event already has a value")]
    AlreadySent,

    #[error("interest must include read or write")]
    EmptyInterest,

    #[error("unknown polling backend `{0}`")]
    UnknownBackend(String),

    #[error("polling backend {0} is not available on this platform")]
    BackendUnavailable(BackendKind),

    #[error("the default polling backend was already chosen")]
    BackendLocked,

    #[error("no polling backend could be opened")]
    NoBackend,

    #[error(transparent)]
    Io(Arc<io::Error>),

    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

fn registered_suffix(registered_at: &Option<Arc<str>>) -> String {
    match registered_at {
        Some(trace) => format!("; existing listener registered at:\n{trace}"),
        None => String::new(),
    }
}

impl Error {
    /// Wraps an arbitrary error so it can travel through fiber results.
    pub fn custom<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Other(Arc::new(error))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Error::Panicked(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns the raw OS error code for `Io` errors.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
