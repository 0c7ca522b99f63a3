//! Cross-thread wake channel.
//!
//! A non-blocking socket pair whose read end sits in the backend next to
//! the regular descriptors. Writing a byte from any thread makes the hub's
//! blocking wait return.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

struct WakeShared {
    writer: UnixStream,
    abort: AtomicBool,
}

pub(crate) struct WakeChannel {
    reader: UnixStream,
    shared: Arc<WakeShared>,
}

impl WakeChannel {
    pub(crate) fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        Ok(Self {
            reader,
            shared: Arc::new(WakeShared {
                writer,
                abort: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub(crate) fn handle(&self) -> WakeHandle {
        WakeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Empties the socket and returns whether an abort was requested.
    pub(crate) fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        self.shared.abort.swap(false, Ordering::AcqRel)
    }
}

/// Wakes a hub from another thread.
///
/// This is the only part of a hub that is `Send`.
#[derive(Clone)]
pub struct WakeHandle {
    shared: Arc<WakeShared>,
}

impl WakeHandle {
    /// Makes the hub's current or next backend wait return immediately.
    pub fn wake(&self) {
        // A full socket already guarantees a wake-up.
        let _ = (&self.shared.writer).write(&[1]);
    }

    /// Stops the hub loop at its next iteration.
    pub fn abort(&self) {
        self.shared.abort.store(true, Ordering::Release);
        self.wake();
    }
}

impl std::fmt::Debug for WakeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeHandle")
            .field("fd", &self.shared.writer.as_raw_fd())
            .finish()
    }
}
