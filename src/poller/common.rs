use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Converts a timeout to whole milliseconds, rounding up so that a wait
/// never returns before the timer that bounded it is due.
pub(crate) fn timeout_millis(timeout: Duration) -> libc::c_int {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    millis.min(libc::c_int::MAX as u128) as libc::c_int
}

/// Runs `wait` until it returns something other than `EINTR`, passing the
/// time left before `timeout` elapses on each attempt.
pub(crate) fn retry_interrupted<T, F>(timeout: Duration, mut wait: F) -> io::Result<T>
where
    F: FnMut(Duration) -> io::Result<T>,
{
    let deadline = Instant::now().checked_add(timeout);

    loop {
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => timeout,
        };

        match wait(remaining) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Turns a `-1` libc return into the current `errno`.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub(crate) fn is_valid_fd(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_rounds_up_to_next_millisecond() {
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_micros(1)), 1);
        assert_eq!(timeout_millis(Duration::from_micros(1500)), 2);
        assert_eq!(timeout_millis(Duration::MAX), libc::c_int::MAX);
    }

    #[test]
    fn interrupted_waits_are_retried() {
        let mut attempts = 0;
        let result = retry_interrupted(Duration::from_secs(1), |_| {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(attempts)
            }
        });

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn fd_validity() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert!(is_valid_fd(fds[0]));
        assert!(!is_valid_fd(-1));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
