use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::warn;

/// The result of one [`wait`] call.
pub(crate) enum Wait {
    /// At least one watched fd is ready; inspect it with [`ReadySet`].
    Ready(ReadySet),
    /// The timeout elapsed with nothing ready.
    Timeout,
    /// The underlying `poll(2)` call failed, or the call was ill-formed
    /// (empty fd sets with no timeout).
    Error,
}

/// The fds that fired on a [`Wait::Ready`] outcome.
pub(crate) struct ReadySet(Vec<libc::pollfd>);

impl ReadySet {
    pub(crate) fn readable(&self, fd: RawFd) -> bool {
        self.0.iter().any(|p| {
            p.fd == fd && (p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR)) != 0
        })
    }

    pub(crate) fn writable(&self, fd: RawFd) -> bool {
        self.0.iter().any(|p| {
            p.fd == fd && (p.revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR)) != 0
        })
    }
}

/// Waits for any of `read_fds` to become readable or any of `write_fds` to
/// become writable, for at most `timeout` (blocking indefinitely if `None`).
///
/// This is the single primitive through which cancellation is propagated:
/// every caller in this crate always includes the cancellation fd in
/// `read_fds`. Built directly on `poll(2)` rather than an event-loop crate,
/// because every wait here is a one-shot synchronous call issued by
/// whichever thread needs it, not a long-lived reactor owned by one thread.
pub(crate) fn wait(read_fds: &[RawFd], write_fds: &[RawFd], timeout: Option<Duration>) -> Wait {
    if read_fds.is_empty() && write_fds.is_empty() && timeout.is_none() {
        warn!("multiplexed wait called with no fds and no timeout");
        return Wait::Error;
    }

    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(read_fds.len() + write_fds.len());
    for &fd in read_fds {
        match fds.iter_mut().find(|p| p.fd == fd) {
            Some(p) => p.events |= libc::POLLIN,
            None => fds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 }),
        }
    }
    for &fd in write_fds {
        match fds.iter_mut().find(|p| p.fd == fd) {
            Some(p) => p.events |= libc::POLLOUT,
            None => fds.push(libc::pollfd { fd, events: libc::POLLOUT, revents: 0 }),
        }
    }

    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
    };

    loop {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        match ret {
            n if n < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(%err, "poll failed");
                return Wait::Error;
            }
            0 => return Wait::Timeout,
            _ => return Wait::Ready(ReadySet(fds)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sets_without_timeout_are_ill_formed() {
        assert!(matches!(wait(&[], &[], None), Wait::Error));
    }

    #[test]
    fn times_out_when_nothing_is_ready() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        assert!(matches!(wait(&[read_fd], &[], Some(Duration::from_millis(20))), Wait::Timeout));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn reports_readable_fd() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let byte = [1u8];
        unsafe { libc::write(write_fd, byte.as_ptr().cast(), 1) };

        match wait(&[read_fd], &[], Some(Duration::from_millis(200))) {
            Wait::Ready(ready) => assert!(ready.readable(read_fd)),
            _ => panic!("expected the pipe to be reported ready"),
        }

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
