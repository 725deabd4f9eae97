use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::error::SetupError;

/// A self-pipe used to interrupt a blocked [`crate::poll::wait`] from another
/// thread. Writing a byte to `write_fd` wakes anything waiting on `read_fd`;
/// the reader then drains the pipe so it can be raised again later.
pub(crate) struct CancelChannel {
    read_fd: RawFd,
    write_fd: RawFd,
}

// The fds are plain integers guarded by the kernel, not by any memory this
// struct owns; sharing a `CancelChannel` across threads is sound.
unsafe impl Send for CancelChannel {}
unsafe impl Sync for CancelChannel {}

impl CancelChannel {
    pub(crate) fn new() -> Result<Self, SetupError> {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(SetupError::Pipe(io::Error::last_os_error()));
        }
        Ok(Self { read_fd: fds[0], write_fd: fds[1] })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Wakes anything waiting on [`Self::read_fd`]. Idempotent: raising an
    /// already-raised channel is a no-op once the pipe's buffer holds a byte.
    pub(crate) fn raise(&self) {
        let byte = [1u8];
        let rc = unsafe { libc::write(self.write_fd, byte.as_ptr().cast(), 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(%err, "failed to raise cancellation");
            }
        }
    }

    /// Drains the pipe so a later [`Self::raise`] can be observed again.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Drop for CancelChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{wait, Wait};
    use std::time::Duration;

    #[test]
    fn raise_wakes_a_waiter() {
        let chan = CancelChannel::new().unwrap();
        chan.raise();
        assert!(matches!(
            wait(&[chan.read_fd()], &[], Some(Duration::from_millis(200))),
            Wait::Ready(_)
        ));
    }

    #[test]
    fn drain_clears_the_pending_raise() {
        let chan = CancelChannel::new().unwrap();
        chan.raise();
        chan.drain();
        assert!(matches!(
            wait(&[chan.read_fd()], &[], Some(Duration::from_millis(20))),
            Wait::Timeout
        ));
    }
}
