use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancelChannel;
use crate::error::TransportError;
use crate::frame::{decode_delay, encode_delay, read_frame, write_frame};
use crate::poll::{wait, Wait};
use crate::MAX_STOP_WAIT;

/// Default server address used when a caller doesn't specify one.
pub const DEFAULT_SERVER_IP: &str = "127.0.0.1";
/// Default server port used when a caller doesn't specify one.
pub const DEFAULT_SERVER_PORT: u16 = 8080;
/// Default per-wait timeout for a [`Client`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer-closed is expected control flow (the server may simply not be
/// there); anything else is a genuine transport failure.
fn log_transport_error(err: &TransportError, context: &str) {
    match err {
        TransportError::PeerClosed => debug!(%err, "{context}"),
        TransportError::MalformedFrame | TransportError::Io(_) => warn!(%err, "{context}"),
    }
}

struct Shared {
    cancel: Option<CancelChannel>,
    in_flight: Mutex<u64>,
    idle: Condvar,
}

/// A reusable client endpoint. A single `Client` can be shared (via `Arc`, or
/// simply borrowed) across threads issuing concurrent `send_delay` calls;
/// `stop()` cancels every in-flight call and waits for them to unwind.
pub struct Client {
    timeout: Duration,
    shared: Shared,
}

impl Client {
    /// Builds a client with the given per-wait timeout. If the cancellation
    /// pipe cannot be created, the client is still usable for bookkeeping but
    /// every `send_delay` will fail and `stop()` becomes a no-op; this is
    /// logged once here rather than panicking the caller's thread.
    pub fn new(timeout: Duration) -> Self {
        let cancel = match CancelChannel::new() {
            Ok(c) => Some(c),
            Err(err) => {
                warn!(%err, "failed to create client cancellation channel");
                None
            }
        };
        Self { timeout, shared: Shared { cancel, in_flight: Mutex::new(0), idle: Condvar::new() } }
    }

    /// Sends `*delay` to the server and, on success, overwrites it with the
    /// server's reply (`*delay + 1ms`). Returns `false` on any failure,
    /// leaving `*delay` untouched.
    pub fn send_delay(&self, delay: &mut Duration, server_ip: &str, server_port: u16) -> bool {
        let Some(cancel) = self.shared.cancel.as_ref() else {
            debug!("send_delay aborted: no cancellation channel");
            return false;
        };

        {
            let mut in_flight = self.shared.in_flight.lock().unwrap();
            *in_flight += 1;
        }

        let result = self.run_exchange(cancel, *delay, server_ip, server_port);

        {
            let mut in_flight = self.shared.in_flight.lock().unwrap();
            *in_flight -= 1;
        }
        self.shared.idle.notify_all();

        match result {
            Some(reply) => {
                *delay = reply;
                true
            }
            None => false,
        }
    }

    fn run_exchange(
        &self,
        cancel: &CancelChannel,
        delay: Duration,
        server_ip: &str,
        server_port: u16,
    ) -> Option<Duration> {
        let fd = crate::socket::new_nonblocking_tcp_socket().ok()?;

        let outcome = (|| {
            if !crate::socket::connect_nonblocking(fd, server_ip, server_port) {
                return None;
            }

            match wait(&[cancel.read_fd()], &[fd], Some(self.timeout)) {
                Wait::Ready(ready) if ready.readable(cancel.read_fd()) => {
                    debug!("send_delay cancelled while connecting");
                    return None;
                }
                Wait::Ready(ready) if ready.writable(fd) => {}
                Wait::Ready(_) | Wait::Timeout => {
                    debug!("send_delay timed out connecting");
                    return None;
                }
                Wait::Error => return None,
            }

            if let Err(err) = write_frame(fd, &encode_delay(delay.as_millis() as u64)) {
                log_transport_error(&err, "could not send the delay to the server");
                return None;
            }

            match wait(&[cancel.read_fd(), fd], &[], Some(self.timeout)) {
                Wait::Ready(ready) if ready.readable(cancel.read_fd()) => {
                    debug!("send_delay cancelled while waiting for reply");
                    return None;
                }
                Wait::Ready(ready) if ready.readable(fd) => {}
                Wait::Ready(_) | Wait::Timeout => {
                    debug!("send_delay timed out waiting for reply");
                    return None;
                }
                Wait::Error => return None,
            }

            let frame = match read_frame(fd) {
                Ok(frame) => frame,
                Err(err) => {
                    log_transport_error(&err, "could not get the increased delay from the server");
                    return None;
                }
            };
            let reply_ms = match decode_delay(&frame) {
                Ok(ms) => ms,
                Err(err) => {
                    log_transport_error(&err, "could not get the increased delay from the server");
                    return None;
                }
            };
            Some(Duration::from_millis(reply_ms))
        })();

        unsafe { libc::close(fd) };
        outcome
    }

    /// Cancels every in-flight `send_delay` and waits (bounded by
    /// [`MAX_STOP_WAIT`]) for them to finish unwinding. Idempotent: calling
    /// this with nothing in flight is a cheap no-op.
    pub fn stop(&self) {
        let Some(cancel) = self.shared.cancel.as_ref() else {
            return;
        };

        let guard = self.shared.in_flight.lock().unwrap();
        if *guard == 0 {
            return;
        }
        drop(guard);

        cancel.raise();

        let guard = self.shared.in_flight.lock().unwrap();
        let (_guard, timed_out) = self
            .shared
            .idle
            .wait_timeout_while(guard, MAX_STOP_WAIT, |in_flight| *in_flight != 0)
            .unwrap();
        if timed_out.timed_out() {
            warn!("client stop() exceeded MAX_STOP_WAIT, returning anyway");
        }

        cancel.drain();
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_with_nothing_in_flight_is_a_no_op() {
        let client = Client::new(Duration::from_millis(50));
        client.stop();
        client.stop();
    }

    #[test]
    fn send_delay_fails_fast_against_a_closed_port() {
        let client = Client::new(Duration::from_millis(200));
        let mut delay = Duration::from_millis(10);
        // Nothing is listening on this port; the connect or handshake wait
        // should fail within the client's timeout rather than hanging.
        assert!(!client.send_delay(&mut delay, "127.0.0.1", 1));
        assert_eq!(delay, Duration::from_millis(10));
    }
}
