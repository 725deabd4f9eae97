use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::cancel::CancelChannel;
use crate::frame::{decode_delay, encode_delay, read_frame, write_frame};
use crate::poll::{wait, Wait};
use crate::socket::{accept_nonblocking, listen_nonblocking};
use crate::MAX_STOP_WAIT;

const LISTEN_BACKLOG: i32 = 512;

struct State {
    current_clients: usize,
    quit_signal: bool,
    acceptor_alive: bool,
}

struct Shared {
    max_clients: usize,
    cancel: CancelChannel,
    state: Mutex<State>,
    cv: Condvar,
}

struct Running {
    shared: Arc<Shared>,
    listen_fd: RawFd,
    acceptor: JoinHandle<()>,
}

/// A bounded-concurrency TCP server. Each accepted connection is handled on
/// its own thread; `max_clients` caps how many run at once, and `stop()`
/// cancels the acceptor and every in-flight handler, waiting (bounded) for
/// them to drain.
pub struct Server {
    max_clients: usize,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(max_clients: usize) -> Self {
        Self { max_clients, running: Mutex::new(None) }
    }

    /// Binds, listens, and spawns the acceptor thread. Returns `false` (and
    /// logs at `error!`) if any setup step fails; the server is left
    /// not-started and may be retried with a different port.
    pub fn start(&self, port: u16) -> bool {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            warn!("start() called on an already-started server");
            return false;
        }

        let listen_fd = match listen_nonblocking(port, LISTEN_BACKLOG.max(self.max_clients as i32))
        {
            Ok(fd) => fd,
            Err(err) => {
                error!(%err, port, "failed to start listening");
                return false;
            }
        };

        let cancel = match CancelChannel::new() {
            Ok(c) => c,
            Err(err) => {
                error!(%err, "failed to create server cancellation channel");
                unsafe { libc::close(listen_fd) };
                return false;
            }
        };

        let shared = Arc::new(Shared {
            max_clients: self.max_clients,
            cancel,
            state: Mutex::new(State { current_clients: 0, quit_signal: false, acceptor_alive: true }),
            cv: Condvar::new(),
        });

        let acceptor_shared = Arc::clone(&shared);
        let acceptor = thread::spawn(move || accept_loop(&acceptor_shared, listen_fd));

        *running = Some(Running { shared, listen_fd, acceptor });
        true
    }

    /// Cancels the acceptor and every handler, waits (bounded by
    /// [`MAX_STOP_WAIT`]) for the acceptor to finish draining, then joins it
    /// and closes the listening socket. Idempotent: a no-op if never
    /// started, or if already stopped.
    pub fn stop(&self) {
        let running = {
            let mut guard = self.running.lock().unwrap();
            guard.take()
        };
        let Some(running) = running else {
            return;
        };

        {
            let mut state = running.shared.state.lock().unwrap();
            running.shared.cancel.raise();
            state.quit_signal = true;
            running.shared.cv.notify_all();
        }

        {
            let state = running.shared.state.lock().unwrap();
            let (_state, timed_out) = running
                .shared
                .cv
                .wait_timeout_while(state, MAX_STOP_WAIT, |s| s.acceptor_alive)
                .unwrap();
            if timed_out.timed_out() {
                warn!("server stop() exceeded MAX_STOP_WAIT waiting for the acceptor");
            }
        }

        if let Err(err) = running.acceptor.join() {
            error!(?err, "acceptor thread panicked");
        }
        unsafe { libc::close(running.listen_fd) };
    }

    /// Number of handlers currently running. `0` if the server was never
    /// started or has since been stopped.
    pub fn current_client_count(&self) -> usize {
        let guard = self.running.lock().unwrap();
        match guard.as_ref() {
            Some(running) => running.shared.state.lock().unwrap().current_clients,
            None => 0,
        }
    }
}

fn accept_loop(shared: &Arc<Shared>, listen_fd: RawFd) {
    loop {
        match wait(&[listen_fd, shared.cancel.read_fd()], &[], None) {
            Wait::Ready(ready) if ready.readable(shared.cancel.read_fd()) => break,
            Wait::Ready(ready) if ready.readable(listen_fd) => {
                match accept_nonblocking(listen_fd) {
                    Ok(Some(fd)) => admit(shared, fd),
                    Ok(None) => continue,
                    Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                        warn!("accept failed: too many open files, dropping this connection");
                        continue;
                    }
                    Err(err) => {
                        error!(%err, "accept failed, stopping acceptor");
                        break;
                    }
                }
            }
            Wait::Ready(_) | Wait::Timeout => continue,
            Wait::Error => {
                error!("acceptor wait failed, stopping acceptor");
                break;
            }
        }
    }

    shared.cancel.raise();
    {
        let state = shared.state.lock().unwrap();
        let (mut state, timed_out) = shared
            .cv
            .wait_timeout_while(state, MAX_STOP_WAIT, |s| s.current_clients != 0)
            .unwrap();
        if timed_out.timed_out() {
            warn!("acceptor shutdown exceeded MAX_STOP_WAIT waiting for handlers to drain");
        }
        state.acceptor_alive = false;
    }
    shared.cv.notify_all();
}

fn admit(shared: &Arc<Shared>, client_fd: RawFd) {
    let state = shared.state.lock().unwrap();
    let mut state = shared
        .cv
        .wait_while(state, |s| s.current_clients >= shared.max_clients && !s.quit_signal)
        .unwrap();

    if state.quit_signal {
        drop(state);
        unsafe { libc::close(client_fd) };
        return;
    }

    state.current_clients += 1;
    drop(state);

    let handler_shared = Arc::clone(shared);
    thread::spawn(move || run_handler(&handler_shared, client_fd));
}

/// Why a handler exited without sending a reply. `Expected` covers
/// cancellation and peer-initiated closes, which are normal control flow;
/// `Unexpected` covers genuine transport/wait failures.
enum HandlerExit {
    Expected(&'static str),
    Unexpected(&'static str),
}

fn run_handler(shared: &Arc<Shared>, client_fd: RawFd) {
    match serve_client(shared, client_fd) {
        Ok(()) => {}
        Err(HandlerExit::Expected(reason)) => debug!(reason, "handler exiting without a reply"),
        Err(HandlerExit::Unexpected(reason)) => warn!(reason, "handler exiting without a reply"),
    }
    close_and_notify(shared, client_fd);
}

fn close_and_notify(shared: &Arc<Shared>, client_fd: RawFd) {
    unsafe { libc::close(client_fd) };
    let mut state = shared.state.lock().unwrap();
    state.current_clients -= 1;
    drop(state);
    shared.cv.notify_all();
}

fn serve_client(shared: &Arc<Shared>, client_fd: RawFd) -> Result<(), HandlerExit> {
    let cancel_fd = shared.cancel.read_fd();

    match wait(&[client_fd, cancel_fd], &[], None) {
        Wait::Ready(ready) if ready.readable(client_fd) => {}
        Wait::Ready(ready) if ready.readable(cancel_fd) => {
            return Err(HandlerExit::Expected("cancelled before request"))
        }
        _ => return Err(HandlerExit::Unexpected("wait for request failed")),
    }

    let frame = read_frame(client_fd)
        .map_err(|_| HandlerExit::Unexpected("failed to read request frame"))?;
    let sleep_ms =
        decode_delay(&frame).map_err(|_| HandlerExit::Unexpected("malformed request frame"))?;

    match wait(&[client_fd, cancel_fd], &[], Some(Duration::from_millis(sleep_ms))) {
        Wait::Timeout => {}
        Wait::Ready(ready) if ready.readable(cancel_fd) => {
            return Err(HandlerExit::Expected("cancelled during sleep"))
        }
        Wait::Ready(ready) if ready.readable(client_fd) => {
            return Err(HandlerExit::Expected("peer activity during sleep, aborting without a reply"))
        }
        _ => return Err(HandlerExit::Unexpected("sleep wait failed")),
    }

    match wait(&[], &[client_fd], None) {
        Wait::Ready(ready) if ready.writable(client_fd) => {}
        _ => return Err(HandlerExit::Unexpected("wait for write readiness failed")),
    }

    write_frame(client_fd, &encode_delay(sleep_ms + 1))
        .map_err(|_| HandlerExit::Unexpected("failed to write reply"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_server_reports_zero_clients_before_start() {
        let server = Server::new(4);
        assert_eq!(server.current_client_count(), 0);
        server.stop();
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let server = Server::new(4);
        server.stop();
        server.stop();
    }
}
