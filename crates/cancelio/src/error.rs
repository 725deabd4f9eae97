use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failures that can occur while standing up a [`crate::Server`] or
/// [`crate::Client`]. These always happen before any handler or exchange
/// is running, so they're reported to the caller as a `false` return from
/// `start`/`new` rather than propagated across a thread boundary.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to create a socket")]
    Socket(#[source] io::Error),
    #[error("failed to set the socket non-blocking")]
    NonBlocking(#[source] io::Error),
    #[error("failed to set SO_REUSEADDR")]
    ReuseAddr(#[source] io::Error),
    #[error("failed to bind to {0}")]
    Bind(SocketAddr, #[source] io::Error),
    #[error("failed to listen")]
    Listen(#[source] io::Error),
    #[error("failed to create the cancellation pipe")]
    Pipe(#[source] io::Error),
}

/// Failures while exchanging frames over an already-connected socket.
/// Every variant here is a closing condition for the connection: the caller
/// closes the socket and moves on, it is never retried.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("frame payload was not a valid decimal integer")]
    MalformedFrame,
    #[error(transparent)]
    Io(#[from] io::Error),
}
