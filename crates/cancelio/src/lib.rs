//! A cancellable request/response TCP core built on the self-pipe trick.
//!
//! A [`Server`] accepts bounded concurrent connections, reads a delay in
//! milliseconds from each peer, waits that long (or aborts early if
//! cancelled), and replies with the delay plus one. A [`Client`] drives the
//! other end and can have any in-flight call interrupted by [`Client::stop`]
//! in bounded time.
//!
//! Every blocking wait in this crate is built on [`poll::wait`], which always
//! includes a cancellation fd in its read set; raising that fd from another
//! thread is what makes `stop()` work without signals or async cancellation.

mod cancel;
mod client;
mod frame;
mod poll;
mod server;
mod socket;

pub mod error;

pub use client::{Client, DEFAULT_SERVER_IP, DEFAULT_SERVER_PORT, DEFAULT_TIMEOUT};
pub use server::Server;

use std::time::Duration;

/// Upper bound on how long [`Client::stop`] and [`Server::stop`] will block
/// waiting for in-flight work to drain before giving up and returning anyway.
pub const MAX_STOP_WAIT: Duration = Duration::from_secs(2);
