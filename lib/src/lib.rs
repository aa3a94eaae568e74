//! # relais-lib, the relais forward proxy engine
//!
//! This library multiplexes client and upstream TCP connections over one
//! readiness-driven event loop built on [mio](https://docs.rs/mio), relays
//! HTTP/1.1 traffic between them (re-framing bodies as chunks and rewriting
//! content-encoding headers) and tunnels raw bytes after a `CONNECT`.
//!
//! The moving parts, leaves first:
//!
//! - [`endpoint::Endpoint`]: one non-blocking socket, with a bounded outbound
//!   queue that blocks producers instead of dropping data, and an idle-read
//!   deadline
//! - [`notifier::Notifier`]: the FIFO of endpoint events and the wake primitive
//!   other threads use to reach the loop
//! - [`server::Server`]: owns the listener, the poll and the endpoint set,
//!   computes the next deadline and dispatches readiness
//! - [`session::Session`]: one accepted client and its upstream endpoints
//! - [`protocol::Proxy`]: the protocol state machine, driven by the
//!   [`parser::MessageParser`] callbacks
//!
//! ## Starting a proxy
//!
//! ```no_run
//! use relais_command_lib::config::Config;
//!
//! let handle = relais_lib::server::start(&Config::default())
//!     .expect("could not start the proxy");
//! println!("listening on {}", handle.local_address());
//! let metrics = handle.stop().expect("the event loop failed");
//! println!("{}", metrics.dump());
//! ```
#[macro_use]
extern crate log;

pub mod endpoint;
pub mod metrics;
pub mod notifier;
pub mod parser;
pub mod protocol;
pub mod server;
pub mod session;

use std::{
    fmt,
    io,
    sync::atomic::{AtomicU64, Ordering},
};

/// First id handed out to endpoints, leaving low numbers to connections
pub const FIRST_ENDPOINT_ID: u64 = 100_000;

/// Identifies one accepted client connection, and the session built on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Diagnostic identity of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic counters for connection and endpoint ids.
///
/// Each server owns its own generator, so independent proxies in the same
/// process never share state.
#[derive(Debug)]
pub struct IdGenerator {
    connections: AtomicU64,
    endpoints: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator {
            connections: AtomicU64::new(0),
            endpoints: AtomicU64::new(FIRST_ENDPOINT_ID),
        }
    }

    pub fn next_connection(&self) -> ConnectionId {
        ConnectionId(self.connections.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_endpoint(&self) -> EndpointId {
        EndpointId(self.endpoints.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("could not bind the listener on {address}: {error}")]
    Bind {
        address: std::net::SocketAddr,
        error: io::Error,
    },
    #[error("could not create the poll: {0}")]
    Poll(io::Error),
    #[error("could not register the listener: {0}")]
    Register(io::Error),
    #[error("could not create the waker: {0}")]
    Waker(io::Error),
    #[error("could not spawn the event loop thread: {0}")]
    Spawn(io::Error),
    #[error("the event loop thread panicked")]
    LoopPanicked,
    #[error("polling failed: {0}")]
    PollFailed(io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_independent() {
        let first = IdGenerator::new();
        let second = IdGenerator::new();

        assert_eq!(first.next_connection(), ConnectionId(0));
        assert_eq!(first.next_connection(), ConnectionId(1));
        assert_eq!(second.next_connection(), ConnectionId(0));

        assert_eq!(first.next_endpoint(), EndpointId(FIRST_ENDPOINT_ID));
        assert_eq!(first.next_endpoint(), EndpointId(FIRST_ENDPOINT_ID + 1));
        assert_eq!(second.next_endpoint(), EndpointId(FIRST_ENDPOINT_ID));
    }
}
