//! The HTTP/1 message parser, seen from the proxy.
//!
//! The proxy never looks at bytes itself: it feeds each connection's input to
//! a [`MessageParser`] along with a [`Direction`], and reacts to the
//! [`ParserCallbacks`] invoked synchronously while the input is consumed.
//! [`Http1Parser`] is the implementation used by default.
pub mod encoding;
pub mod http1;
pub mod message;

use std::fmt;

pub use crate::parser::{
    encoding::{ContentEncoding, EncodingError},
    http1::Http1Parser,
    message::{HttpMessage, StartLine},
};
use crate::ConnectionId;

/// Which half of an exchange some bytes belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// upstream to client: responses
    In = 0,
    /// client to upstream: requests
    Out = 1,
}

impl Direction {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Direction> {
        match code {
            0 => Some(Direction::In),
            1 => Some(Direction::Out),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidHeader = 1,
    HeaderTooLarge = 2,
    InvalidChunk = 3,
    InvalidContentLength = 4,
}

impl ParseErrorKind {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// A connection as known by the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParserConnection(pub ConnectionId);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParserError {
    #[error("connection {0} is unknown to the parser")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is already known to the parser")]
    AlreadyConnected(ConnectionId),
}

/// Reactions to parsing events.
///
/// For each message, in order: the head, then for messages with a body
/// `*_body_started`, any number of `*_body_data`, and `*_body_finished`, which
/// is also called for bodiless messages. `on_parse_error` replaces the rest of
/// the sequence when the input is malformed.
pub trait ParserCallbacks {
    fn on_request_received(&mut self, connection: ParserConnection, request: HttpMessage);
    /// Returns whether body data should be delivered decoded, without its
    /// chunk framing. Otherwise it is delivered as found on the wire.
    fn on_request_body_started(&mut self, connection: ParserConnection) -> bool;
    fn on_request_body_data(&mut self, connection: ParserConnection, data: &[u8]);
    fn on_request_body_finished(&mut self, connection: ParserConnection);

    fn on_response_received(&mut self, connection: ParserConnection, response: HttpMessage);
    /// Same contract as [`ParserCallbacks::on_request_body_started`]
    fn on_response_body_started(&mut self, connection: ParserConnection) -> bool;
    fn on_response_body_data(&mut self, connection: ParserConnection, data: &[u8]);
    fn on_response_body_finished(&mut self, connection: ParserConnection);

    fn on_parse_error(
        &mut self,
        connection: ParserConnection,
        direction: Direction,
        kind: ParseErrorKind,
        message: &str,
    );
}

/// A stateful byte-stream parser holding one state per connection
pub trait MessageParser {
    fn connect(&mut self, id: ConnectionId) -> Result<ParserConnection, ParserError>;

    /// Consumes `data`, invoking callbacks for everything it completes.
    /// Incomplete input is kept until the next call.
    fn input(
        &mut self,
        connection: ParserConnection,
        direction: Direction,
        data: &[u8],
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<(), ParserError>;

    /// The peer sending in `direction` went away. Ends a body delimited by
    /// the connection close, and forgets partial input.
    fn disconnect(
        &mut self,
        connection: ParserConnection,
        direction: Direction,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<(), ParserError>;

    /// Forgets partial input and the framing of the messages in progress in
    /// both directions: the next client bytes are read as a request head.
    fn reset(&mut self, connection: ParserConnection) -> Result<(), ParserError>;

    /// Releases everything the parser holds for this connection
    fn close(&mut self, connection: ParserConnection);
}
