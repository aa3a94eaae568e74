//! Per-client proxy state: the client endpoint, the upstream endpoints opened
//! for it, and the protocol flags of the exchange in progress.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use mio::Token;
use rusty_ulid::Ulid;

use crate::{
    parser::{ContentEncoding, Direction, HttpMessage, ParserConnection},
    server::EndpointSet,
    ConnectionId,
};

/// Idle-read windows applied to a session's endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// for the endpoint expected to send the next bytes
    pub keep_alive: Duration,
    /// for both endpoints of a CONNECT tunnel
    pub tunnel: Duration,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("endpoint {0:?} is not a remote endpoint of this session")]
    UnknownRemote(Token),
}

pub struct Session {
    pub id: ConnectionId,
    pub connection: ParserConnection,
    pub local: Token,
    /// `host:port` -> remote endpoint
    remotes: HashMap<String, Token>,
    current_remote: Option<Token>,
    pub request: Option<HttpMessage>,
    pub response: Option<HttpMessage>,
    /// Bodies of the current message are relayed as chunks framed by the
    /// proxy, ended by the last chunk. A chunked identity response is not:
    /// its own framing goes through.
    pub chunked: bool,
    /// coding of the current response, `None` when it is not a known one
    pub content_encoding: Option<ContentEncoding>,
    http_connect_mode: bool,
    /// the 200 answer to the CONNECT was sent
    pub tunnel_established: bool,
    /// a final response head was forwarded to the client
    pub response_started: bool,
    pub request_body_started: bool,
    direction: Direction,
    closed: bool,
    /// identifies the current request in logs
    pub request_id: Ulid,
    pub created: Instant,
}

impl Session {
    pub fn new(id: ConnectionId, connection: ParserConnection, local: Token) -> Self {
        Session {
            id,
            connection,
            local,
            remotes: HashMap::new(),
            current_remote: None,
            request: None,
            response: None,
            chunked: false,
            content_encoding: Some(ContentEncoding::Identity),
            http_connect_mode: false,
            tunnel_established: false,
            response_started: false,
            request_body_started: false,
            direction: Direction::Out,
            closed: false,
            request_id: Ulid::generate(),
            created: Instant::now(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_http_connect_mode(&self) -> bool {
        self.http_connect_mode
    }

    /// whether bytes should bypass the parser
    pub fn is_tunneling(&self) -> bool {
        self.http_connect_mode || self.tunnel_established
    }

    /// The direction in which an endpoint sends: the client sends requests,
    /// upstreams send responses
    pub fn direction_of(&self, token: Token) -> Direction {
        if token == self.local {
            Direction::Out
        } else {
            Direction::In
        }
    }

    /// The endpoint bytes coming from `token` are relayed to
    pub fn opposing(&self, token: Token) -> Option<Token> {
        if token == self.local {
            self.current_remote
        } else {
            Some(self.local)
        }
    }

    pub fn current_remote(&self) -> Option<Token> {
        self.current_remote
    }

    pub fn is_current_remote(&self, token: Token) -> bool {
        self.current_remote == Some(token)
    }

    pub fn remote(&self, name: &str) -> Option<Token> {
        self.remotes.get(name).copied()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// the client endpoint, then every remote
    pub fn endpoints(&self) -> impl Iterator<Item = Token> + '_ {
        std::iter::once(self.local).chain(self.remotes.values().copied())
    }

    pub fn add_remote(&mut self, name: String, token: Token) {
        self.remotes.insert(name, token);
    }

    /// Forgets a remote endpoint, and stops using it as the current one
    pub fn remove_remote(&mut self, token: Token) {
        self.remotes.retain(|_, remote| *remote != token);
        if self.current_remote == Some(token) {
            self.current_remote = None;
        }
    }

    /// The current remote endpoint must be one of the session's remotes
    pub fn set_current_remote(&mut self, token: Token) -> Result<(), SessionError> {
        if !self.remotes.values().any(|remote| *remote == token) {
            return Err(SessionError::UnknownRemote(token));
        }
        self.current_remote = Some(token);
        Ok(())
    }

    pub fn set_direction(
        &mut self,
        direction: Direction,
        endpoints: &mut EndpointSet,
        timeouts: &Timeouts,
    ) {
        self.direction = direction;
        self.update_timeouts(endpoints, timeouts);
    }

    pub fn set_http_connect_mode(
        &mut self,
        enabled: bool,
        endpoints: &mut EndpointSet,
        timeouts: &Timeouts,
    ) {
        self.http_connect_mode = enabled;
        self.update_timeouts(endpoints, timeouts);
    }

    /// Arms the idle deadlines: the endpoint expected to send next gets the
    /// keep-alive window and its opposite none, both get the tunnel window
    /// once tunneling. Idle remotes other than the current one keep the
    /// keep-alive window so they eventually go away.
    pub fn update_timeouts(&self, endpoints: &mut EndpointSet, timeouts: &Timeouts) {
        let (local, remote) = if self.is_tunneling() {
            (timeouts.tunnel, timeouts.tunnel)
        } else {
            match self.direction {
                Direction::Out => (timeouts.keep_alive, Duration::ZERO),
                Direction::In => (Duration::ZERO, timeouts.keep_alive),
            }
        };

        endpoints.set_read_timeout(self.local, local);
        if let Some(current) = self.current_remote {
            endpoints.set_read_timeout(current, remote);
        }
        for token in self.remotes.values() {
            if Some(*token) != self.current_remote
                && endpoints.read_timeout(*token) != Some(timeouts.keep_alive)
            {
                endpoints.set_read_timeout(*token, timeouts.keep_alive);
            }
        }
    }

    /// Closes every endpoint and releases the messages. Closing twice does
    /// nothing.
    pub fn close(&mut self, endpoints: &mut EndpointSet) {
        if self.closed {
            return;
        }
        self.closed = true;

        endpoints.close(self.local);
        for (_, token) in self.remotes.drain() {
            endpoints.close(token);
        }
        self.current_remote = None;
        self.request = None;
        self.response = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(ConnectionId(1), ParserConnection(ConnectionId(1)), Token(0))
    }

    #[test]
    fn current_remote_must_be_known() {
        let mut session = session();
        assert_eq!(
            session.set_current_remote(Token(4)),
            Err(SessionError::UnknownRemote(Token(4)))
        );

        session.add_remote("example.com:80".to_owned(), Token(4));
        session.set_current_remote(Token(4)).unwrap();
        assert_eq!(session.remote("example.com:80"), Some(Token(4)));
        assert_eq!(session.opposing(Token(0)), Some(Token(4)));
        assert_eq!(session.opposing(Token(4)), Some(Token(0)));

        assert_eq!(session.endpoints().collect::<Vec<_>>(), vec![Token(0), Token(4)]);

        session.remove_remote(Token(4));
        assert_eq!(session.current_remote(), None);
        assert_eq!(session.remote_count(), 0);
        assert_eq!(session.opposing(Token(0)), None);
    }

    #[test]
    fn directions_follow_roles() {
        let session = session();
        assert_eq!(session.direction_of(Token(0)), Direction::Out);
        assert_eq!(session.direction_of(Token(9)), Direction::In);
        assert_eq!(session.direction(), Direction::Out);
        assert!(!session.is_tunneling());
    }
}
