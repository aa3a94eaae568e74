//! The forward proxy state machine.
//!
//! [`Proxy`] receives the events of every session endpoint. Client bytes are
//! fed to the [`MessageParser`] in the `Out` direction, upstream bytes in the
//! `In` direction, and the parser calls back into a [`Controller`] which
//! rewrites heads, picks or opens the upstream endpoint, re-frames bodies and
//! answers on the proxy's behalf when the upstream fails. After a `CONNECT`
//! bytes bypass the parser and are relayed as they come.
use std::{collections::HashMap, sync::Arc};

use mio::Token;

use crate::{
    endpoint::{EndpointError, EndpointEvent},
    parser::{
        ContentEncoding, Direction, HttpMessage, MessageParser, ParseErrorKind, ParserCallbacks,
        ParserConnection,
    },
    server::EndpointSet,
    session::{Session, Timeouts},
    ConnectionId, IdGenerator,
};

use self::{
    answers::DefaultAnswer,
    editor::{
        chunk_frame, parse_authority, remove_unsupported_features, resolve_destination,
        response_coding, rewrite_encoded_response, Destination, DEFAULT_HTTP_PORT,
        DEFAULT_TUNNEL_PORT, LAST_CHUNK,
    },
};

macro_rules! log_context {
    ($session:expr) => {
        format!(
            "RELAIS\t{}\tSession(id={}, local={}, remote={}, direction={}, tunnel={})\t >>>",
            $session.request_id,
            $session.id,
            $session.local.0,
            $session
                .current_remote()
                .map(|token| token.0.to_string())
                .unwrap_or_else(|| String::from("<none>")),
            $session.direction(),
            $session.is_tunneling(),
        )
    };
}

pub mod answers;
pub mod editor;

pub struct Proxy {
    parser: Box<dyn MessageParser + Send>,
    sessions: HashMap<ConnectionId, Session>,
    ids: Arc<IdGenerator>,
    timeouts: Timeouts,
}

impl Proxy {
    pub fn new(
        parser: Box<dyn MessageParser + Send>,
        ids: Arc<IdGenerator>,
        timeouts: Timeouts,
    ) -> Self {
        Proxy {
            parser,
            sessions: HashMap::new(),
            ids,
            timeouts,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Creates the session of a freshly accepted client endpoint
    pub fn on_client_connect(&mut self, endpoints: &mut EndpointSet, token: Token) {
        let id = self.ids.next_connection();
        let connection = match self.parser.connect(id) {
            Ok(connection) => connection,
            Err(e) => {
                error!("could not register connection {} with the parser: {}", id, e);
                endpoints.close(token);
                return;
            }
        };

        endpoints.attach(token, id);
        let mut session = Session::new(id, connection, token);
        session.set_direction(Direction::Out, endpoints, &self.timeouts);
        debug!("{} new client {:?}", log_context!(session), endpoints.name(token));
        self.sessions.insert(id, session);
    }

    /// Reacts to an event of one of the session endpoints
    pub fn handle_event(&mut self, endpoints: &mut EndpointSet, token: Token, event: &EndpointEvent) {
        let Some(id) = endpoints.attachment(token) else {
            return;
        };
        let Proxy {
            parser,
            sessions,
            timeouts,
            ..
        } = self;

        let Some(session) = sessions.get(&id) else {
            trace!("event {:?} for the closed session {}", event, id);
            return;
        };
        if session.is_closed() {
            return;
        }
        let connection = session.connection;
        let direction = session.direction_of(token);
        let is_local = token == session.local;
        let is_current = session.is_current_remote(token);

        let mut controller = Controller {
            sessions: &mut *sessions,
            endpoints: &mut *endpoints,
            timeouts: *timeouts,
            source: token,
            closed: Vec::new(),
            resets: Vec::new(),
        };

        match event {
            EndpointEvent::Input(data) => {
                if controller.is_tunneling(id) {
                    controller.relay(id, token, data);
                } else if !is_local && !is_current {
                    debug!(
                        "{} ignoring {} bytes from the idle remote {:?}",
                        controller.context(id),
                        data.len(),
                        token
                    );
                } else if let Err(e) = parser.input(connection, direction, data, &mut controller) {
                    error!("{} parser rejected input: {}", controller.context(id), e);
                    controller.close_session(id);
                }
            }
            EndpointEvent::Connected => controller.on_remote_connected(id, token),
            EndpointEvent::Disconnected => {
                if is_local {
                    if let Err(e) = parser.disconnect(connection, Direction::Out, &mut controller) {
                        debug!("{} {}", controller.context(id), e);
                    }
                    controller.close_session(id);
                } else if is_current {
                    if !controller.is_tunneling(id) {
                        if let Err(e) = parser.disconnect(connection, Direction::In, &mut controller)
                        {
                            debug!("{} {}", controller.context(id), e);
                        }
                    }
                    controller.on_remote_disconnected(id, token);
                } else if let Some(session) = controller.session_mut(id) {
                    session.remove_remote(token);
                }
                // nothing is left to drain the queue a reader may wait on
                controller.resume_reads(id);
            }
            EndpointEvent::Error(error) => controller.on_error(id, is_local, is_current, error),
            EndpointEvent::Drained => controller.resume_reads(id),
        }

        let Controller { closed, resets, .. } = controller;
        for id in resets {
            if closed.contains(&id) {
                continue;
            }
            if let Some(session) = sessions.get(&id) {
                if let Err(e) = parser.reset(session.connection) {
                    debug!("{} {}", log_context!(session), e);
                }
            }
        }
        for id in closed {
            if let Some(session) = sessions.remove(&id) {
                parser.close(session.connection);
            }
        }
    }

    /// Closes every session
    pub fn shutdown(&mut self, endpoints: &mut EndpointSet) {
        for (_, mut session) in self.sessions.drain() {
            session.close(endpoints);
            self.parser.close(session.connection);
        }
    }
}

/// Applies parser callbacks and endpoint events to the sessions
pub struct Controller<'a> {
    sessions: &'a mut HashMap<ConnectionId, Session>,
    endpoints: &'a mut EndpointSet,
    timeouts: Timeouts,
    /// the endpoint whose event is handled, paused when it fills another one
    source: Token,
    /// sessions closed while handling the event, to release in the parser
    closed: Vec<ConnectionId>,
    /// sessions whose CONNECT failed, to bring back to request parsing
    resets: Vec<ConnectionId>,
}

impl<'a> Controller<'a> {
    /// The session, unless it is closed or its client is going away
    fn session_mut(&mut self, id: ConnectionId) -> Option<&mut Session> {
        let session = self.sessions.get_mut(&id)?;
        if session.is_closed() || !self.endpoints.is_open(session.local) {
            return None;
        }
        Some(session)
    }

    fn context(&self, id: ConnectionId) -> String {
        match self.sessions.get(&id) {
            Some(session) => log_context!(session),
            None => format!("RELAIS\tSession(id={})\t >>>", id),
        }
    }

    fn is_tunneling(&self, id: ConnectionId) -> bool {
        self.sessions
            .get(&id)
            .map(Session::is_tunneling)
            .unwrap_or(false)
    }

    fn write(&mut self, token: Token, data: Vec<u8>) {
        if let Err(e) = self.endpoints.write(token, data) {
            debug!("could not write to endpoint {:?}: {}", token, e);
            return;
        }
        if token != self.source && self.endpoints.is_full(token) {
            trace!("endpoint {:?} is full, pausing reads from {:?}", token, self.source);
            self.endpoints.hold_back(self.source, token);
        }
    }

    fn resume_reads(&mut self, id: ConnectionId) {
        if let Some(session) = self.sessions.get(&id).filter(|session| !session.is_closed()) {
            for token in session.endpoints() {
                self.endpoints.resume(token);
            }
        }
    }

    fn set_direction(&mut self, id: ConnectionId, direction: Direction) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.set_direction(direction, self.endpoints, &self.timeouts);
        }
    }

    fn close_session(&mut self, id: ConnectionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if !session.is_closed() {
                debug!("{} closing", log_context!(session));
                session.close(self.endpoints);
                self.closed.push(id);
            }
        }
    }

    /// Writes an answer to the client, then waits for its next request
    fn answer(&mut self, id: ConnectionId, answer: DefaultAnswer) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let local = session.local;
        info!(
            "{} answering {} {}",
            log_context!(session),
            u16::from(&answer),
            answer.status()
        );

        let bytes = answer.render(self.timeouts.keep_alive);
        self.write(local, bytes);
        if answer.closes_connection() {
            self.endpoints.close(local);
        }
        self.set_direction(id, Direction::Out);
    }

    /// Bytes of a tunnel go as they are to the other side
    fn relay(&mut self, id: ConnectionId, from: Token, data: &[u8]) {
        let Some(to) = self.sessions.get(&id).and_then(|session| session.opposing(from)) else {
            debug!("{} no endpoint to relay {} bytes to", self.context(id), data.len());
            return;
        };
        self.write(to, data.to_vec());
    }

    /// Reuses the remote endpoint already open towards `destination`, or opens
    /// one, and makes it the current remote
    fn set_remote_endpoint(
        &mut self,
        id: ConnectionId,
        destination: &Destination,
    ) -> Result<Token, EndpointError> {
        let name = destination.name();
        let known = self
            .sessions
            .get(&id)
            .and_then(|session| session.remote(&name));

        let token = match known {
            Some(token) if self.endpoints.is_open(token) => {
                trace!("{} reusing remote {}", self.context(id), name);
                token
            }
            stale => {
                if let (Some(token), Some(session)) = (stale, self.sessions.get_mut(&id)) {
                    session.remove_remote(token);
                }
                let token = self
                    .endpoints
                    .connect_remote(&destination.host, destination.port, id)?;
                debug!("{} opening remote {}", self.context(id), name);
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.add_remote(name, token);
                }
                token
            }
        };

        if let Some(session) = self.sessions.get_mut(&id) {
            if let Err(e) = session.set_current_remote(token) {
                error!("{} {}", log_context!(session), e);
            }
            session.update_timeouts(self.endpoints, &self.timeouts);
        }
        Ok(token)
    }

    fn on_connect_request(&mut self, id: ConnectionId, request: &HttpMessage) {
        let authority = request.url().unwrap_or_default();
        let Some(destination) = parse_authority(authority, DEFAULT_TUNNEL_PORT) else {
            warn!("{} invalid CONNECT target {:?}", self.context(id), authority);
            self.resets.push(id);
            self.answer(
                id,
                DefaultAnswer::ConnectionFailed {
                    message: Some(format!("invalid target {}", authority)),
                },
            );
            return;
        };

        if let Err(e) = self.set_remote_endpoint(id, &destination) {
            warn!("{} {}", self.context(id), e);
            self.resets.push(id);
            self.answer(
                id,
                DefaultAnswer::ConnectionFailed {
                    message: Some(e.to_string()),
                },
            );
            return;
        }

        if let Some(session) = self.sessions.get_mut(&id) {
            session.chunked = false;
            session.set_direction(Direction::In, self.endpoints, &self.timeouts);
            session.set_http_connect_mode(true, self.endpoints, &self.timeouts);
            info!("{} CONNECT {}", log_context!(session), destination.name());
        }
    }

    fn on_remote_connected(&mut self, id: ConnectionId, token: Token) {
        let Some(session) = self.session_mut(id) else {
            return;
        };
        if !session.is_http_connect_mode() || !session.is_current_remote(token) {
            return;
        }

        session.tunnel_established = true;
        self.answer(id, DefaultAnswer::ConnectionEstablished);
    }

    fn on_remote_disconnected(&mut self, id: ConnectionId, token: Token) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.is_tunneling() {
            self.close_session(id);
            return;
        }

        session.remove_remote(token);
        let awaiting_response = session.direction() == Direction::In && !session.response_started;
        if awaiting_response {
            self.answer(
                id,
                DefaultAnswer::ConnectionFailed {
                    message: Some(String::from("connection closed by the remote host")),
                },
            );
        }
    }

    fn on_error(&mut self, id: ConnectionId, is_local: bool, is_current: bool, error: &EndpointError) {
        if matches!(error, EndpointError::ClosedChannel) {
            trace!("{} write to a closed endpoint", self.context(id));
            return;
        }
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        if session.is_closed() {
            return;
        }
        debug!(
            "{} {} error: {}",
            log_context!(session),
            if is_local { "client" } else { "remote" },
            error
        );

        if is_current && session.direction() == Direction::In && !session.tunnel_established {
            if session.response_started {
                let local = session.local;
                self.endpoints.close(local);
            } else if error.is_timeout() && !session.is_http_connect_mode() {
                self.answer(id, DefaultAnswer::GatewayTimeout);
            } else {
                self.answer(
                    id,
                    DefaultAnswer::ConnectionFailed {
                        message: Some(error.to_string()),
                    },
                );
            }
        }

        if is_local || is_current {
            if let Some(session) = self.sessions.get_mut(&id) {
                if session.is_http_connect_mode() && !session.tunnel_established {
                    self.resets.push(id);
                }
                session.set_http_connect_mode(false, self.endpoints, &self.timeouts);
                session.set_direction(Direction::Out, self.endpoints, &self.timeouts);
            }
        }
    }
}

/// responses that never carry a body
fn bodiless(status: u16, request_method: Option<&str>) -> bool {
    (100..200).contains(&status)
        || status == 204
        || status == 304
        || request_method.is_some_and(|method| method.eq_ignore_ascii_case("HEAD"))
}

impl<'a> ParserCallbacks for Controller<'a> {
    fn on_request_received(&mut self, connection: ParserConnection, mut request: HttpMessage) {
        let id = connection.0;
        let Some(session) = self.session_mut(id) else {
            return;
        };
        session.request_id = rusty_ulid::Ulid::generate();
        session.request_body_started = false;
        info!(
            "{} {} {}",
            log_context!(session),
            request.method().unwrap_or_default(),
            request.url().unwrap_or_default()
        );

        if request
            .method()
            .is_some_and(|method| method.eq_ignore_ascii_case("CONNECT"))
        {
            self.on_connect_request(id, &request);
            return;
        }

        let Some(destination) = resolve_destination(&mut request) else {
            warn!("{} no destination in the request", self.context(id));
            self.answer(id, DefaultAnswer::BadRequest);
            return;
        };
        if !request.has_header("Host") {
            let host = match destination.port {
                DEFAULT_HTTP_PORT => destination.host.clone(),
                port => format!("{}:{}", destination.host, port),
            };
            request.add_header("Host", &host);
        }
        remove_unsupported_features(&mut request);

        let remote = match self.set_remote_endpoint(id, &destination) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("{} {}", self.context(id), e);
                self.answer(
                    id,
                    DefaultAnswer::ConnectionFailed {
                        message: Some(e.to_string()),
                    },
                );
                return;
            }
        };

        let chunked = request.is_chunked();
        self.write(remote, request.to_bytes());

        if let Some(session) = self.sessions.get_mut(&id) {
            session.chunked = chunked;
            session.response_started = false;
            session.request = Some(request);
            if !chunked {
                session.set_direction(Direction::In, self.endpoints, &self.timeouts);
            }
        }
    }

    fn on_request_body_started(&mut self, connection: ParserConnection) -> bool {
        if let Some(session) = self.session_mut(connection.0) {
            session.request_body_started = true;
        }
        true
    }

    fn on_request_body_data(&mut self, connection: ParserConnection, data: &[u8]) {
        if self.resets.contains(&connection.0) {
            // bytes following a refused CONNECT
            return;
        }
        let Some(session) = self.session_mut(connection.0) else {
            return;
        };
        let Some(remote) = session.current_remote() else {
            return;
        };
        let framed = if session.chunked && !session.is_tunneling() {
            chunk_frame(data)
        } else {
            data.to_vec()
        };
        self.write(remote, framed);
    }

    fn on_request_body_finished(&mut self, connection: ParserConnection) {
        let id = connection.0;
        let Some(session) = self.session_mut(id) else {
            return;
        };
        let Some(remote) = session.current_remote() else {
            return;
        };
        if session.chunked && session.request_body_started {
            self.write(remote, LAST_CHUNK.to_vec());
        }
        self.set_direction(id, Direction::In);
    }

    fn on_response_received(&mut self, connection: ParserConnection, mut response: HttpMessage) {
        let id = connection.0;
        let Some(session) = self.session_mut(id) else {
            return;
        };
        let local = session.local;
        let status = response.status_code().unwrap_or_default();
        info!(
            "{} {} {}",
            log_context!(session),
            status,
            response.status().unwrap_or_default()
        );

        if (100..200).contains(&status) && status != 101 {
            self.write(local, response.to_bytes());
            return;
        }

        let request_method = session
            .request
            .as_ref()
            .and_then(HttpMessage::method)
            .map(str::to_owned);
        let has_body = !bodiless(status, request_method.as_deref());

        session.response_started = true;
        session.chunked = false;
        session.content_encoding = Some(ContentEncoding::Identity);

        if let Some(coding) = response_coding(&response).map(str::to_owned) {
            session.content_encoding = ContentEncoding::from_name(&coding).ok();
            rewrite_encoded_response(&mut response, &coding, has_body);
            session.chunked = has_body;
        } else if has_body
            && status != 101
            && !response.is_chunked()
            && !response.has_header("Content-Length")
        {
            // delimited by the upstream closing, the client connection stays open
            response.add_header("Transfer-Encoding", "chunked");
            session.chunked = true;
        }

        self.write(local, response.to_bytes());
        if let Some(session) = self.sessions.get_mut(&id) {
            session.response = Some(response);
        }
    }

    /// An encoded body is decoded from its chunks to be chunked again, other
    /// chunked bodies pass with their framing
    fn on_response_body_started(&mut self, connection: ParserConnection) -> bool {
        self.session_mut(connection.0)
            .map(|session| session.content_encoding != Some(ContentEncoding::Identity))
            .unwrap_or(true)
    }

    fn on_response_body_data(&mut self, connection: ParserConnection, data: &[u8]) {
        let Some(session) = self.session_mut(connection.0) else {
            return;
        };
        let local = session.local;
        let framed = if session.chunked {
            chunk_frame(data)
        } else {
            data.to_vec()
        };
        self.write(local, framed);
    }

    fn on_response_body_finished(&mut self, connection: ParserConnection) {
        let id = connection.0;
        let Some(session) = self.session_mut(id) else {
            return;
        };
        let local = session.local;
        // also ends an encoded response whose body turned out empty
        let last_chunk = session.chunked;
        session.request = None;
        session.response = None;
        session.response_started = false;
        session.chunked = false;
        session.content_encoding = Some(ContentEncoding::Identity);

        if last_chunk {
            self.write(local, LAST_CHUNK.to_vec());
        }
        self.set_direction(id, Direction::Out);
    }

    fn on_parse_error(
        &mut self,
        connection: ParserConnection,
        direction: Direction,
        kind: ParseErrorKind,
        message: &str,
    ) {
        let id = connection.0;
        let Some(session) = self.session_mut(id) else {
            return;
        };
        warn!(
            "{} parse error {:?} in direction {}: {}",
            log_context!(session),
            kind,
            direction,
            message
        );

        match direction {
            Direction::Out => self.answer(id, DefaultAnswer::BadRequest),
            Direction::In => {
                let local = session.local;
                let response_started = session.response_started;
                if let Some(remote) = session.current_remote() {
                    session.remove_remote(remote);
                    self.endpoints.close(remote);
                }
                if response_started {
                    self.endpoints.close(local);
                } else {
                    self.answer(id, DefaultAnswer::InvalidResponse);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Http1Parser;

    #[test]
    fn bodiless_responses() {
        assert!(bodiless(204, Some("GET")));
        assert!(bodiless(304, Some("GET")));
        assert!(bodiless(100, None));
        assert!(bodiless(200, Some("head")));
        assert!(!bodiless(200, Some("GET")));
        assert!(!bodiless(404, None));
    }

    /// A session reached through a live client socket, and the controller
    /// feeding it
    struct Harness {
        _poll: mio::Poll,
        endpoints: EndpointSet,
        sessions: HashMap<ConnectionId, Session>,
        peer: std::net::TcpStream,
        id: ConnectionId,
    }

    impl Harness {
        fn new() -> Harness {
            let poll = mio::Poll::new().expect("could not create poll");
            let notifier = Arc::new(
                crate::notifier::Notifier::new(poll.registry(), Token(usize::MAX))
                    .expect("waker"),
            );
            let ids = Arc::new(IdGenerator::new());
            let registry = poll.registry().try_clone().unwrap();
            let mut endpoints = EndpointSet::new(registry, notifier, ids, 1024, 16);

            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            peer.set_read_timeout(Some(std::time::Duration::from_secs(5)))
                .unwrap();
            let (accepted, _) = listener.accept().unwrap();
            accepted.set_nonblocking(true).unwrap();
            let local = endpoints
                .insert_local(mio::net::TcpStream::from_std(accepted))
                .unwrap();

            let id = ConnectionId(1);
            let mut sessions = HashMap::new();
            sessions.insert(id, Session::new(id, ParserConnection(id), local));
            Harness {
                _poll: poll,
                endpoints,
                sessions,
                peer,
                id,
            }
        }

        fn controller(&mut self) -> Controller<'_> {
            let local = self.sessions[&self.id].local;
            Controller {
                sessions: &mut self.sessions,
                endpoints: &mut self.endpoints,
                timeouts: Timeouts {
                    keep_alive: std::time::Duration::from_secs(30),
                    tunnel: std::time::Duration::from_secs(60),
                },
                source: local,
                closed: Vec::new(),
                resets: Vec::new(),
            }
        }

        /// what the client received, once `expected` bytes are there
        fn received(&mut self, expected: usize) -> String {
            use std::io::Read;
            let local = self.sessions[&self.id].local;
            let endpoint_id = self.endpoints.get(local).unwrap().id;
            self.endpoints.flush(local, endpoint_id);
            let mut received = vec![0; expected];
            self.peer.read_exact(&mut received).unwrap();
            String::from_utf8(received).unwrap()
        }
    }

    #[test]
    fn empty_encoded_response_gets_its_last_chunk() {
        let mut harness = Harness::new();
        let id = harness.id;
        let connection = ParserConnection(id);
        let mut parser = Http1Parser::new();
        parser.connect(id).unwrap();

        let mut controller = harness.controller();
        parser
            .input(
                connection,
                Direction::In,
                b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 0\r\n\r\n",
                &mut controller,
            )
            .unwrap();
        assert!(!controller.sessions[&id].chunked);
        assert_eq!(
            controller.sessions[&id].content_encoding,
            Some(ContentEncoding::Identity)
        );

        let expected = "HTTP/1.1 200 OK\r\nOrig-Content-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        assert_eq!(harness.received(expected.len()), expected);
    }

    #[test]
    fn chunked_identity_bodies_keep_their_framing() {
        let mut harness = Harness::new();
        let id = harness.id;
        let connection = ParserConnection(id);
        let mut parser = Http1Parser::new();
        parser.connect(id).unwrap();

        let response: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2;ext\r\nok\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut controller = harness.controller();
        parser
            .input(connection, Direction::In, response, &mut controller)
            .unwrap();

        let expected = String::from_utf8(response.to_vec()).unwrap();
        assert_eq!(harness.received(expected.len()), expected);
    }
}
