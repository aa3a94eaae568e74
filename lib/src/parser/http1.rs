//! HTTP/1.x parsing, one request stream and one response stream per connection.
//!
//! Heads are tokenized by `httparse`. Bodies are framed as RFC 7230 says:
//! `Content-Length`, `chunked` (decoded here, extensions and trailers
//! skipped), until the connection closes for responses, and raw bytes after
//! a `CONNECT` or a `101 Switching Protocols`.
use std::collections::{HashMap, VecDeque};

use memchr::memmem;
use nom::{character::complete::hex_digit1, combinator::map_res, IResult};

use crate::{
    parser::{
        Direction, HttpMessage, MessageParser, ParseErrorKind, ParserCallbacks,
        ParserConnection, ParserError,
    },
    ConnectionId,
};

pub const MAX_HEADERS: usize = 100;

/// largest head, and largest chunk trailer section, accepted
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked(ChunkPhase),
    UntilClose,
    Tunnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    /// `raw`: deliver wire bytes instead of the decoded payload
    Body { framing: Framing, raw: bool },
}

/// what follows a head
enum Body {
    /// 1xx other than 101, another head follows
    Interim,
    None,
    Framed(Framing),
}

#[derive(Debug)]
struct ParseFailure {
    kind: ParseErrorKind,
    message: String,
}

impl ParseFailure {
    fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ParseFailure {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
struct StreamState {
    phase: Phase,
    /// input not consumed yet
    buffer: Vec<u8>,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            phase: Phase::Head,
            buffer: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Head;
        self.buffer.clear();
    }
}

#[derive(Debug)]
struct ConnectionState {
    request: StreamState,
    response: StreamState,
    /// methods of the requests still waiting for a response, which decide
    /// how responses are framed
    methods: VecDeque<String>,
}

#[derive(Debug, Default)]
pub struct Http1Parser {
    connections: HashMap<ConnectionId, ConnectionState>,
}

impl Http1Parser {
    pub fn new() -> Self {
        Http1Parser::default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl MessageParser for Http1Parser {
    fn connect(&mut self, id: ConnectionId) -> Result<ParserConnection, ParserError> {
        if self.connections.contains_key(&id) {
            return Err(ParserError::AlreadyConnected(id));
        }
        self.connections.insert(
            id,
            ConnectionState {
                request: StreamState::new(),
                response: StreamState::new(),
                methods: VecDeque::new(),
            },
        );
        Ok(ParserConnection(id))
    }

    fn input(
        &mut self,
        connection: ParserConnection,
        direction: Direction,
        data: &[u8],
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<(), ParserError> {
        let state = self
            .connections
            .get_mut(&connection.0)
            .ok_or(ParserError::UnknownConnection(connection.0))?;

        let ConnectionState {
            request,
            response,
            methods,
        } = state;
        let stream = match direction {
            Direction::Out => request,
            Direction::In => response,
        };

        stream.buffer.extend_from_slice(data);
        match consume(connection, direction, stream, methods, callbacks) {
            Ok(consumed) => {
                stream.buffer.drain(..consumed);
            }
            Err(failure) => {
                stream.reset();
                if direction == Direction::In {
                    methods.pop_front();
                }
                callbacks.on_parse_error(connection, direction, failure.kind, &failure.message);
            }
        }
        Ok(())
    }

    fn disconnect(
        &mut self,
        connection: ParserConnection,
        direction: Direction,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<(), ParserError> {
        let state = self
            .connections
            .get_mut(&connection.0)
            .ok_or(ParserError::UnknownConnection(connection.0))?;

        let stream = match direction {
            Direction::Out => &mut state.request,
            Direction::In => &mut state.response,
        };
        let ends_body = matches!(
            stream.phase,
            Phase::Body {
                framing: Framing::UntilClose | Framing::Tunnel,
                ..
            }
        );
        stream.reset();
        if direction == Direction::In {
            state.methods.clear();
        }

        if ends_body {
            body_finished(callbacks, connection, direction);
        }
        Ok(())
    }

    fn reset(&mut self, connection: ParserConnection) -> Result<(), ParserError> {
        let state = self
            .connections
            .get_mut(&connection.0)
            .ok_or(ParserError::UnknownConnection(connection.0))?;
        state.request.reset();
        state.response.reset();
        state.methods.clear();
        Ok(())
    }

    fn close(&mut self, connection: ParserConnection) {
        self.connections.remove(&connection.0);
    }
}

/// Runs callbacks for everything complete in the stream's buffer, returns
/// the number of bytes consumed
fn consume(
    connection: ParserConnection,
    direction: Direction,
    stream: &mut StreamState,
    methods: &mut VecDeque<String>,
    callbacks: &mut dyn ParserCallbacks,
) -> Result<usize, ParseFailure> {
    let StreamState { phase, buffer } = stream;
    let mut position = 0;

    loop {
        let input = &buffer[position..];
        if input.is_empty() {
            break;
        }

        match *phase {
            Phase::Head => {
                let parsed = match direction {
                    Direction::Out => parse_request(input)?,
                    Direction::In => parse_response(input)?,
                };
                let Some((message, size)) = parsed else {
                    if input.len() > MAX_HEAD_SIZE {
                        return Err(ParseFailure::new(
                            ParseErrorKind::HeaderTooLarge,
                            format!("head larger than {} bytes", MAX_HEAD_SIZE),
                        ));
                    }
                    break;
                };
                if size > MAX_HEAD_SIZE {
                    return Err(ParseFailure::new(
                        ParseErrorKind::HeaderTooLarge,
                        format!("head of {} bytes", size),
                    ));
                }
                position += size;

                let body = match direction {
                    Direction::Out => request_body(&message, methods)?,
                    Direction::In => response_body(&message, methods)?,
                };
                match direction {
                    Direction::Out => callbacks.on_request_received(connection, message),
                    Direction::In => callbacks.on_response_received(connection, message),
                }
                match body {
                    Body::Interim => {}
                    Body::None => body_finished(callbacks, connection, direction),
                    Body::Framed(framing) => {
                        let decode = body_started(callbacks, connection, direction);
                        *phase = Phase::Body {
                            framing,
                            raw: !decode,
                        };
                    }
                }
            }
            Phase::Body {
                framing: Framing::Length(remaining),
                raw,
            } => {
                let size = remaining.min(input.len() as u64) as usize;
                body_data(callbacks, connection, direction, &input[..size]);
                position += size;

                let left = remaining - size as u64;
                if left == 0 {
                    *phase = Phase::Head;
                    body_finished(callbacks, connection, direction);
                } else {
                    *phase = Phase::Body {
                        framing: Framing::Length(left),
                        raw,
                    };
                }
            }
            Phase::Body {
                framing: Framing::UntilClose | Framing::Tunnel,
                ..
            } => {
                body_data(callbacks, connection, direction, input);
                position = buffer.len();
            }
            Phase::Body {
                framing: Framing::Chunked(chunk),
                raw,
            } => match chunk {
                ChunkPhase::Size => {
                    let Some(end) = memmem::find(input, b"\r\n") else {
                        if input.len() > MAX_CHUNK_LINE {
                            return Err(ParseFailure::new(
                                ParseErrorKind::InvalidChunk,
                                "chunk size line too long",
                            ));
                        }
                        break;
                    };
                    let size = chunk_size(&input[..end]).ok_or_else(|| {
                        ParseFailure::new(
                            ParseErrorKind::InvalidChunk,
                            format!(
                                "invalid chunk size line {:?}",
                                String::from_utf8_lossy(&input[..end])
                            ),
                        )
                    })?;
                    if raw {
                        body_data(callbacks, connection, direction, &input[..end + 2]);
                    }
                    position += end + 2;

                    let next = if size == 0 {
                        ChunkPhase::Trailers
                    } else {
                        ChunkPhase::Data(size)
                    };
                    *phase = Phase::Body {
                        framing: Framing::Chunked(next),
                        raw,
                    };
                }
                ChunkPhase::Data(remaining) => {
                    let size = remaining.min(input.len() as u64) as usize;
                    body_data(callbacks, connection, direction, &input[..size]);
                    position += size;

                    let left = remaining - size as u64;
                    let next = if left == 0 {
                        ChunkPhase::DataEnd
                    } else {
                        ChunkPhase::Data(left)
                    };
                    *phase = Phase::Body {
                        framing: Framing::Chunked(next),
                        raw,
                    };
                }
                ChunkPhase::DataEnd => {
                    if input.len() < 2 {
                        break;
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ParseFailure::new(
                            ParseErrorKind::InvalidChunk,
                            "missing CRLF after chunk data",
                        ));
                    }
                    if raw {
                        body_data(callbacks, connection, direction, &input[..2]);
                    }
                    position += 2;
                    *phase = Phase::Body {
                        framing: Framing::Chunked(ChunkPhase::Size),
                        raw,
                    };
                }
                ChunkPhase::Trailers => {
                    let Some(end) = memmem::find(input, b"\r\n") else {
                        if input.len() > MAX_HEAD_SIZE {
                            return Err(ParseFailure::new(
                                ParseErrorKind::HeaderTooLarge,
                                "chunk trailers too large",
                            ));
                        }
                        break;
                    };
                    if raw {
                        body_data(callbacks, connection, direction, &input[..end + 2]);
                    }
                    position += end + 2;
                    if end == 0 {
                        *phase = Phase::Head;
                        body_finished(callbacks, connection, direction);
                    }
                }
            },
        }
    }

    Ok(position)
}

fn parse_request(input: &[u8]) -> Result<Option<(HttpMessage, usize)>, ParseFailure> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let size = match request.parse(input) {
        Ok(httparse::Status::Complete(size)) => size,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(head_failure(e)),
    };

    let mut message = HttpMessage::request(
        request.method.unwrap_or_default(),
        request.path.unwrap_or_default(),
    );
    message.version = request.version.unwrap_or(1);
    copy_headers(&mut message, request.headers);
    Ok(Some((message, size)))
}

fn parse_response(input: &[u8]) -> Result<Option<(HttpMessage, usize)>, ParseFailure> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let size = match response.parse(input) {
        Ok(httparse::Status::Complete(size)) => size,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(head_failure(e)),
    };

    let mut message = HttpMessage::response(
        response.code.unwrap_or_default(),
        response.reason.unwrap_or_default(),
    );
    message.version = response.version.unwrap_or(1);
    copy_headers(&mut message, response.headers);
    Ok(Some((message, size)))
}

fn head_failure(error: httparse::Error) -> ParseFailure {
    match error {
        httparse::Error::TooManyHeaders => ParseFailure::new(
            ParseErrorKind::HeaderTooLarge,
            format!("more than {} headers", MAX_HEADERS),
        ),
        other => ParseFailure::new(ParseErrorKind::InvalidHeader, other.to_string()),
    }
}

fn copy_headers(message: &mut HttpMessage, headers: &[httparse::Header]) {
    for header in headers {
        message.add_header(header.name, &String::from_utf8_lossy(header.value));
    }
}

fn content_length(message: &HttpMessage) -> Result<Option<u64>, ParseFailure> {
    let mut length = None;
    for value in message
        .header_values("Content-Length")
        .flat_map(|value| value.split(','))
    {
        let parsed = value.trim().parse::<u64>().map_err(|_| {
            ParseFailure::new(
                ParseErrorKind::InvalidContentLength,
                format!("invalid Content-Length {:?}", value),
            )
        })?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(ParseFailure::new(
                    ParseErrorKind::InvalidContentLength,
                    "conflicting Content-Length values",
                ))
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

fn request_body(
    request: &HttpMessage,
    methods: &mut VecDeque<String>,
) -> Result<Body, ParseFailure> {
    let method = request.method().unwrap_or_default();
    methods.push_back(method.to_owned());

    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(Body::Framed(Framing::Tunnel));
    }
    if request.is_chunked() {
        return Ok(Body::Framed(Framing::Chunked(ChunkPhase::Size)));
    }
    Ok(match content_length(request)? {
        None | Some(0) => Body::None,
        Some(length) => Body::Framed(Framing::Length(length)),
    })
}

fn response_body(
    response: &HttpMessage,
    methods: &mut VecDeque<String>,
) -> Result<Body, ParseFailure> {
    let status = response.status_code().unwrap_or_default();
    if (100..200).contains(&status) && status != 101 {
        return Ok(Body::Interim);
    }

    let method = methods.pop_front().unwrap_or_default();
    if status == 101 {
        return Ok(Body::Framed(Framing::Tunnel));
    }
    if method.eq_ignore_ascii_case("HEAD") || status == 204 || status == 304 {
        return Ok(Body::None);
    }
    if method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&status) {
        return Ok(Body::Framed(Framing::Tunnel));
    }
    if response.is_chunked() {
        return Ok(Body::Framed(Framing::Chunked(ChunkPhase::Size)));
    }
    Ok(match content_length(response)? {
        Some(0) => Body::None,
        Some(length) => Body::Framed(Framing::Length(length)),
        None => Body::Framed(Framing::UntilClose),
    })
}

fn hex_size(input: &[u8]) -> IResult<&[u8], u64> {
    map_res(hex_digit1, |digits: &[u8]| {
        std::str::from_utf8(digits)
            .map_err(|_| ())
            .and_then(|digits| u64::from_str_radix(digits, 16).map_err(|_| ()))
    })(input)
}

/// `1a;name=value` -> 26
fn chunk_size(line: &[u8]) -> Option<u64> {
    let (rest, size) = hex_size(line).ok()?;
    let rest = rest
        .iter()
        .position(|byte| *byte != b' ' && *byte != b'\t')
        .map(|index| &rest[index..])
        .unwrap_or_default();
    if rest.is_empty() || rest[0] == b';' {
        Some(size)
    } else {
        None
    }
}

fn body_started(
    callbacks: &mut dyn ParserCallbacks,
    connection: ParserConnection,
    direction: Direction,
) -> bool {
    match direction {
        Direction::Out => callbacks.on_request_body_started(connection),
        Direction::In => callbacks.on_response_body_started(connection),
    }
}

fn body_data(
    callbacks: &mut dyn ParserCallbacks,
    connection: ParserConnection,
    direction: Direction,
    data: &[u8],
) {
    if data.is_empty() {
        return;
    }
    match direction {
        Direction::Out => callbacks.on_request_body_data(connection, data),
        Direction::In => callbacks.on_response_body_data(connection, data),
    }
}

fn body_finished(
    callbacks: &mut dyn ParserCallbacks,
    connection: ParserConnection,
    direction: Direction,
) {
    match direction {
        Direction::Out => callbacks.on_request_body_finished(connection),
        Direction::In => callbacks.on_response_body_finished(connection),
    }
}
