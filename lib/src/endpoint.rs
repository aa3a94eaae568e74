//! One non-blocking socket, as seen by the event loop and the proxy.
//!
//! Outbound data goes through a [`Channel`]: a FIFO of chunks bounded at
//! [`MAX_OUTBOUND_CHUNKS`], plus the one chunk currently being written. A
//! producer on another thread, writing through an [`EndpointWriter`], blocks
//! on a condition variable when it hits the bound until the loop drains a
//! chunk or the endpoint closes; data is never dropped.
//!
//! The loop thread cannot wait for itself. There the bound holds through
//! read interest instead: a socket is read once per call, the next read being
//! queued behind the input it produced, so that whoever relays the input can
//! pause the reader once the destination is full. The destination raises
//! [`EndpointEvent::Drained`] when its queue is half empty again.
//!
//! Everything else (reads, readiness registration, deadlines) happens on the
//! loop thread. Outcomes are never returned to the caller of the loop
//! primitives: they are pushed to the [`Notifier`] as [`EndpointEvent`]s and
//! dispatched to the endpoint's subscribers.
use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, ToSocketAddrs},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use mio::{net::TcpStream, Interest, Registry, Token};

use crate::{
    notifier::{Notification, Notifier},
    ConnectionId, EndpointId,
};

/// Chunks an endpoint queues before producers block
pub const MAX_OUTBOUND_CHUNKS: usize = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// accepted from a client
    Local,
    /// opened towards an upstream server
    Remote,
}

#[derive(Debug)]
pub enum EndpointEvent {
    /// the exact bytes returned by one read
    Input(Vec<u8>),
    Connected,
    Disconnected,
    Error(EndpointError),
    /// the outbound queue went back under half its bound after being full
    Drained,
}

/// The parties interested in an endpoint's events, called in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscriber {
    Proxy,
    Diagnostics,
}

#[derive(thiserror::Error, Debug)]
pub enum EndpointError {
    #[error("{0}")]
    Io(io::Error),
    #[error("could not resolve {address}: {error}")]
    Resolve { address: String, error: io::Error },
    #[error("could not connect to {address}: {error}")]
    Connect { address: String, error: io::Error },
    #[error("no data received for {0:?}")]
    Timeout(Duration),
    #[error("the endpoint is closed")]
    ClosedChannel,
    #[error("could not register the socket: {0}")]
    Register(io::Error),
}

impl EndpointError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EndpointError::Timeout(_))
    }

    /// short label used in metric keys
    pub fn kind(&self) -> &'static str {
        match self {
            EndpointError::Io(_) => "io",
            EndpointError::Resolve { .. } => "resolve",
            EndpointError::Connect { .. } => "connect",
            EndpointError::Timeout(_) => "timeout",
            EndpointError::ClosedChannel => "closed_channel",
            EndpointError::Register(_) => "register",
        }
    }
}

#[derive(Debug, Default)]
struct Outbound {
    queue: VecDeque<Vec<u8>>,
    /// chunk being written to the socket
    buffer: Vec<u8>,
    position: usize,
    closed: bool,
}

impl Outbound {
    fn has_remaining(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Moves the next non empty chunk into the write buffer if it is exhausted.
    /// Returns whether there is something to write.
    fn refill(&mut self) -> bool {
        while !self.has_remaining() {
            match self.queue.pop_front() {
                Some(chunk) => {
                    self.buffer = chunk;
                    self.position = 0;
                }
                None => {
                    self.buffer.clear();
                    self.position = 0;
                    return false;
                }
            }
        }
        true
    }

    fn is_pending(&self) -> bool {
        self.has_remaining() || !self.queue.is_empty()
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.buffer.clear();
        self.position = 0;
    }
}

/// The part of an endpoint shared with producers
pub struct Channel {
    token: Token,
    id: EndpointId,
    capacity: usize,
    outbound: Mutex<Outbound>,
    space: Condvar,
    notifier: Arc<Notifier>,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a chunk, blocking while the queue is full.
    ///
    /// The loop thread is never parked here, since it is the only one able to
    /// drain the queue: it pauses the endpoint it relays from instead.
    fn enqueue(&self, data: Vec<u8>) -> Result<(), EndpointError> {
        let mut outbound = self.lock();

        if !self.notifier.is_loop_thread() {
            while outbound.queue.len() >= self.capacity && !outbound.closed {
                outbound = self
                    .space
                    .wait(outbound)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        if outbound.closed {
            drop(outbound);
            self.notifier.push(
                self.token,
                self.id,
                Notification::Event(EndpointEvent::Error(EndpointError::ClosedChannel)),
            );
            return Err(EndpointError::ClosedChannel);
        }

        outbound.queue.push_back(data);
        outbound.refill();
        drop(outbound);

        self.notifier
            .push(self.token, self.id, Notification::Interest);
        Ok(())
    }
}

/// A handle to write to an endpoint from any thread
#[derive(Clone)]
pub struct EndpointWriter {
    channel: Arc<Channel>,
}

impl EndpointWriter {
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), EndpointError> {
        self.channel.enqueue(data.into())
    }

    pub fn token(&self) -> Token {
        self.channel.token
    }
}

pub struct Endpoint {
    pub id: EndpointId,
    pub token: Token,
    pub role: Role,
    /// destination of a remote endpoint
    pub host: Option<String>,
    pub port: u16,
    pub peer_address: Option<SocketAddr>,
    /// the session this endpoint belongs to, resolved through the session map
    pub attachment: Option<ConnectionId>,
    socket: TcpStream,
    channel: Arc<Channel>,
    inbound: Vec<u8>,
    interest: Interest,
    connecting: bool,
    torn_down: bool,
    /// reads stop until [`Endpoint::resume_reading`]
    paused: bool,
    /// raise [`EndpointEvent::Drained`] on the next drain under the bound
    watch_drain: bool,
    pub created: Instant,
    pub connected_at: Option<Instant>,
    /// zero disables the idle-read deadline
    read_timeout: Duration,
    last_read: Instant,
    subscribers: Vec<Subscriber>,
}

impl Endpoint {
    /// Wraps an accepted client socket and registers it for reads
    pub fn local(
        id: EndpointId,
        token: Token,
        mut socket: TcpStream,
        registry: &Registry,
        notifier: Arc<Notifier>,
        buffer_size: usize,
        capacity: usize,
    ) -> Result<Endpoint, EndpointError> {
        registry
            .register(&mut socket, token, Interest::READABLE)
            .map_err(EndpointError::Register)?;
        let peer_address = socket.peer_addr().ok();

        let mut endpoint = Endpoint::new(
            id,
            token,
            Role::Local,
            socket,
            notifier,
            buffer_size,
            capacity,
        );
        endpoint.peer_address = peer_address;
        endpoint.interest = Interest::READABLE;
        endpoint.connected_at = Some(endpoint.created);
        Ok(endpoint)
    }

    /// Resolves `host`, then starts a non-blocking connect. Completion is
    /// reported by the loop through [`Endpoint::finish_connect`]; data may be
    /// queued before that.
    #[allow(clippy::too_many_arguments)]
    pub fn remote(
        id: EndpointId,
        token: Token,
        host: &str,
        port: u16,
        registry: &Registry,
        notifier: Arc<Notifier>,
        buffer_size: usize,
        capacity: usize,
    ) -> Result<Endpoint, EndpointError> {
        let name = format!("{host}:{port}");
        let address = (host, port)
            .to_socket_addrs()
            .map_err(|error| EndpointError::Resolve {
                address: name.clone(),
                error,
            })?
            .next()
            .ok_or_else(|| EndpointError::Resolve {
                address: name.clone(),
                error: io::Error::new(ErrorKind::NotFound, "no address found"),
            })?;

        let mut socket = TcpStream::connect(address).map_err(|error| EndpointError::Connect {
            address: name,
            error,
        })?;
        let interest = Interest::READABLE | Interest::WRITABLE;
        registry
            .register(&mut socket, token, interest)
            .map_err(EndpointError::Register)?;

        let mut endpoint = Endpoint::new(
            id,
            token,
            Role::Remote,
            socket,
            notifier,
            buffer_size,
            capacity,
        );
        endpoint.host = Some(host.to_owned());
        endpoint.port = port;
        endpoint.peer_address = Some(address);
        endpoint.interest = interest;
        endpoint.connecting = true;
        Ok(endpoint)
    }

    fn new(
        id: EndpointId,
        token: Token,
        role: Role,
        socket: TcpStream,
        notifier: Arc<Notifier>,
        buffer_size: usize,
        capacity: usize,
    ) -> Endpoint {
        let now = Instant::now();
        Endpoint {
            id,
            token,
            role,
            host: None,
            port: 0,
            peer_address: None,
            attachment: None,
            socket,
            channel: Arc::new(Channel {
                token,
                id,
                capacity,
                outbound: Mutex::new(Outbound::default()),
                space: Condvar::new(),
                notifier,
            }),
            inbound: vec![0; buffer_size],
            interest: Interest::READABLE,
            connecting: false,
            torn_down: false,
            paused: false,
            watch_drain: false,
            created: now,
            connected_at: None,
            read_timeout: Duration::ZERO,
            last_read: now,
            subscribers: Vec::new(),
        }
    }

    /// `host:port` of a remote endpoint, the peer address of a local one
    pub fn name(&self) -> String {
        match (&self.host, self.peer_address) {
            (Some(host), _) => format!("{}:{}", host, self.port),
            (None, Some(address)) => address.to_string(),
            (None, None) => "<unknown>".to_owned(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Subscriber) {
        if !self.subscribers.contains(&subscriber) {
            self.subscribers.push(subscriber);
        }
    }

    pub fn subscribers(&self) -> &[Subscriber] {
        &self.subscribers
    }

    pub fn writer(&self) -> EndpointWriter {
        EndpointWriter {
            channel: self.channel.clone(),
        }
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// a close was requested, the socket may still be draining
    pub fn is_closed(&self) -> bool {
        self.channel.lock().closed
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// chunks waiting behind the one being written
    pub fn queued_chunks(&self) -> usize {
        self.channel.lock().queue.len()
    }

    /// the queue reached its bound
    pub fn is_full(&self) -> bool {
        self.queued_chunks() >= self.channel.capacity
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn notify(&self, event: EndpointEvent) {
        self.channel
            .notifier
            .push(self.token, self.id, Notification::Event(event));
    }

    /// Queues data, blocking the caller while the queue is full
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), EndpointError> {
        self.channel.enqueue(data.into())
    }

    /// Reads once. A successful read is delivered as one input event, refreshes
    /// the idle deadline, and queues the next read behind that event: reading
    /// goes on until the socket would block or the endpoint is paused.
    pub fn read(&mut self, registry: &Registry) {
        loop {
            if self.torn_down || self.connecting || self.paused {
                return;
            }

            match self.socket.read(&mut self.inbound) {
                Ok(0) => {
                    trace!("endpoint {} {}: end of stream", self.id, self.name());
                    self.close(registry);
                    return;
                }
                Ok(size) => {
                    self.last_read = Instant::now();
                    self.notify(EndpointEvent::Input(self.inbound[..size].to_vec()));
                    self.channel
                        .notifier
                        .push(self.token, self.id, Notification::Read);
                    return;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("endpoint {} {}: read error: {}", self.id, self.name(), e);
                    self.abort(registry);
                    self.notify(EndpointEvent::Error(EndpointError::Io(e)));
                    return;
                }
            }
        }
    }

    /// Writes as much of the pending data as the socket accepts
    pub fn flush_ready(&mut self, registry: &Registry) {
        if self.torn_down || self.connecting {
            return;
        }

        let channel = self.channel.clone();
        let mut outbound = channel.lock();
        loop {
            if !outbound.refill() {
                break;
            }
            let position = outbound.position;
            match self.socket.write(&outbound.buffer[position..]) {
                Ok(0) => break,
                Ok(size) => outbound.position += size,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(outbound);
                    debug!("endpoint {} {}: write error: {}", self.id, self.name(), e);
                    self.abort(registry);
                    self.notify(EndpointEvent::Error(EndpointError::Io(e)));
                    return;
                }
            }
        }
        drop(outbound);

        self.drain_to_buffer(registry);
    }

    /// Pulls the next chunk into the write buffer if needed, wakes blocked
    /// producers, and finishes a deferred close once everything is written.
    pub fn drain_to_buffer(&mut self, registry: &Registry) {
        let (finished, drained) = {
            let mut outbound = self.channel.lock();
            outbound.refill();
            (
                outbound.closed && !outbound.is_pending(),
                outbound.queue.len() <= self.channel.capacity / 2,
            )
        };
        self.channel.space.notify_all();

        if drained && self.watch_drain {
            self.watch_drain = false;
            self.notify(EndpointEvent::Drained);
        }
        if finished {
            self.teardown(registry);
        } else {
            self.update_interest(registry);
        }
    }

    fn update_interest(&mut self, registry: &Registry) {
        if self.torn_down {
            return;
        }

        let (closed, pending) = {
            let outbound = self.channel.lock();
            (outbound.closed, outbound.is_pending())
        };

        let interest = match (!closed && !self.paused, pending || self.connecting) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            // a paused endpoint with nothing to write still needs some interest
            (false, _) => Interest::WRITABLE,
        };

        if interest != self.interest {
            match registry.reregister(&mut self.socket, self.token, interest) {
                Ok(()) => self.interest = interest,
                Err(e) => error!(
                    "endpoint {} {}: could not update interest: {}",
                    self.id,
                    self.name(),
                    e
                ),
            }
        }
    }

    /// Stops reading, and drops read interest, until [`Endpoint::resume_reading`]
    pub fn pause_reading(&mut self, registry: &Registry) {
        if self.torn_down || self.paused {
            return;
        }
        trace!("endpoint {} {}: reads paused", self.id, self.name());
        self.paused = true;
        self.update_interest(registry);
    }

    /// Restores read interest and queues a read for the data left unread
    pub fn resume_reading(&mut self, registry: &Registry) {
        if self.torn_down || !self.paused {
            return;
        }
        trace!("endpoint {} {}: reads resumed", self.id, self.name());
        self.paused = false;
        self.last_read = Instant::now();
        self.update_interest(registry);
        self.channel
            .notifier
            .push(self.token, self.id, Notification::Read);
    }

    /// Raises [`EndpointEvent::Drained`] once the queue is half empty
    pub fn watch_drain(&mut self) {
        self.watch_drain = true;
    }

    /// Stops accepting writes. The socket is torn down once pending data is
    /// written, right away if there is none. Closing twice does nothing.
    pub fn close(&mut self, registry: &Registry) {
        if self.torn_down {
            return;
        }

        let (already_closed, pending) = {
            let mut outbound = self.channel.lock();
            let already_closed = outbound.closed;
            outbound.closed = true;
            (already_closed, outbound.is_pending())
        };
        self.channel.space.notify_all();

        if already_closed {
            return;
        }

        if pending {
            trace!(
                "endpoint {} {}: close deferred until the buffer drains",
                self.id,
                self.name()
            );
            self.update_interest(registry);
        } else {
            self.teardown(registry);
        }
    }

    /// Drops pending data and tears down immediately
    pub fn abort(&mut self, registry: &Registry) {
        {
            let mut outbound = self.channel.lock();
            outbound.closed = true;
            outbound.clear();
        }
        self.teardown(registry);
    }

    fn teardown(&mut self, registry: &Registry) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        {
            let mut outbound = self.channel.lock();
            outbound.closed = true;
            outbound.clear();
        }
        self.channel.space.notify_all();

        if let Err(e) = registry.deregister(&mut self.socket) {
            debug!("endpoint {} {}: could not deregister: {}", self.id, self.name(), e);
        }
        let _ = self.socket.shutdown(Shutdown::Both);

        trace!("endpoint {} {}: torn down", self.id, self.name());
        self.notify(EndpointEvent::Disconnected);
    }

    /// Completes a non-blocking connect. Does nothing while it is still in
    /// progress.
    pub fn finish_connect(&mut self, registry: &Registry) {
        if !self.connecting || self.torn_down {
            return;
        }

        let failure = match self.socket.take_error() {
            Ok(Some(error)) | Err(error) => Some(error),
            Ok(None) => match self.socket.peer_addr() {
                Ok(_) => None,
                Err(e) if e.kind() == ErrorKind::NotConnected || e.kind() == ErrorKind::WouldBlock => {
                    return;
                }
                Err(e) => Some(e),
            },
        };

        if let Some(error) = failure {
            debug!("endpoint {} {}: connection failed: {}", self.id, self.name(), error);
            self.notify(EndpointEvent::Error(EndpointError::Connect {
                address: self.name(),
                error,
            }));
            self.abort(registry);
            return;
        }

        self.connecting = false;
        self.connected_at = Some(Instant::now());
        self.last_read = Instant::now();
        debug!("endpoint {} {}: connected", self.id, self.name());
        self.notify(EndpointEvent::Connected);

        self.flush_ready(registry);
    }

    /// Arms the idle-read deadline, counting from now. Zero disables it.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
        self.last_read = Instant::now();
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Time left before the idle-read deadline, `None` when there is none. A
    /// paused endpoint is not idle.
    pub fn time_to_timeout(&self, now: Instant) -> Option<Duration> {
        if self.read_timeout.is_zero() || self.torn_down || self.paused {
            return None;
        }
        Some((self.last_read + self.read_timeout).saturating_duration_since(now))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.time_to_timeout(now) == Some(Duration::ZERO)
    }

    /// Raises the timeout error, then tears the endpoint down
    pub fn on_timeout(&mut self, registry: &Registry) {
        if self.torn_down {
            return;
        }
        debug!(
            "endpoint {} {}: no data received for {:?}",
            self.id,
            self.name(),
            self.read_timeout
        );
        self.notify(EndpointEvent::Error(EndpointError::Timeout(self.read_timeout)));
        self.abort(registry);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("role", &self.role)
            .field("name", &self.name())
            .field("attachment", &self.attachment)
            .field("connecting", &self.connecting)
            .field("torn_down", &self.torn_down)
            .field("paused", &self.paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::{net::TcpListener, sync::mpsc, thread};

    const WAKER: Token = Token(1000);

    fn setup() -> (Poll, Arc<Notifier>) {
        let poll = Poll::new().expect("could not create poll");
        let notifier = Arc::new(Notifier::new(poll.registry(), WAKER).expect("waker"));
        (poll, notifier)
    }

    /// an accepted non-blocking socket and its blocking peer
    fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("could not bind");
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap())
            .expect("could not connect");
        let (accepted, _) = listener.accept().expect("could not accept");
        accepted.set_nonblocking(true).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        (TcpStream::from_std(accepted), peer)
    }

    fn local_endpoint(poll: &Poll, notifier: &Arc<Notifier>) -> (Endpoint, std::net::TcpStream) {
        let (socket, peer) = socket_pair();
        let endpoint = Endpoint::local(
            EndpointId(1),
            Token(0),
            socket,
            poll.registry(),
            notifier.clone(),
            1024,
            MAX_OUTBOUND_CHUNKS,
        )
        .expect("could not create endpoint");
        (endpoint, peer)
    }

    fn events(notifier: &Notifier) -> Vec<EndpointEvent> {
        let mut events = Vec::new();
        while let Some((_, _, notification)) = notifier.pop() {
            if let Notification::Event(event) = notification {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn backpressure_blocks_without_losing_chunks() {
        let (poll, notifier) = setup();
        let (mut endpoint, mut peer) = local_endpoint(&poll, &notifier);
        let writer = endpoint.writer();

        let mut expected = Vec::new();
        // the first chunk goes to the write buffer, the next ones fill the queue
        for i in 0..=MAX_OUTBOUND_CHUNKS {
            let chunk = format!("{:08}", i).into_bytes();
            expected.extend_from_slice(&chunk);
            writer.write(chunk).expect("queue should accept the chunk");
        }
        assert_eq!(endpoint.queued_chunks(), MAX_OUTBOUND_CHUNKS);

        let (done_tx, done_rx) = mpsc::channel();
        let blocked_writer = writer.clone();
        let producer = thread::spawn(move || {
            let result = blocked_writer.write(b"the last".to_vec());
            done_tx.send(()).unwrap();
            result
        });
        expected.extend_from_slice(b"the last");

        assert!(
            done_rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "the producer should block on a full queue"
        );

        endpoint.flush_ready(poll.registry());
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("the producer should be released once the queue drains");
        producer
            .join()
            .unwrap()
            .expect("the blocked write should succeed");

        let mut received = Vec::new();
        let mut buffer = [0u8; 8192];
        while received.len() < expected.len() {
            endpoint.flush_ready(poll.registry());
            let size = peer.read(&mut buffer).expect("could not read from peer");
            assert!(size > 0, "unexpected end of stream");
            received.extend_from_slice(&buffer[..size]);
        }
        assert_eq!(received, expected);
    }

    #[test]
    fn draining_a_full_queue_is_reported_once() {
        let (poll, notifier) = setup();
        let (mut endpoint, mut peer) = local_endpoint(&poll, &notifier);

        for _ in 0..=MAX_OUTBOUND_CHUNKS {
            endpoint.write(vec![b'a'; 16]).unwrap();
        }
        assert!(endpoint.is_full());
        endpoint.watch_drain();

        let expected = 16 * (MAX_OUTBOUND_CHUNKS + 1);
        let mut received = 0;
        let mut buffer = [0u8; 8192];
        while received < expected {
            endpoint.flush_ready(poll.registry());
            received += peer.read(&mut buffer).expect("could not read from peer");
        }
        endpoint.flush_ready(poll.registry());
        assert!(!endpoint.is_full());

        let drained = events(&notifier)
            .iter()
            .filter(|event| matches!(event, EndpointEvent::Drained))
            .count();
        assert_eq!(drained, 1);
    }

    #[test]
    fn paused_endpoints_read_nothing_until_resumed() {
        let (poll, notifier) = setup();
        let (mut endpoint, mut peer) = local_endpoint(&poll, &notifier);
        endpoint.set_read_timeout(Duration::from_millis(50));

        endpoint.pause_reading(poll.registry());
        assert!(endpoint.is_paused());
        assert_eq!(endpoint.time_to_timeout(Instant::now()), None);

        peer.write_all(b"held").unwrap();
        thread::sleep(Duration::from_millis(50));
        endpoint.read(poll.registry());
        assert!(notifier.is_empty());

        endpoint.resume_reading(poll.registry());
        assert!(!endpoint.is_paused());
        assert!(endpoint.time_to_timeout(Instant::now()).is_some());
        assert!(matches!(notifier.pop(), Some((_, _, Notification::Read))));

        endpoint.read(poll.registry());
        let events = events(&notifier);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], EndpointEvent::Input(data) if data == b"held"));
    }

    #[test]
    fn close_unblocks_producers_and_rejects_writes() {
        let (poll, notifier) = setup();
        let (mut endpoint, _peer) = local_endpoint(&poll, &notifier);
        let writer = endpoint.writer();

        for _ in 0..=MAX_OUTBOUND_CHUNKS {
            writer.write(b"x".to_vec()).unwrap();
        }

        let blocked_writer = writer.clone();
        let producer = thread::spawn(move || blocked_writer.write(b"y".to_vec()));
        thread::sleep(Duration::from_millis(100));

        endpoint.abort(poll.registry());
        assert!(matches!(
            producer.join().unwrap(),
            Err(EndpointError::ClosedChannel)
        ));
        assert!(matches!(
            writer.write(b"z".to_vec()),
            Err(EndpointError::ClosedChannel)
        ));

        let events = events(&notifier);
        assert!(events
            .iter()
            .any(|event| matches!(event, EndpointEvent::Error(EndpointError::ClosedChannel))));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, EndpointEvent::Disconnected))
                .count(),
            1
        );
    }

    #[test]
    fn close_is_idempotent() {
        let (poll, notifier) = setup();
        let (mut endpoint, _peer) = local_endpoint(&poll, &notifier);

        endpoint.close(poll.registry());
        assert!(endpoint.is_torn_down());
        endpoint.close(poll.registry());
        endpoint.abort(poll.registry());

        let events = events(&notifier);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EndpointEvent::Disconnected));
    }

    #[test]
    fn close_waits_for_pending_data() {
        let (poll, notifier) = setup();
        let (mut endpoint, mut peer) = local_endpoint(&poll, &notifier);

        endpoint.write(b"goodbye".to_vec()).unwrap();
        endpoint.close(poll.registry());
        assert!(endpoint.is_closed());
        assert!(!endpoint.is_torn_down());

        endpoint.flush_ready(poll.registry());
        assert!(endpoint.is_torn_down());

        let mut received = Vec::new();
        peer.read_to_end(&mut received).expect("could not read from peer");
        assert_eq!(received, b"goodbye");
    }

    #[test]
    fn read_delivers_input_then_end_of_stream() {
        let (mut poll, notifier) = setup();
        let (mut endpoint, mut peer) = local_endpoint(&poll, &notifier);

        peer.write_all(b"hello").unwrap();
        drop(peer);

        let mut events_buffer = Events::with_capacity(8);
        let mut received = Vec::new();
        let mut disconnected = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !disconnected && Instant::now() < deadline {
            poll.poll(&mut events_buffer, Some(Duration::from_millis(100)))
                .expect("poll failed");
            endpoint.read(poll.registry());
            for event in events(&notifier) {
                match event {
                    EndpointEvent::Input(data) => received.extend(data),
                    EndpointEvent::Disconnected => disconnected = true,
                    other => panic!("unexpected event {:?}", other),
                }
            }
        }
        assert_eq!(received, b"hello");
        assert!(disconnected);
    }

    #[test]
    fn idle_timeout() {
        let (poll, notifier) = setup();
        let (mut endpoint, _peer) = local_endpoint(&poll, &notifier);
        let now = Instant::now();
        assert_eq!(endpoint.time_to_timeout(now), None);

        endpoint.set_read_timeout(Duration::from_millis(50));
        let left = endpoint.time_to_timeout(Instant::now()).unwrap();
        assert!(left <= Duration::from_millis(50));
        assert!(!endpoint.is_expired(Instant::now()));
        assert!(endpoint.is_expired(Instant::now() + Duration::from_millis(100)));

        endpoint.on_timeout(poll.registry());
        let events = events(&notifier);
        assert!(matches!(
            events[0],
            EndpointEvent::Error(EndpointError::Timeout(_))
        ));
        assert!(matches!(events[1], EndpointEvent::Disconnected));
        assert_eq!(endpoint.time_to_timeout(Instant::now()), None);
    }

    #[test]
    fn remote_connects_and_flushes_early_writes() {
        let (mut poll, notifier) = setup();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut endpoint = Endpoint::remote(
            EndpointId(2),
            Token(3),
            "127.0.0.1",
            port,
            poll.registry(),
            notifier.clone(),
            1024,
            MAX_OUTBOUND_CHUNKS,
        )
        .expect("could not start connecting");
        assert_eq!(endpoint.name(), format!("127.0.0.1:{}", port));
        endpoint.write(b"early".to_vec()).unwrap();

        let (mut upstream, _) = listener.accept().unwrap();
        upstream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut events_buffer = Events::with_capacity(8);
        let deadline = Instant::now() + Duration::from_secs(5);
        while endpoint.is_connecting() && Instant::now() < deadline {
            poll.poll(&mut events_buffer, Some(Duration::from_millis(100)))
                .unwrap();
            endpoint.finish_connect(poll.registry());
        }
        assert!(!endpoint.is_connecting());
        assert!(events(&notifier)
            .iter()
            .any(|event| matches!(event, EndpointEvent::Connected)));

        let mut buffer = [0u8; 5];
        upstream.read_exact(&mut buffer).unwrap();
        assert_eq!(&buffer, b"early");
    }
}
