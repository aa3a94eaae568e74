//! The event loop.
//!
//! One thread owns the [`Server`]: the listener, the poll, every endpoint and
//! the proxy state. Each turn it expires idle endpoints, dispatches queued
//! endpoint events, and waits for readiness no longer than the nearest idle
//! deadline. Other threads reach it only through the [`Notifier`].
use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use mio::{
    event::Event,
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Registry, Token,
};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use relais_command_lib::config::Config;

use crate::{
    endpoint::{Endpoint, EndpointError, EndpointEvent, EndpointWriter, Role, Subscriber},
    metrics::{Diagnostics, LocalDrain},
    notifier::{Notification, Notifier},
    parser::{Http1Parser, MessageParser},
    protocol::Proxy,
    session::Timeouts,
    ConnectionId, EndpointId, IdGenerator, ServerError,
};

pub const LISTENER: Token = Token(usize::MAX - 1);
pub const WAKER: Token = Token(usize::MAX - 2);

const EVENTS_CAPACITY: usize = 1024;
const LISTEN_BACKLOG: i32 = 1024;

/// Every live endpoint, indexed by its poll token
pub struct EndpointSet {
    slab: Slab<Endpoint>,
    registry: Registry,
    notifier: Arc<Notifier>,
    ids: Arc<IdGenerator>,
    buffer_size: usize,
    capacity: usize,
    /// given to every endpoint, in this order
    subscribers: Vec<Subscriber>,
}

impl EndpointSet {
    pub fn new(
        registry: Registry,
        notifier: Arc<Notifier>,
        ids: Arc<IdGenerator>,
        buffer_size: usize,
        capacity: usize,
    ) -> Self {
        EndpointSet {
            slab: Slab::with_capacity(128),
            registry,
            notifier,
            ids,
            buffer_size,
            capacity,
            subscribers: vec![Subscriber::Proxy, Subscriber::Diagnostics],
        }
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// client endpoints not torn down yet
    pub fn local_count(&self) -> usize {
        self.slab
            .iter()
            .filter(|(_, endpoint)| endpoint.role == Role::Local && !endpoint.is_torn_down())
            .count()
    }

    pub fn get(&self, token: Token) -> Option<&Endpoint> {
        self.slab.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Endpoint> {
        self.slab.get_mut(token.0)
    }

    pub fn name(&self, token: Token) -> Option<String> {
        self.get(token).map(Endpoint::name)
    }

    /// the endpoint exists and accepts writes
    pub fn is_open(&self, token: Token) -> bool {
        self.get(token)
            .map(|endpoint| !endpoint.is_closed() && !endpoint.is_torn_down())
            .unwrap_or(false)
    }

    pub fn attach(&mut self, token: Token, id: ConnectionId) {
        if let Some(endpoint) = self.get_mut(token) {
            endpoint.attachment = Some(id);
        }
    }

    pub fn attachment(&self, token: Token) -> Option<ConnectionId> {
        self.get(token).and_then(|endpoint| endpoint.attachment)
    }

    pub fn writer(&self, token: Token) -> Option<EndpointWriter> {
        self.get(token).map(Endpoint::writer)
    }

    pub fn insert_local(&mut self, socket: TcpStream) -> Result<Token, EndpointError> {
        let entry = self.slab.vacant_entry();
        let token = Token(entry.key());
        let mut endpoint = Endpoint::local(
            self.ids.next_endpoint(),
            token,
            socket,
            &self.registry,
            self.notifier.clone(),
            self.buffer_size,
            self.capacity,
        )?;
        for subscriber in &self.subscribers {
            endpoint.subscribe(*subscriber);
        }
        entry.insert(endpoint);
        Ok(token)
    }

    /// Opens an endpoint towards `host:port` for the session `attachment`
    pub fn connect_remote(
        &mut self,
        host: &str,
        port: u16,
        attachment: ConnectionId,
    ) -> Result<Token, EndpointError> {
        let entry = self.slab.vacant_entry();
        let token = Token(entry.key());
        let mut endpoint = Endpoint::remote(
            self.ids.next_endpoint(),
            token,
            host,
            port,
            &self.registry,
            self.notifier.clone(),
            self.buffer_size,
            self.capacity,
        )?;
        endpoint.attachment = Some(attachment);
        for subscriber in &self.subscribers {
            endpoint.subscribe(*subscriber);
        }
        entry.insert(endpoint);
        Ok(token)
    }

    pub fn write(&self, token: Token, data: Vec<u8>) -> Result<(), EndpointError> {
        match self.get(token) {
            Some(endpoint) => endpoint.write(data),
            None => Err(EndpointError::ClosedChannel),
        }
    }

    pub fn close(&mut self, token: Token) {
        if let Some(endpoint) = self.slab.get_mut(token.0) {
            endpoint.close(&self.registry);
        }
    }

    pub fn abort(&mut self, token: Token) {
        if let Some(endpoint) = self.slab.get_mut(token.0) {
            endpoint.abort(&self.registry);
        }
    }

    pub fn set_read_timeout(&mut self, token: Token, timeout: Duration) {
        if let Some(endpoint) = self.get_mut(token) {
            endpoint.set_read_timeout(timeout);
        }
    }

    pub fn read_timeout(&self, token: Token) -> Option<Duration> {
        self.get(token).map(Endpoint::read_timeout)
    }

    pub fn is_full(&self, token: Token) -> bool {
        self.get(token).map(Endpoint::is_full).unwrap_or(false)
    }

    /// Stops reading from `source` until `full` drains
    pub fn hold_back(&mut self, source: Token, full: Token) {
        if let Some(endpoint) = self.slab.get_mut(full.0) {
            endpoint.watch_drain();
        }
        if let Some(endpoint) = self.slab.get_mut(source.0) {
            endpoint.pause_reading(&self.registry);
        }
    }

    pub fn resume(&mut self, token: Token) {
        if let Some(endpoint) = self.slab.get_mut(token.0) {
            endpoint.resume_reading(&self.registry);
        }
    }

    /// Handles one readiness event
    pub fn ready(&mut self, token: Token, event: &Event) {
        let Some(endpoint) = self.slab.get_mut(token.0) else {
            return;
        };
        if endpoint.is_torn_down() {
            return;
        }

        if endpoint.is_connecting() {
            endpoint.finish_connect(&self.registry);
            if endpoint.is_connecting() || endpoint.is_torn_down() {
                return;
            }
        }

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            endpoint.read(&self.registry);
        }
        if event.is_writable() {
            endpoint.flush_ready(&self.registry);
        }
    }

    /// Picks up data queued since the last write, unless the token now
    /// belongs to another endpoint
    pub fn flush(&mut self, token: Token, id: EndpointId) {
        if let Some(endpoint) = self.slab.get_mut(token.0) {
            if endpoint.id == id {
                endpoint.flush_ready(&self.registry);
            }
        }
    }

    /// Continues reading, unless the token now belongs to another endpoint
    pub fn read(&mut self, token: Token, id: EndpointId) {
        if let Some(endpoint) = self.slab.get_mut(token.0) {
            if endpoint.id == id {
                endpoint.read(&self.registry);
            }
        }
    }

    pub fn expire_timeouts(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .slab
            .iter()
            .filter(|(_, endpoint)| endpoint.is_expired(now))
            .map(|(key, _)| key)
            .collect();

        for key in expired {
            if let Some(endpoint) = self.slab.get_mut(key) {
                endpoint.on_timeout(&self.registry);
            }
        }
    }

    /// time until the nearest idle deadline
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.slab
            .iter()
            .filter_map(|(_, endpoint)| endpoint.time_to_timeout(now))
            .min()
    }

    /// Forgets torn down endpoints. Their events must have been dispatched.
    pub fn sweep(&mut self) {
        self.slab.retain(|_, endpoint| !endpoint.is_torn_down());
    }

    pub fn abort_all(&mut self) {
        for (_, endpoint) in self.slab.iter_mut() {
            endpoint.abort(&self.registry);
        }
    }
}

/// Binds a non-blocking listener with `SO_REUSEADDR`
pub fn server_bind(address: SocketAddr) -> Result<TcpListener, ServerError> {
    let bind_error = |error: io::Error| ServerError::Bind { address, error };

    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&address.into()).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;

    Ok(TcpListener::from_std(socket.into()))
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_address: SocketAddr,
    notifier: Arc<Notifier>,
    endpoints: EndpointSet,
    proxy: Proxy,
    diagnostics: Diagnostics,
    max_connections: usize,
}

impl Server {
    pub fn new(config: &Config) -> Result<Server, ServerError> {
        Self::with_parser(config, Box::new(Http1Parser::new()))
    }

    /// A server relaying through another parser
    pub fn with_parser(
        config: &Config,
        parser: Box<dyn MessageParser + Send>,
    ) -> Result<Server, ServerError> {
        let poll = Poll::new().map_err(ServerError::Poll)?;

        let mut listener = server_bind(config.listen_address)?;
        let local_address = listener
            .local_addr()
            .map_err(|error| ServerError::Bind {
                address: config.listen_address,
                error,
            })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::Register)?;

        let notifier = Arc::new(Notifier::new(poll.registry(), WAKER).map_err(ServerError::Waker)?);
        let registry = poll.registry().try_clone().map_err(ServerError::Poll)?;
        let ids = Arc::new(IdGenerator::new());

        let endpoints = EndpointSet::new(
            registry,
            notifier.clone(),
            ids.clone(),
            config.buffer_size,
            config.max_outbound_chunks,
        );
        let proxy = Proxy::new(
            parser,
            ids,
            Timeouts {
                keep_alive: config.keep_alive_timeout,
                tunnel: config.tunnel_timeout,
            },
        );

        Ok(Server {
            poll,
            listener,
            local_address,
            notifier,
            endpoints,
            proxy,
            diagnostics: Diagnostics::new(),
            max_connections: config.max_connections,
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn into_drain(self) -> LocalDrain {
        self.diagnostics.into_drain()
    }

    /// Runs until [`Notifier::stop`] is called
    pub fn run(&mut self) -> Result<(), ServerError> {
        self.notifier.bind_current_thread();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!("listening on {}", self.local_address);

        while self.turn(&mut events, None)? {}
        Ok(())
    }

    /// One pass of the loop, waiting for readiness no longer than `max_wait`
    /// on top of the idle deadlines. Returns false once stopped.
    fn turn(
        &mut self,
        events: &mut Events,
        max_wait: Option<Duration>,
    ) -> Result<bool, ServerError> {
        self.endpoints.expire_timeouts(Instant::now());
        self.process_notifications();
        self.endpoints.sweep();

        if self.notifier.is_stopping() {
            self.shutdown();
            return Ok(false);
        }

        let timeout = match (self.endpoints.next_timeout(Instant::now()), max_wait) {
            (Some(deadline), Some(wait)) => Some(deadline.min(wait)),
            (deadline, wait) => deadline.or(wait),
        };
        if let Err(error) = self.poll.poll(events, timeout) {
            if error.kind() == ErrorKind::Interrupted {
                return Ok(true);
            }
            error!("error while polling events: {:?}", error);
            return Err(ServerError::PollFailed(error));
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => self.accept(),
                WAKER => trace!("woken up"),
                token => self.endpoints.ready(token, event),
            }
            self.process_notifications();
        }
        Ok(true)
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, address)) => {
                    if self.endpoints.local_count() >= self.max_connections {
                        warn!(
                            "refusing {}: {} client connections already",
                            address, self.max_connections
                        );
                        self.diagnostics.on_refused();
                        continue;
                    }

                    match self.endpoints.insert_local(socket) {
                        Ok(token) => {
                            debug!("accepted {} as {:?}", address, token);
                            self.diagnostics.on_accept();
                            self.proxy.on_client_connect(&mut self.endpoints, token);
                        }
                        Err(e) => error!("could not set up client {}: {}", address, e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept error: {}", e);
                    return;
                }
            }
        }
    }

    fn process_notifications(&mut self) {
        while let Some((token, id, notification)) = self.notifier.pop() {
            match notification {
                Notification::Interest => self.endpoints.flush(token, id),
                Notification::Read => self.endpoints.read(token, id),
                Notification::Event(event) => self.dispatch(token, id, event),
            }
        }
    }

    fn dispatch(&mut self, token: Token, id: EndpointId, event: EndpointEvent) {
        let subscribers = match self.endpoints.get(token) {
            Some(endpoint) if endpoint.id == id => endpoint.subscribers().to_vec(),
            _ => {
                trace!("dropping {:?} for the stale endpoint {}", event, id);
                return;
            }
        };

        for subscriber in subscribers {
            match subscriber {
                Subscriber::Proxy => self.proxy.handle_event(&mut self.endpoints, token, &event),
                Subscriber::Diagnostics => {
                    if let Some(endpoint) = self.endpoints.get(token) {
                        self.diagnostics.record(endpoint, &event);
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        info!(
            "stopping, closing {} sessions and {} endpoints",
            self.proxy.session_count(),
            self.endpoints.len()
        );
        self.proxy.shutdown(&mut self.endpoints);
        self.endpoints.abort_all();
        self.process_notifications();
        self.endpoints.sweep();

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!("could not deregister the listener: {}", e);
        }
    }
}

/// A proxy running on its own thread
pub struct ServerHandle {
    local_address: SocketAddr,
    notifier: Arc<Notifier>,
    thread: Option<JoinHandle<Result<LocalDrain, ServerError>>>,
}

impl ServerHandle {
    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// Stops the event loop, closing every session, and returns the
    /// collected metrics
    pub fn stop(mut self) -> Result<LocalDrain, ServerError> {
        self.notifier.stop();
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ServerError::LoopPanicked)?,
            None => Err(ServerError::LoopPanicked),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.notifier.stop();
            let _ = thread.join();
        }
    }
}

/// Binds the listener, then runs the event loop on a new thread
pub fn start(config: &Config) -> Result<ServerHandle, ServerError> {
    let mut server = Server::new(config)?;
    let local_address = server.local_address();
    let notifier = server.notifier();

    let thread = thread::Builder::new()
        .name(format!("relais-{}", local_address))
        .spawn(move || {
            server.run()?;
            Ok(server.into_drain())
        })
        .map_err(ServerError::Spawn)?;

    Ok(ServerHandle {
        local_address,
        notifier,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::TcpStream as StdTcpStream,
    };

    fn test_config() -> Config {
        Config {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        }
    }

    #[test]
    fn binds_an_ephemeral_port() {
        let listener = server_bind("127.0.0.1:0".parse().unwrap()).expect("could not bind");
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn bind_failure_names_the_address() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = taken.local_addr().unwrap();
        // SO_REUSEADDR does not allow binding over a listening socket
        match server_bind(address) {
            Err(ServerError::Bind { address: reported, .. }) => assert_eq!(reported, address),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("bound over a listening socket"),
        }
    }

    #[test]
    fn requests_without_destination_are_rejected() {
        let handle = start(&test_config()).expect("could not start the proxy");

        let mut client = StdTcpStream::connect(handle.local_address()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        let mut answer = String::new();
        client.read_to_string(&mut answer).unwrap();
        assert_eq!(
            answer,
            "HTTP/1.1 400 Bad request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );

        let drain = handle.stop().expect("the event loop failed");
        assert_eq!(drain.count("frontend.connections"), 1);
        assert_eq!(drain.count("frontend.bytes_in"), 18);
    }

    #[test]
    fn stop_closes_idle_clients() {
        let handle = start(&test_config()).expect("could not start the proxy");
        let mut client = StdTcpStream::connect(handle.local_address()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // make sure the connection was accepted before stopping
        client.write_all(b"GET / HTTP/1.1\r\nHost: ").unwrap();
        std::thread::sleep(Duration::from_millis(100));

        handle.stop().expect("the event loop failed");
        let mut rest = Vec::new();
        let read = client.read_to_end(&mut rest);
        assert!(read.map(|size| size == 0).unwrap_or(true));
    }

    #[test]
    fn a_slow_client_pauses_its_upstream() {
        let config = Config {
            buffer_size: 4096,
            max_outbound_chunks: 4,
            ..test_config()
        };
        let capacity = config.max_outbound_chunks;
        let mut server = Server::new(&config).expect("could not create the server");
        server.notifier.bind_current_thread();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        let upstream = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_address = upstream.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = upstream.accept() {
                let block = [b'x'; 4096];
                while stream.write_all(&block).is_ok() {}
            }
        });

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket
            .connect(&server.local_address().into())
            .expect("could not connect");
        let mut client: StdTcpStream = socket.into();
        write!(client, "CONNECT {} HTTP/1.1\r\n\r\n", upstream_address).unwrap();

        let within_bound = |server: &Server| {
            server
                .endpoints
                .slab
                .iter()
                .all(|(_, endpoint)| endpoint.queued_chunks() <= capacity)
        };
        let upstream_paused = |server: &Server| {
            server
                .endpoints
                .slab
                .iter()
                .any(|(_, endpoint)| endpoint.role == Role::Remote && endpoint.is_paused())
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while !upstream_paused(&server) {
            assert!(Instant::now() < deadline, "the upstream was never paused");
            server
                .turn(&mut events, Some(Duration::from_millis(10)))
                .expect("the event loop failed");
            assert!(within_bound(&server));
        }
        // waiting on the client is not idling
        let remote_deadline = server
            .endpoints
            .slab
            .iter()
            .find(|(_, endpoint)| endpoint.role == Role::Remote)
            .map(|(_, endpoint)| endpoint.time_to_timeout(Instant::now()));
        assert_eq!(remote_deadline, Some(None));

        // once the client reads, the queue drains and the upstream goes on
        client
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut buffer = vec![0; 65536];
        let deadline = Instant::now() + Duration::from_secs(10);
        while server.diagnostics().drain().count("frontend.drained") == 0 {
            assert!(Instant::now() < deadline, "the client queue never drained");
            let _ = client.read(&mut buffer);
            server
                .turn(&mut events, Some(Duration::from_millis(10)))
                .expect("the event loop failed");
            assert!(within_bound(&server));
        }

        server.notifier.stop();
        assert!(!server
            .turn(&mut events, None)
            .expect("the event loop failed"));
    }
}
