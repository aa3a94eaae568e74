use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use futures::{channel::mpsc, executor::block_on, StreamExt};

use crate::{
    http_utils::http_ok_response,
    mock::aggregator::{Aggregator, SimpleAggregator},
    BUFFER_SIZE,
};

/// Handle to a detached thread where a Backend runs
/// (a thin wrapper around a TcpListener)
pub struct BackendHandle<T> {
    pub name: String,
    /// where the backend actually listens
    pub address: SocketAddr,
    /// Allows to stop the backend within the thread
    pub stop_tx: mpsc::Sender<()>,
    /// Receives data from the backend on the thread
    pub aggregator_rx: mpsc::Receiver<T>,
}

type RequestHandler<A> = Box<dyn Fn(&TcpStream, &str, A) -> A + Send + Sync>;

impl<A: Aggregator + Send + Sync + 'static> BackendHandle<A> {
    /// Binds `address` (port 0 picks a free one) and serves every accepted
    /// connection with `handler` until stopped
    pub fn spawn_detached_backend<S: Into<String>>(
        name: S,
        address: SocketAddr,
        mut aggregator: A,
        handler: RequestHandler<A>,
    ) -> Self {
        let name = name.into();
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (mut aggregator_tx, aggregator_rx) = mpsc::channel::<A>(1);

        let listener = TcpListener::bind(address).expect("could not bind the backend");
        let address = listener.local_addr().expect("could not get the backend address");
        let mut clients = Vec::new();
        let thread_name = name.to_owned();

        // The backend runs on this detached thread:
        // - accepts tcp connections
        // - calls handler on each live connections
        // - monitors stop_rx to stop itself
        thread::spawn(move || {
            listener
                .set_nonblocking(true)
                .expect("could not set nonblocking on listener");
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        println!("{thread_name}: new connection");
                        stream
                            .set_nonblocking(true)
                            .expect("could not set nonblocking on client");
                        aggregator.add_connection();
                        clients.push(stream);
                    }
                    Err(error) => {
                        if error.kind() != ErrorKind::WouldBlock {
                            println!("IO Error: {error:?}");
                        }
                    }
                }
                for client in &clients {
                    aggregator = handler(client, &thread_name, aggregator);
                }
                if let Ok(Some(())) = stop_rx.try_next() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            drop(listener);
            aggregator_tx
                .try_send(aggregator)
                .expect("could not send aggregator");
        });

        Self {
            name,
            address,
            stop_tx,
            aggregator_rx,
        }
    }

    pub fn stop_and_get_aggregator(&mut self) -> Option<A> {
        self.stop_tx.try_send(()).expect("could not stop backend");
        block_on(self.aggregator_rx.next())
    }
}

/// Reads what is available, `None` when there is nothing to handle
fn read_available(mut stream: &TcpStream, backend_name: &str) -> Option<Vec<u8>> {
    let mut buf = [0u8; BUFFER_SIZE];
    match stream.read(&mut buf) {
        Ok(0) => None,
        Ok(size) => Some(buf[..size].to_vec()),
        Err(e) if e.kind() == ErrorKind::WouldBlock => None,
        Err(e) => {
            println!("{backend_name}: could not read: {e}");
            None
        }
    }
}

impl BackendHandle<SimpleAggregator> {
    /// This creates a callback that listens on a TcpStream
    /// and returns HTTP OK responses with the given content in the body
    pub fn http_handler<S: Into<String>>(content: S) -> RequestHandler<SimpleAggregator> {
        let response = http_ok_response(content);
        Self::tcp_handler(response)
    }

    /// This creates a callback that answers every read with the given raw
    /// content, well-formed or not
    pub fn tcp_handler<S: Into<String>>(content: S) -> RequestHandler<SimpleAggregator> {
        let content: String = content.into();
        Box::new(move |mut stream, backend_name, mut aggregator| {
            if read_available(stream, backend_name).is_some() {
                aggregator.add_request();
                match stream.write_all(content.as_bytes()) {
                    Ok(()) => aggregator.add_response(),
                    Err(e) => println!("{backend_name}: could not write: {e}"),
                }
            }
            aggregator
        })
    }

    /// This creates a callback writing back whatever it reads
    pub fn echo_handler() -> RequestHandler<SimpleAggregator> {
        Box::new(|mut stream, backend_name, mut aggregator| {
            if let Some(data) = read_available(stream, backend_name) {
                aggregator.add_request();
                if stream.write_all(&data).is_ok() {
                    aggregator.add_response();
                }
            }
            aggregator
        })
    }

    /// This creates a callback that reads and never answers
    pub fn silent_handler() -> RequestHandler<SimpleAggregator> {
        Box::new(|stream, backend_name, mut aggregator| {
            if read_available(stream, backend_name).is_some() {
                aggregator.add_request();
            }
            aggregator
        })
    }
}
