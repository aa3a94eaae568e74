use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use crate::{http_utils::response_complete, BUFFER_SIZE};

/// A raw-socket client sending the same request over one connection
pub struct Client {
    pub name: String,
    pub address: SocketAddr,
    stream: Option<TcpStream>,
    request: String,
    pub requests_sent: usize,
    pub responses_received: usize,
}

impl Client {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        name: S1,
        address: SocketAddr,
        request: S2,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            stream: None,
            request: request.into(),
            requests_sent: 0,
            responses_received: 0,
        }
    }

    pub fn set_request<S: Into<String>>(&mut self, request: S) {
        self.request = request.into();
    }

    pub fn connect(&mut self) {
        let stream = TcpStream::connect(self.address).expect("could not connect to the proxy");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("could not set read timeout");
        self.stream = Some(stream);
    }

    fn stream(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("client is not connected")
    }

    pub fn send(&mut self) -> Option<usize> {
        let request = self.request.clone();
        self.send_raw(request.as_bytes())
    }

    pub fn send_raw(&mut self, data: &[u8]) -> Option<usize> {
        match self.stream().write_all(data) {
            Ok(()) => {
                self.requests_sent += 1;
                Some(data.len())
            }
            Err(e) => {
                println!("{} could not send: {}", self.name, e);
                None
            }
        }
    }

    /// Reads until a complete response arrived, the connection closed, or
    /// the read timeout expired
    pub fn receive(&mut self) -> Option<String> {
        let mut response = Vec::new();
        let mut buffer = [0u8; BUFFER_SIZE];
        loop {
            match self.stream().read(&mut buffer) {
                Ok(0) => break,
                Ok(size) => {
                    response.extend_from_slice(&buffer[..size]);
                    if response_complete(&response) {
                        break;
                    }
                }
                Err(e) => {
                    println!("{} could not receive: {}", self.name, e);
                    break;
                }
            }
        }

        if response.is_empty() {
            return None;
        }
        self.responses_received += 1;
        Some(String::from_utf8_lossy(&response).into_owned())
    }

    /// Reads exactly `size` bytes
    pub fn receive_exact(&mut self, size: usize) -> Option<Vec<u8>> {
        let mut data = vec![0u8; size];
        self.stream().read_exact(&mut data).ok()?;
        Some(data)
    }

    /// Whether the proxy closed the connection, waiting up to the read timeout
    pub fn is_closed(&mut self) -> bool {
        let mut buffer = [0u8; BUFFER_SIZE];
        match self.stream().read(&mut buffer) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
        }
    }
}
