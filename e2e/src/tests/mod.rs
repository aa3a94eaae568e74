
use std::{
    net::{SocketAddr, TcpListener},
    panic,
    time::Duration,
};

use relais_command_lib::{config::Config, logging::setup_default_logging};
use relais_lib::server::{start, ServerHandle};

use crate::mock::{
    aggregator::{Aggregator, SimpleAggregator},
    async_backend::BackendHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Success,
    Fail,
    Undecided,
}

/// A port nothing listens on at the time of the call
pub fn provide_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|address| address.port())
        .expect("could not find a free port")
}

pub fn create_local_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], provide_port()))
}

/// Starts a proxy on an ephemeral port
pub fn setup_proxy(name: &str, keep_alive: Duration) -> ServerHandle {
    setup_default_logging();
    let config = Config {
        listen_address: "127.0.0.1:0".parse().expect("invalid address"),
        keep_alive_timeout: keep_alive,
        ..Config::default()
    };
    let handle = start(&config).expect("could not start the proxy");
    println!("{} proxy listening on {}", name, handle.local_address());
    handle
}

pub fn setup_backends(
    name: &str,
    count: usize,
    content: &str,
) -> Vec<BackendHandle<SimpleAggregator>> {
    (0..count)
        .map(|i| {
            BackendHandle::spawn_detached_backend(
                format!("{name}-BACKEND-{i}"),
                "127.0.0.1:0".parse().expect("invalid address"),
                SimpleAggregator::new(),
                BackendHandle::http_handler(format!("{content}{i}")),
            )
        })
        .collect()
}

/// Runs `test` up to `nb_tries` times, stopping at the first run that does
/// not succeed
pub fn repeat_until_error_or<F>(nb_tries: usize, description: &str, test: F) -> State
where
    F: Fn() -> State + panic::RefUnwindSafe,
{
    println!("{description}");
    for i in 0..nb_tries {
        let state = match panic::catch_unwind(&test) {
            Ok(state) => state,
            Err(_) => State::Fail,
        };
        match state {
            State::Success => {}
            State::Fail => {
                println!("------------------------------------------------------------------");
                println!("Test not successful after {i} iterations");
                return State::Fail;
            }
            State::Undecided => {
                println!("------------------------------------------------------------------");
                println!("Test undecided after {i} iterations");
                return State::Undecided;
            }
        }
    }
    println!("------------------------------------------------------------------");
    println!("Test successful after {nb_tries} iterations");
    State::Success
}
