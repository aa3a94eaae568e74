//! relais logs
//!
//! The engine logs through the `log` facade. This module provides the backend:
//! a small logger that formats one line per record and writes it to a target
//! chosen at startup (standard streams, a file, or a TCP/UDP/UNIX socket).

pub mod logs;

use std::net::AddrParseError;

pub use crate::logging::logs::*;

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("invalid log target {0}: {1}")]
    InvalidLogTarget(String, &'static str),
    #[error("invalid log target {0}: {1}")]
    InvalidSocketAddress(String, AddrParseError),
    #[error("invalid log level {0}")]
    InvalidLogLevel(String),
    #[error("could not open log file {0}: {1}")]
    OpenFile(String, std::io::Error),
    #[error("could not connect to TCP socket {0}: {1}")]
    TcpConnect(String, std::io::Error),
    #[error("could not create unbound UNIX datagram: {0}")]
    CreateUnixSocket(std::io::Error),
    #[error("could not connect to UNIX datagram {0}: {1}")]
    ConnectToUnixSocket(String, std::io::Error),
    #[error("could not bind to UDP socket: {0}")]
    UdpBind(std::io::Error),
    #[error("a logger is already installed")]
    AlreadyInstalled,
}
