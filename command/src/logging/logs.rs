use std::{
    fs::{File, OpenOptions},
    io::{stderr, stdout, BufWriter, Write},
    net::{SocketAddr, TcpStream, UdpSocket},
    os::unix::net::UnixDatagram,
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use log::{LevelFilter, Log, Metadata, Record};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::logging::LogError;

/// Where the formatted log lines go
#[derive(Debug)]
pub enum LogTarget {
    Stdout,
    Stderr,
    File(Mutex<BufWriter<File>>),
    Tcp(Mutex<TcpStream>),
    Udp(UdpSocket, SocketAddr),
    Unix(UnixDatagram),
}

impl LogTarget {
    fn write_line(&self, line: &[u8]) {
        // a logger has nowhere to report its own failures, so they are dropped
        let _ = match self {
            LogTarget::Stdout => stdout().lock().write_all(line),
            LogTarget::Stderr => stderr().lock().write_all(line),
            LogTarget::File(file) => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                file.write_all(line).and_then(|_| file.flush())
            }
            LogTarget::Tcp(stream) => stream
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(line),
            LogTarget::Udp(socket, address) => socket.send_to(line, address).map(|_| ()),
            LogTarget::Unix(socket) => socket.send(line).map(|_| ()),
        };
    }

    fn flush(&self) {
        let _ = match self {
            LogTarget::Stdout => stdout().flush(),
            LogTarget::Stderr => stderr().flush(),
            LogTarget::File(file) => file.lock().unwrap_or_else(PoisonError::into_inner).flush(),
            LogTarget::Tcp(stream) => stream
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .flush(),
            LogTarget::Udp(..) | LogTarget::Unix(_) => Ok(()),
        };
    }
}

/// Parse a log target:
///
/// - `stdout`, `stderr`
/// - `file:///var/log/relais.log`
/// - `tcp://127.0.0.1:9000`, `udp://127.0.0.1:9000`
/// - `unix:///run/relais/log.sock`
pub fn target_from_str(target: &str) -> Result<LogTarget, LogError> {
    match target {
        "stdout" => return Ok(LogTarget::Stdout),
        "stderr" => return Ok(LogTarget::Stderr),
        _ => {}
    }

    if let Some(path) = target.strip_prefix("file://") {
        if path.is_empty() {
            return Err(LogError::InvalidLogTarget(
                target.to_owned(),
                "missing file path",
            ));
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|error| LogError::OpenFile(path.to_owned(), error))?;
        return Ok(LogTarget::File(Mutex::new(BufWriter::new(file))));
    }

    if let Some(address) = target.strip_prefix("tcp://") {
        let address = parse_address(target, address)?;
        let stream = TcpStream::connect(address)
            .map_err(|error| LogError::TcpConnect(target.to_owned(), error))?;
        return Ok(LogTarget::Tcp(Mutex::new(stream)));
    }

    if let Some(address) = target.strip_prefix("udp://") {
        let address = parse_address(target, address)?;
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(LogError::UdpBind)?;
        return Ok(LogTarget::Udp(socket, address));
    }

    if let Some(path) = target.strip_prefix("unix://") {
        let socket = UnixDatagram::unbound().map_err(LogError::CreateUnixSocket)?;
        socket
            .connect(path)
            .map_err(|error| LogError::ConnectToUnixSocket(path.to_owned(), error))?;
        return Ok(LogTarget::Unix(socket));
    }

    Err(LogError::InvalidLogTarget(
        target.to_owned(),
        "expected stdout, stderr, file://, tcp://, udp:// or unix://",
    ))
}

fn parse_address(target: &str, address: &str) -> Result<SocketAddr, LogError> {
    address
        .parse::<SocketAddr>()
        .map_err(|error| LogError::InvalidSocketAddress(target.to_owned(), error))
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LogError> {
    LevelFilter::from_str(level.trim()).map_err(|_| LogError::InvalidLogLevel(level.to_owned()))
}

pub struct Logger {
    tag: String,
    pid: u32,
    level: LevelFilter,
    target: LogTarget,
}

impl Logger {
    pub fn new(tag: &str, level: LevelFilter, target: LogTarget) -> Self {
        Logger {
            tag: tag.to_owned(),
            pid: std::process::id(),
            level,
            target,
        }
    }

    pub fn format(&self, record: &Record) -> String {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        format!(
            "{} {} {} {}\t{}\n",
            now,
            self.pid,
            self.tag,
            record.level(),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.target.write_line(self.format(record).as_bytes());
        }
    }

    fn flush(&self) {
        self.target.flush();
    }
}

/// Install the process-wide logger. Fails if one is already installed.
pub fn setup_logging(tag: &str, level: &str, target: &str) -> Result<(), LogError> {
    let level = parse_level(level)?;
    let target = target_from_str(target)?;
    log::set_boxed_logger(Box::new(Logger::new(tag, level, target)))
        .map_err(|_| LogError::AlreadyInstalled)?;
    log::set_max_level(level);
    Ok(())
}

/// Log to stdout at info level (or at the level in `RUST_LOG`), silently
/// keeping any logger that was installed before.
pub fn setup_default_logging() {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());
    let level = parse_level(&level).unwrap_or(LevelFilter::Info);
    if log::set_boxed_logger(Box::new(Logger::new("TEST", level, LogTarget::Stdout))).is_ok() {
        log::set_max_level(level);
    }
}
