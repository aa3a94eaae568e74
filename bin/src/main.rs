#[cfg(feature = "jemallocator")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[macro_use]
extern crate log;

mod cli;

use std::process;

use nix::sys::signal::{SigSet, Signal};

use relais_command_lib::{
    config::{Config, ConfigError, FileConfig},
    logging::{setup_logging, LogError},
};
use relais_lib::{server, ServerError};

use crate::cli::SubCmd;

#[derive(thiserror::Error, Debug)]
enum StartError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("could not set up logging: {0}")]
    Logging(#[from] LogError),
    #[error("{0}")]
    Server(#[from] ServerError),
    #[error("could not handle signals: {0}")]
    Signal(#[from] nix::Error),
}

fn main() {
    let args = cli::parse();

    let result = match args.cmd {
        SubCmd::Start {
            config,
            listen,
            log_level,
        } => start(config, listen, log_level),
        SubCmd::CheckConfig { config } => check_config(&config),
    };

    if let Err(e) = result {
        eprintln!("relais: {}", e);
        process::exit(1);
    }
}

fn load_config(
    path: Option<&str>,
    listen: Option<String>,
    log_level: Option<String>,
) -> Result<Config, ConfigError> {
    let mut file_config = match path {
        Some(path) => FileConfig::load_from_path(path)?,
        None => FileConfig::default(),
    };
    if listen.is_some() {
        file_config.listen_address = listen;
    }
    if log_level.is_some() {
        file_config.log_level = log_level;
    }
    file_config.into_config()
}

fn check_config(path: &str) -> Result<(), StartError> {
    let config = load_config(Some(path), None, None)?;
    println!("{}", config);
    Ok(())
}

fn start(
    path: Option<String>,
    listen: Option<String>,
    log_level: Option<String>,
) -> Result<(), StartError> {
    let config = load_config(path.as_deref(), listen, log_level)?;
    setup_logging("MAIN", &config.log_level, &config.log_target)?;

    // blocked before the loop thread is spawned, so it inherits the mask
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block()?;

    let handle = server::start(&config)?;
    info!("relais listening on {}", handle.local_address());

    let signal = signals.wait()?;
    info!("received {}, stopping", signal);

    let metrics = handle.stop()?;
    info!("{}", metrics.dump());
    Ok(())
}
