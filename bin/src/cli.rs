use clap::{Parser, Subcommand};

#[derive(Parser, PartialEq, Eq, Clone, Debug)]
#[command(author, version, about)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: SubCmd,
}

#[derive(Subcommand, PartialEq, Eq, Clone, Debug)]
pub enum SubCmd {
    #[command(name = "start", about = "launch the forward proxy")]
    Start {
        #[arg(short = 'c', long = "config", help = "path to the TOML configuration file")]
        config: Option<String>,
        #[arg(short = 'l', long = "listen", help = "address to listen on, overrides the file")]
        listen: Option<String>,
        #[arg(long = "log-level", help = "log level, overrides the file")]
        log_level: Option<String>,
    },
    #[command(name = "check-config", about = "validate a configuration file and print it")]
    CheckConfig {
        #[arg(short = 'c', long = "config", help = "path to the TOML configuration file")]
        config: String,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
