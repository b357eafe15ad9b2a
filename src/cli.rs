use clap::Parser;
use std::path::PathBuf;

/// gitglow: GitHub activity on an LED matrix
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML daemon config path (default: search standard locations)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Forget the stored device configuration and open the setup portal
    #[arg(long = "setup", default_value = "false")]
    pub setup: bool,

    /// Detach from the terminal after startup
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,
}
