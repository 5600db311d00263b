extern crate tcpdelay;

use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::{CommandFactory, Parser};
use log::error;

use tcpdelay::{ConfigError, LogLevel, PartialConfig, ProxyConfig};

/// Proxies TCP requests and delays everything that is relayed. Simply point the service to be tested to the proxy,
/// and the proxy to the dependency.
#[derive(Parser, Debug)]
#[command(name = "tcpdelay", version)]
struct Args {
    /// TOML file providing values for any of the options below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to accept connections on
    #[arg(long)]
    local_port: Option<u16>,

    /// Address to accept connections on [default: 0.0.0.0]
    #[arg(long)]
    listen_host: Option<String>,

    /// Host name or address of the dependency
    #[arg(long)]
    remote_host: Option<String>,

    /// Port of the dependency
    #[arg(long)]
    remote_port: Option<u16>,

    /// Delay in milliseconds applied to all communication [default: 0]
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Give up connecting to the dependency after this long, e.g. "3s"
    #[arg(long)]
    connect_timeout: Option<String>,

    /// One of debug, info, error [default: info]
    #[arg(long)]
    log_level: Option<LogLevel>,
}

impl Args {
    fn partial_config(&self) -> PartialConfig {
        PartialConfig {
            listen_host: self.listen_host.clone(),
            listen_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            delay_ms: self.delay_ms,
            connect_timeout: self.connect_timeout.clone(),
            log_level: self.log_level,
        }
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if exit_code(&e) == 0 => e.exit(),
        Err(e) => display_error_and_exit(&e),
    };
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => display_error_and_exit(&e),
    };
    init_logging(config.log_level);
    if let Err(e) = tcpdelay::run(&config) {
        error!("{}", e);
        process::exit(1);
    }
}

// Command line arguments take precedence over environment variables, which take precedence over the config file.
fn load_config(args: &Args) -> Result<ProxyConfig, ConfigError> {
    let from_file = match &args.config {
        Some(path) => PartialConfig::from_file(path)?,
        None => PartialConfig::default(),
    };
    let from_env = PartialConfig::from_env()?;
    args.partial_config().or(from_env).or(from_file).resolve()
}

// RUST_LOG, if set, overrides the configured level.
fn init_logging(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(log_level.level_filter())
        .parse_default_env()
        .init();
}

// --help and --version are printed by clap itself. Everything else is a usage error.
fn exit_code(e: &clap::Error) -> i32 {
    if e.use_stderr() { 1 } else { 0 }
}

fn display_error_and_exit<E>(e: &E) -> ! where E: fmt::Display {
    eprintln!("{}", e);
    eprintln!("{}", Args::command().render_usage());
    process::exit(1);
}
