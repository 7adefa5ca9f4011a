use clap::{Parser, Subcommand};

use crate::config::{Config, Protocol, Role};
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(subcommand)]
    pub mode: Mode,

    /// Local port the exposer dials, or the accessor forwards into.
    #[clap(long = "expose", default_value_t = 8080)]
    pub expose_port: u16,

    /// Local port the accessor listens on.
    #[clap(long = "listen", default_value_t = 5000)]
    pub listen_port: u16,

    #[clap(long, default_value = "tcp")]
    pub protocol: String,

    /// Raise the log filter to debug.
    #[clap(short, long)]
    pub verbose: bool,

    /// Surface benign disconnect diagnostics that are suppressed by default.
    #[clap(short = 'w', long)]
    pub warnings: bool,

    /// Emit single-line JSON log records instead of ANSI TTY output.
    #[clap(long)]
    pub json: bool,

    #[clap(long, env = "NATBRIDGE_SECRET", default_value = "")]
    pub secret: String,

    /// Loopback port for the read-only status endpoint; 0 disables it.
    #[clap(long = "status", default_value_t = 0)]
    pub status_port: u16,

    #[clap(long = "max-streams", default_value_t = 256)]
    pub max_streams: usize,

    #[clap(long, default_value_t = 0)]
    pub kbps: u64,

    #[clap(long = "tcp-retries", default_value_t = 5)]
    pub tcp_retries: u32,

    #[clap(long = "tcp-retry-delay", default_value_t = 500)]
    pub tcp_retry_delay_ms: u64,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Publish a local service on the discovery overlay.
    Exposer { bridge_id: String },
    /// Forward a remote exposer's service to a local port.
    Accessor { bridge_id: String },
    /// Load a full configuration from a JSON file.
    Config { path: String },
}

impl Cli {
    /// Resolves CLI flags (or a `config` subcommand) into a validated `Config`.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        if let Mode::Config { path } = &self.mode {
            return Config::load_file(path);
        }

        let (role, bridge_id) = match self.mode {
            Mode::Exposer { bridge_id } => (Role::Exposer, bridge_id),
            Mode::Accessor { bridge_id } => (Role::Accessor, bridge_id),
            Mode::Config { .. } => unreachable!("handled above"),
        };

        let protocol: Protocol = self.protocol.parse()?;

        let config = Config {
            role,
            bridge_id,
            protocol,
            exposed_port: self.expose_port,
            listen_port: self.listen_port,
            secret: self.secret,
            max_streams: self.max_streams,
            kbps: self.kbps,
            tcp_connect_retries: self.tcp_retries,
            tcp_retry_delay_ms: self.tcp_retry_delay_ms,
            handshake_timeout_ms: 10_000,
            expected_warnings: self.warnings,
            verbose: self.verbose,
            json: self.json,
            status_port: self.status_port,
        };
        config.validate()?;
        Ok(config)
    }
}
