use std::{fmt, net::SocketAddr, path::PathBuf};

use clap::{Parser, ValueEnum};
use config::Config;

#[derive(Debug, Parser)]
#[command(name = "Gatekeeper", version, long_about = concat!("Gatekeeper v", env!("CARGO_PKG_VERSION")))]
pub struct Args {
    /// IP address on which the server will listen for incoming connections.
    /// Default: 127.0.0.1:8080
    #[arg(short, long, env = "GATEKEEPER_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "GATEKEEPER_CONFIG_PATH", default_value = "./gatekeeper.toml")]
    pub config: PathBuf,
    /// Set the logging level, this applies to every crate in the workspace.
    #[arg(long = "log", env = "GATEKEEPER_LOG", default_value_t = LogLevel::default())]
    pub log_level: LogLevel,
}

impl Args {
    pub fn config(&self) -> anyhow::Result<Config> {
        let config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            Config::default()
        };

        config.validate()?;

        Ok(config)
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogLevel {
    /// Disable logging.
    Off,
    /// Only log errors.
    Error,
    /// Log errors, and warnings.
    Warn,
    /// Log errors, warnings, and info messages.
    #[default]
    Info,
    /// Log errors, warnings, info, and debug messages.
    Debug,
    /// Log errors, warnings, info, debug, and trace messages.
    Trace,
}

impl LogLevel {
    /// A filter string scoped to this workspace's crates, `warn` everywhere
    /// else, mirroring the teacher's per-crate `EnvFilter` construction.
    pub fn filter(self) -> String {
        match self {
            LogLevel::Off => "off".to_string(),
            level => {
                format!("warn,gatekeeper={level},gateway={level},policy={level},store={level},concurrency={level},config={level}")
            }
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}
