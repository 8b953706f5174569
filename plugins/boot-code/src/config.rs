//! Plugin configuration from the command line and environment.

use std::time::Duration;

use boot_plugin::plugin::{BindSpec, NetworkFamily, LOOPBACK_WILDCARD};
use clap::{Parser, ValueEnum};
use tracing::Level;

/// Network family accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Network {
    Tcp,
    Unix,
}

impl From<Network> for NetworkFamily {
    fn from(network: Network) -> Self {
        match network {
            Network::Tcp => NetworkFamily::Tcp,
            Network::Unix => NetworkFamily::Unix,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "boot-code-plugin")]
#[command(about = "Boot code gRPC plugin")]
#[command(version)]
pub struct Args {
    /// Listener network family
    #[arg(long, value_enum, default_value = "tcp", env = "BOOT_PLUGIN_NETWORK")]
    pub network: Network,

    /// Listener address: host:port for tcp (port 0 picks one), a socket path
    /// for unix (empty picks a temp path)
    #[arg(short, long, env = "BOOT_PLUGIN_ADDRESS")]
    pub address: Option<String>,

    /// Application protocol version announced in the handshake
    #[arg(
        long,
        default_value_t = crate::APP_PROTOCOL_VERSION,
        env = "BOOT_PLUGIN_APP_PROTOCOL_VERSION"
    )]
    pub app_protocol_version: u32,

    /// Milliseconds in-flight calls get to finish after a shutdown signal
    #[arg(long, default_value_t = 10_000, env = "BOOT_PLUGIN_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: u64,

    /// Milliseconds to wait after starting the server before the handshake
    #[arg(long, default_value_t = 100, env = "BOOT_PLUGIN_SETTLE_DELAY_MS")]
    pub settle_delay_ms: u64,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BOOT_PLUGIN_LOG_LEVEL")]
    pub log_level: String,
}

impl Args {
    /// What to bind, with the family's default address when none is given.
    pub fn bind_spec(&self) -> BindSpec {
        let address = match (&self.address, self.network) {
            (Some(address), _) => address.clone(),
            (None, Network::Tcp) => LOOPBACK_WILDCARD.to_string(),
            (None, Network::Unix) => String::new(),
        };
        BindSpec::new(self.network.into(), address)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn log_level(&self) -> Level {
        match self.log_level.as_str() {
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}
