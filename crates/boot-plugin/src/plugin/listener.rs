//! Listener acquisition.
//!
//! The parent discovers the port from the handshake, so callers bind a
//! wildcard port and read the resolved address back from the [`Endpoint`].
//! Bind failures are fatal: an unbindable loopback port means the host is
//! broken, so there is no retry.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, warn};

use super::handshake::NetworkFamily;
use crate::error::{Error, Result};

/// Default bind address: loopback, kernel-assigned port.
pub const LOOPBACK_WILDCARD: &str = "127.0.0.1:0";

/// What to bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub family: NetworkFamily,
    /// `host:port` for tcp, a socket path for unix (empty picks a temp path).
    pub address: String,
}

impl BindSpec {
    pub fn new(family: NetworkFamily, address: impl Into<String>) -> Self {
        Self {
            family,
            address: address.into(),
        }
    }

    /// Loopback tcp with an ephemeral port.
    pub fn loopback_tcp() -> Self {
        Self::new(NetworkFamily::Tcp, LOOPBACK_WILDCARD)
    }

    /// Unix socket at a generated temp path.
    pub fn unix_temp() -> Self {
        Self::new(NetworkFamily::Unix, "")
    }

    fn bind_error(&self, source: std::io::Error) -> Error {
        Error::Bind {
            family: self.family,
            address: self.address.clone(),
            source,
        }
    }
}

impl Default for BindSpec {
    fn default() -> Self {
        Self::loopback_tcp()
    }
}

/// A bound, resolved listener address. Immutable once acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    family: NetworkFamily,
    address: String,
}

impl Endpoint {
    pub fn family(&self) -> NetworkFamily {
        self.family
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Socket address for tcp endpoints.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.family {
            NetworkFamily::Tcp => self.address.parse().ok(),
            NetworkFamily::Unix => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.family, self.address)
    }
}

/// The accepting half of an acquired listener.
pub enum Incoming {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Removes a unix socket file once the listener is released.
#[derive(Debug)]
pub struct SocketFileGuard {
    path: PathBuf,
}

impl SocketFileGuard {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed socket file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove socket file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// A bound listener plus its resolved endpoint.
pub struct AcquiredListener {
    pub endpoint: Endpoint,
    pub incoming: Incoming,
    pub socket_file: Option<SocketFileGuard>,
}

/// Bind the listener described by `spec`.
pub async fn acquire(spec: &BindSpec) -> Result<AcquiredListener> {
    match spec.family {
        NetworkFamily::Tcp => acquire_tcp(spec).await,
        NetworkFamily::Unix => acquire_unix(spec),
    }
}

async fn acquire_tcp(spec: &BindSpec) -> Result<AcquiredListener> {
    let addr: SocketAddr = spec.address.parse().map_err(|e| {
        spec.bind_error(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid socket address: {}", e),
        ))
    })?;

    if addr.port() != 0 {
        warn!(
            "Binding fixed port {}; parents normally expect an ephemeral port",
            addr.port()
        );
    }

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| spec.bind_error(e))?;
    let local_addr = listener.local_addr().map_err(|e| spec.bind_error(e))?;

    Ok(AcquiredListener {
        endpoint: Endpoint {
            family: NetworkFamily::Tcp,
            address: local_addr.to_string(),
        },
        incoming: Incoming::Tcp(listener),
        socket_file: None,
    })
}

#[cfg(unix)]
fn acquire_unix(spec: &BindSpec) -> Result<AcquiredListener> {
    let path = if spec.address.is_empty() {
        temp_socket_path()
    } else {
        PathBuf::from(&spec.address)
    };
    bind_unix_path(spec, path)
}

#[cfg(unix)]
fn bind_unix_path(spec: &BindSpec, path: PathBuf) -> Result<AcquiredListener> {
    // The handshake must name exactly the path that was bound.
    let address = path
        .to_str()
        .ok_or_else(|| {
            spec.bind_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("socket path {} is not valid UTF-8", path.display()),
            ))
        })?
        .to_string();
    let listener = UnixListener::bind(&path).map_err(|e| spec.bind_error(e))?;

    Ok(AcquiredListener {
        endpoint: Endpoint {
            family: NetworkFamily::Unix,
            address,
        },
        incoming: Incoming::Unix(listener),
        socket_file: Some(SocketFileGuard { path }),
    })
}

#[cfg(not(unix))]
fn acquire_unix(spec: &BindSpec) -> Result<AcquiredListener> {
    Err(spec.bind_error(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unix sockets are not supported on this platform",
    )))
}

#[cfg(unix)]
fn temp_socket_path() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!(
        "boot-plugin-{}-{:08x}.sock",
        std::process::id(),
        nanos
    ))
}
