//! Common error types for boot plugin processes.

use thiserror::Error;

use crate::plugin::NetworkFamily;

/// Error type for the plugin boot sequence.
///
/// Everything up to and including [`Error::Handshake`] happens before the
/// handshake line reaches the parent; [`Error::Serve`] only occurs after it.
#[derive(Error, Debug)]
pub enum Error {
    /// The listener could not be acquired
    #[error("failed to bind {family} listener on '{address}': {source}")]
    Bind {
        family: NetworkFamily,
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A required service could not be attached to the server
    #[error("service registration failed: {0}")]
    Registration(String),

    /// Termination signal handlers could not be installed
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    /// The handshake line could not be written or flushed
    #[error("failed to emit handshake: {0}")]
    Handshake(#[source] std::io::Error),

    /// The accept loop cannot continue
    #[error("grpc server failed: {0}")]
    Serve(String),

    /// gRPC transport error
    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias using the boot plugin Error.
pub type Result<T> = std::result::Result<T, Error>;
