//! Stdout handshake protocol.
//!
//! A plugin announces itself with exactly one line:
//!
//! ```text
//! <core-version>|<app-version>|<network>|<address>|<protocol>
//! 1|1|tcp|127.0.0.1:50051|grpc
//! ```
//!
//! The parent parses stdout as that single line, so nothing else may ever be
//! written there.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use thiserror::Error;

use crate::error::{Error, Result};

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Network family the plugin listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkFamily {
    Tcp,
    Unix,
}

impl NetworkFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkFamily::Tcp => "tcp",
            NetworkFamily::Unix => "unix",
        }
    }
}

impl fmt::Display for NetworkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkFamily {
    type Err = HandshakeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(NetworkFamily::Tcp),
            "unix" => Ok(NetworkFamily::Unix),
            other => Err(HandshakeParseError::UnknownNetwork(other.to_string())),
        }
    }
}

/// RPC protocol spoken over the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireProtocol {
    Grpc,
    NetRpc,
}

impl WireProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireProtocol::Grpc => "grpc",
            WireProtocol::NetRpc => "netrpc",
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireProtocol {
    type Err = HandshakeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "grpc" => Ok(WireProtocol::Grpc),
            "netrpc" => Ok(WireProtocol::NetRpc),
            other => Err(HandshakeParseError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Errors from parsing a handshake line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandshakeParseError {
    #[error("expected 5 pipe-delimited fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} version '{value}'")]
    Version { field: &'static str, value: String },

    #[error("unknown network family '{0}'")]
    UnknownNetwork(String),

    #[error("unknown wire protocol '{0}'")]
    UnknownProtocol(String),

    #[error("empty address")]
    EmptyAddress,
}

/// Everything the parent needs to connect to the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    pub core_version: u32,
    pub app_version: u32,
    pub network: NetworkFamily,
    pub address: String,
    pub protocol: WireProtocol,
}

impl HandshakeRecord {
    /// A gRPC handshake for the current core protocol version.
    pub fn grpc(app_version: u32, network: NetworkFamily, address: impl Into<String>) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            network,
            address: address.into(),
            protocol: WireProtocol::Grpc,
        }
    }
}

impl fmt::Display for HandshakeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.address, self.protocol
        )
    }
}

impl FromStr for HandshakeRecord {
    type Err = HandshakeParseError;

    /// Parse a handshake line. A single trailing newline is tolerated.
    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != 5 {
            return Err(HandshakeParseError::FieldCount(fields.len()));
        }

        let version = |field: &'static str, value: &str| {
            value.parse::<u32>().map_err(|_| HandshakeParseError::Version {
                field,
                value: value.to_string(),
            })
        };

        let address = fields[3];
        if address.is_empty() {
            return Err(HandshakeParseError::EmptyAddress);
        }

        Ok(Self {
            core_version: version("core", fields[0])?,
            app_version: version("app", fields[1])?,
            network: fields[2].parse()?,
            address: address.to_string(),
            protocol: fields[4].parse()?,
        })
    }
}

/// Writes the handshake line once.
///
/// `emit` consumes the emitter, so a second announcement cannot be written
/// through the same sink.
pub struct HandshakeEmitter<W: Write> {
    out: W,
}

impl<W: Write> HandshakeEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Write `record` plus a newline in a single write, then flush.
    ///
    /// Returns only after the flush so the parent never sees a line stuck in
    /// a buffer.
    pub fn emit(mut self, record: &HandshakeRecord) -> Result<()> {
        let line = format!("{}\n", record);
        self.out
            .write_all(line.as_bytes())
            .map_err(Error::Handshake)?;
        self.out.flush().map_err(Error::Handshake)?;
        Ok(())
    }
}
