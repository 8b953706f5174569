//! Boot Code Plugin
//!
//! A gRPC plugin process that binds a loopback port, announces it to its
//! parent over the stdout handshake, and serves `bootcode.v1.BootCodePlugin`
//! until it receives SIGINT or SIGTERM.
//!
//! ## Module Structure
//!
//! - `config` - Command line and environment configuration
//! - `service` - gRPC service implementation
//! - `proto` - Generated protobuf types

pub mod config;
pub mod service;

pub mod proto {
    //! Compiled protobuf definitions for `bootcode.v1`.

    #![allow(clippy::derive_partial_eq_without_eq)]

    tonic::include_proto!("bootcode.v1");

    /// Encoded descriptors for the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("bootcode_descriptor");
}

pub use service::BootCodeService;

/// Application protocol version announced in the handshake.
pub const APP_PROTOCOL_VERSION: u32 = 1;
