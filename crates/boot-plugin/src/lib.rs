//! # Boot Plugin Host Library
//!
//! Boot sequence for an out-of-process gRPC plugin:
//! - **plugin**: listener acquisition, service registration, the stdout
//!   handshake, and lifecycle supervision until a signal or server failure
//! - **error**: common error type for every boot stage
//! - **tracing**: stderr logging setup with segment prefixes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use boot_plugin::plugin::{BindSpec, PluginServer};
//!
//! PluginServer::new("my-plugin", env!("CARGO_PKG_VERSION"))
//!     .bind(BindSpec::loopback_tcp())
//!     .serve(MyServiceServer::new(service), &[FILE_DESCRIPTOR_SET])
//!     .await?;
//! ```

pub mod error;
pub mod plugin;
pub mod tracing;

pub use error::{Error, Result};
