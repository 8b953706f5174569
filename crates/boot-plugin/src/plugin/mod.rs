//! gRPC plugin boot infrastructure.
//!
//! Boot stages, in the order [`PluginServer`] runs them:
//! - `listener`: bind an ephemeral endpoint
//! - `registrar`: attach business, health and reflection services
//! - `handshake`: announce the endpoint on stdout, once
//! - `supervisor`: race termination signals against the accept loop
//! - `connection`: lets the supervisor close accepted connections at the
//!   drain deadline
//!
//! `lifecycle` records what happened and in which order.

mod connection;
mod handshake;
mod lifecycle;
mod listener;
mod registrar;
mod server;
mod shutdown;
mod supervisor;

pub use connection::{releasable, Releasable};
pub use handshake::{
    HandshakeEmitter, HandshakeParseError, HandshakeRecord, NetworkFamily, WireProtocol,
    CORE_PROTOCOL_VERSION,
};
pub use lifecycle::{Lifecycle, LifecycleEvent, ServerState, ShutdownCause};
pub use listener::{acquire, AcquiredListener, BindSpec, Endpoint, Incoming, LOOPBACK_WILDCARD};
pub use registrar::{
    register, GrpcService, Registered, HEALTH_SERVICE_NAME, REFLECTION_SERVICE_NAME,
    REFLECTION_V1ALPHA_SERVICE_NAME,
};
pub use server::{validate_bind, PluginServer, DEFAULT_SETTLE_DELAY};
pub use shutdown::{listen as shutdown_signals, Signal, SignalReceiver};
pub use supervisor::{
    DrainOutcome, RunningServer, ShutdownReport, StopSignal, Supervisor, DEFAULT_DRAIN_TIMEOUT,
};
