//! Process-lifetime record of the boot sequence.
//!
//! One [`Lifecycle`] is created per plugin server and shared by every stage.
//! It owns the server state machine, the shutdown-cause latch, and an ordered
//! event log whose indices act as sequence numbers for ordering checks.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::handshake::HandshakeRecord;
use super::listener::Endpoint;
use super::shutdown::Signal;

/// Accept-loop state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Starting,
    Serving,
    Stopping,
    Stopped,
}

impl ServerState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// `Starting -> Stopped` is allowed for failures before the accept loop
    /// ever ran; every other transition is a single step forward.
    pub fn can_advance_to(self, next: ServerState) -> bool {
        matches!(
            (self, next),
            (ServerState::Starting, ServerState::Serving)
                | (ServerState::Serving, ServerState::Stopping)
                | (ServerState::Stopping, ServerState::Stopped)
                | (ServerState::Starting, ServerState::Stopped)
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Starting => "starting",
            ServerState::Serving => "serving",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why the plugin is shutting down. The first cause wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    Signal(Signal),
    ServerFailure(String),
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Signal(signal) => write!(f, "signal {}", signal),
            ShutdownCause::ServerFailure(reason) => write!(f, "server failure: {}", reason),
        }
    }
}

/// Entries in the lifecycle event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Bound(Endpoint),
    Registered(Vec<&'static str>),
    StateChanged(ServerState),
    HandshakeEmitted(HandshakeRecord),
    ShutdownLatched(ShutdownCause),
    /// A shutdown cause that arrived after another was already latched.
    TriggerIgnored(ShutdownCause),
}

#[derive(Debug)]
struct Inner {
    state: ServerState,
    services: Vec<&'static str>,
    handshake: Option<HandshakeRecord>,
    cause: Option<ShutdownCause>,
    events: Vec<LifecycleEvent>,
}

/// Shared lifecycle object for one plugin process.
#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ServerState::Starting,
                services: Vec::new(),
                handshake: None,
                cause: None,
                events: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.lock().state
    }

    /// Move to `next`. Returns `true` if the state changed.
    ///
    /// Re-requesting the current state is a silent no-op; anything else that
    /// is not a forward step is refused and logged.
    pub fn advance(&self, next: ServerState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == next {
            return false;
        }
        if !inner.state.can_advance_to(next) {
            warn!(
                "Refusing server state transition {} -> {}",
                inner.state, next
            );
            return false;
        }
        debug!("Server state {} -> {}", inner.state, next);
        inner.state = next;
        inner.events.push(LifecycleEvent::StateChanged(next));
        true
    }

    pub(crate) fn record_bound(&self, endpoint: &Endpoint) {
        self.inner
            .lock()
            .events
            .push(LifecycleEvent::Bound(endpoint.clone()));
    }

    pub(crate) fn record_registered(&self, services: &[&'static str]) {
        let mut inner = self.inner.lock();
        inner.services.extend_from_slice(services);
        inner
            .events
            .push(LifecycleEvent::Registered(services.to_vec()));
    }

    pub(crate) fn record_handshake(&self, record: &HandshakeRecord) {
        let mut inner = self.inner.lock();
        inner.handshake = Some(record.clone());
        inner
            .events
            .push(LifecycleEvent::HandshakeEmitted(record.clone()));
    }

    /// Latch `cause` if no cause is latched yet. Returns `true` if this call
    /// won; a losing cause is logged as ignored.
    pub fn latch(&self, cause: ShutdownCause) -> bool {
        let mut inner = self.inner.lock();
        if inner.cause.is_some() {
            inner.events.push(LifecycleEvent::TriggerIgnored(cause));
            return false;
        }
        inner.cause = Some(cause.clone());
        inner.events.push(LifecycleEvent::ShutdownLatched(cause));
        true
    }

    pub fn shutdown_cause(&self) -> Option<ShutdownCause> {
        self.inner.lock().cause.clone()
    }

    pub fn registered_services(&self) -> Vec<&'static str> {
        self.inner.lock().services.clone()
    }

    pub fn handshake(&self) -> Option<HandshakeRecord> {
        self.inner.lock().handshake.clone()
    }

    /// Snapshot of the event log in the order events happened.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.inner.lock().events.clone()
    }

    /// Sequence number of the first event matching `pred`.
    pub fn position(&self, pred: impl Fn(&LifecycleEvent) -> bool) -> Option<usize> {
        self.inner.lock().events.iter().position(pred)
    }
}
