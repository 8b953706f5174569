//! Termination signals as a shutdown event source.
//!
//! Signals are forwarded into a channel instead of being awaited in place, so
//! the supervisor can race them against the accept loop and still observe
//! duplicates that arrive while it is draining.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::tracing::prefix::PULSE_CLOSE;

/// Termination signals the plugin reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Interrupt => f.write_str("SIGINT"),
            Signal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Receiving side of the signal event source.
pub type SignalReceiver = mpsc::Receiver<Signal>;

/// Capacity of the signal channel. Signals beyond this while nobody is
/// reading are dropped; the first one is all that matters.
const SIGNAL_BUFFER: usize = 4;

/// Install SIGINT/SIGTERM handlers and forward deliveries into a channel.
///
/// Handlers are installed before this returns, so a signal sent right after
/// the handshake is never lost. Installation failure is reported as
/// [`Error::Signal`].
pub fn listen() -> Result<SignalReceiver> {
    let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt()).map_err(Error::Signal)?;
        let mut terminate = signal(SignalKind::terminate()).map_err(Error::Signal)?;

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    Some(()) = terminate.recv() => Signal::Terminate,
                    else => break,
                };
                if !forward(&tx, received) {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !forward(&tx, Signal::Interrupt) {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

/// Returns `false` once the receiver is gone.
fn forward(tx: &mpsc::Sender<Signal>, signal: Signal) -> bool {
    info!("{} Received {}", PULSE_CLOSE, signal);
    match tx.try_send(signal) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("Signal channel full, dropping {}", signal);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::Interrupt.to_string(), "SIGINT");
        assert_eq!(Signal::Terminate.to_string(), "SIGTERM");
    }

    #[test]
    fn test_forward_keeps_going_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward(&tx, Signal::Terminate));
        assert!(forward(&tx, Signal::Interrupt));
        assert_eq!(rx.try_recv().unwrap(), Signal::Terminate);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!forward(&tx, Signal::Terminate));
    }

    #[tokio::test]
    async fn test_listen_installs_handlers() {
        let mut rx = listen().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
