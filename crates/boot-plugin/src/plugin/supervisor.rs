//! Lifecycle supervision.
//!
//! The accept loop runs on its own task. The main path races termination
//! signals against that task finishing:
//!
//! - signal first: graceful stop, drain in-flight calls up to the drain
//!   horizon, then release the listener and every accepted connection.
//!   Exit status 0.
//! - accept loop first (error, panic, or an unrequested clean exit): the
//!   server can no longer serve, so there is no drain. Exit status non-zero.
//!
//! When both are ready at once the accept-loop exit is taken (`biased`
//! select). Either choice ends the process; the failure is the more
//! informative cause to report.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic_health::server::HealthReporter;
use tracing::{error, info, warn};

use super::lifecycle::{Lifecycle, ServerState, ShutdownCause};
use super::registrar::mark_not_serving;
use super::shutdown::SignalReceiver;
use crate::error::{Error, Result};
use crate::tracing::prefix::PULSE_CLOSE;

/// Default horizon for in-flight calls to finish after a graceful stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the accept loop gets to notice its connections closing after a
/// forced release before it is aborted.
const RELEASE_GRACE: Duration = Duration::from_millis(250);

/// Resolves when the supervisor asks the accept loop to stop.
///
/// Also resolves if the supervisor goes away, so the accept loop can never
/// outlive it waiting on a stop that will not come.
pub struct StopSignal {
    rx: oneshot::Receiver<()>,
    release: CancellationToken,
}

impl StopSignal {
    /// Token cancelled when accepted connections must close regardless of
    /// in-flight calls. Wrap connections with [`releasable`] to honour it.
    ///
    /// [`releasable`]: super::connection::releasable
    pub fn release_token(&self) -> CancellationToken {
        self.release.clone()
    }

    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// How the graceful stop ended. Resources are released either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// Connections were closed and the accept loop aborted after the drain
    /// horizon.
    DeadlineExceeded,
}

/// Result of a graceful shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cause: ShutdownCause,
    pub drain: DrainOutcome,
}

/// A spawned accept loop.
pub struct RunningServer {
    handle: JoinHandle<Result<()>>,
    stop: oneshot::Sender<()>,
    release: CancellationToken,
}

impl RunningServer {
    /// Whether the accept loop has already returned.
    pub fn has_exited(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Supervises one accept loop from spawn to `stopped`.
pub struct Supervisor {
    lifecycle: Arc<Lifecycle>,
    drain_timeout: Duration,
    health: Option<(HealthReporter, Vec<&'static str>)>,
}

impl Supervisor {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            lifecycle,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            health: None,
        }
    }

    /// Set the drain horizon for graceful stops.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Health entries to flip to NOT_SERVING when a graceful stop begins.
    pub fn health(mut self, reporter: HealthReporter, services: Vec<&'static str>) -> Self {
        self.health = Some((reporter, services));
        self
    }

    /// Spawn the accept loop and move to `serving`.
    ///
    /// `serve` receives the [`StopSignal`] it must honour for a graceful
    /// stop. Returning before that signal fires counts as a failure.
    pub fn start<F, Fut>(&self, serve: F) -> RunningServer
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (stop, rx) = oneshot::channel();
        let release = CancellationToken::new();
        let handle = tokio::spawn(serve(StopSignal {
            rx,
            release: release.clone(),
        }));
        self.lifecycle.advance(ServerState::Serving);
        RunningServer {
            handle,
            stop,
            release,
        }
    }

    /// Tear down an accept loop that must not be announced, e.g. because
    /// the handshake could not be written.
    pub async fn abandon(self, running: RunningServer) {
        self.lifecycle.advance(ServerState::Stopping);
        running.release.cancel();
        running.handle.abort();
        let _ = running.handle.await;
        self.lifecycle.advance(ServerState::Stopped);
    }

    /// Block until a signal or an accept-loop exit, then shut down.
    ///
    /// Returns the report for a signal-driven stop, or [`Error::Serve`] once
    /// the server has failed and been released.
    pub async fn run(
        mut self,
        running: RunningServer,
        mut signals: SignalReceiver,
    ) -> Result<ShutdownReport> {
        let RunningServer {
            mut handle,
            stop,
            release,
        } = running;

        let cause = tokio::select! {
            biased;

            exited = &mut handle => {
                let reason = failure_reason(exited);
                self.lifecycle.latch(ShutdownCause::ServerFailure(reason.clone()));
                error!("gRPC server failed: {}", reason);
                self.lifecycle.advance(ServerState::Stopping);
                release.cancel();
                self.lifecycle.advance(ServerState::Stopped);
                return Err(Error::Serve(reason));
            }
            Some(signal) = signals.recv() => ShutdownCause::Signal(signal),
        };

        self.lifecycle.latch(cause.clone());
        info!("{} Shutdown on {}, stopping gRPC server...", PULSE_CLOSE, cause);

        if let Some((mut reporter, services)) = self.health.take() {
            mark_not_serving(&mut reporter, &services).await;
        }
        self.lifecycle.advance(ServerState::Stopping);
        let _ = stop.send(());

        let drain = self.drain(&mut handle, &mut signals, &release).await;
        release.cancel();
        self.lifecycle.advance(ServerState::Stopped);

        match drain {
            DrainOutcome::Drained => info!("{} gRPC server stopped", PULSE_CLOSE),
            DrainOutcome::DeadlineExceeded => warn!(
                "{} gRPC server did not drain within {:?}, open connections were closed",
                PULSE_CLOSE, self.drain_timeout
            ),
        }

        Ok(ShutdownReport { cause, drain })
    }

    /// Wait for the stopped accept loop. At the drain horizon, close every
    /// accepted connection and abort the loop if it still has not returned.
    /// Signals arriving meanwhile are recorded and otherwise ignored.
    async fn drain(
        &self,
        handle: &mut JoinHandle<Result<()>>,
        signals: &mut SignalReceiver,
        release: &CancellationToken,
    ) -> DrainOutcome {
        let deadline = tokio::time::sleep(self.drain_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                exited = &mut *handle => {
                    match exited {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("gRPC server reported an error while draining: {}", e),
                        Err(e) => warn!("gRPC server task ended abnormally while draining: {}", e),
                    }
                    return DrainOutcome::Drained;
                }
                _ = &mut deadline => {
                    release.cancel();
                    if tokio::time::timeout(RELEASE_GRACE, &mut *handle).await.is_err() {
                        handle.abort();
                        let _ = (&mut *handle).await;
                    }
                    return DrainOutcome::DeadlineExceeded;
                }
                Some(signal) = signals.recv() => {
                    self.lifecycle.latch(ShutdownCause::Signal(signal));
                    info!("{} {} received while already shutting down, ignoring", PULSE_CLOSE, signal);
                }
            }
        }
    }
}

fn failure_reason(exited: std::result::Result<Result<()>, tokio::task::JoinError>) -> String {
    match exited {
        Ok(Ok(())) => "accept loop exited before shutdown was requested".to_string(),
        Ok(Err(Error::Serve(reason))) => reason,
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => "accept loop panicked".to_string(),
        Err(e) => format!("accept loop task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::lifecycle::LifecycleEvent;
    use crate::plugin::shutdown::Signal;
    use tokio::sync::mpsc;

    fn supervisor() -> (Supervisor, Arc<Lifecycle>) {
        let lifecycle = Arc::new(Lifecycle::new());
        let supervisor =
            Supervisor::new(lifecycle.clone()).drain_timeout(Duration::from_millis(500));
        (supervisor, lifecycle)
    }

    fn latched_causes(lifecycle: &Lifecycle) -> usize {
        lifecycle
            .events()
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::ShutdownLatched(_)))
            .count()
    }

    #[tokio::test]
    async fn test_signal_triggers_graceful_stop() {
        let (supervisor, lifecycle) = supervisor();
        let (tx, rx) = mpsc::channel(4);

        let running = supervisor.start(|stop| async move {
            stop.wait().await;
            Ok::<(), Error>(())
        });
        assert_eq!(lifecycle.state(), ServerState::Serving);

        tx.send(Signal::Terminate).await.unwrap();
        let report = supervisor.run(running, rx).await.unwrap();

        assert_eq!(report.cause, ShutdownCause::Signal(Signal::Terminate));
        assert_eq!(report.drain, DrainOutcome::Drained);
        assert_eq!(lifecycle.state(), ServerState::Stopped);
        assert_eq!(latched_causes(&lifecycle), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_fatal() {
        let (supervisor, lifecycle) = supervisor();
        let (_tx, rx) = mpsc::channel(4);

        let running = supervisor.start(|_stop| async move {
            Err(Error::Serve("listener closed".to_string()))
        });
        let err = supervisor.run(running, rx).await.unwrap_err();

        assert!(matches!(err, Error::Serve(ref reason) if reason.contains("listener closed")));
        assert_eq!(lifecycle.state(), ServerState::Stopped);
        assert!(matches!(
            lifecycle.shutdown_cause(),
            Some(ShutdownCause::ServerFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_unrequested_clean_exit_is_fatal() {
        let (supervisor, lifecycle) = supervisor();
        let (_tx, rx) = mpsc::channel(4);

        let running = supervisor.start(|_stop| async move { Ok::<(), Error>(()) });
        let err = supervisor.run(running, rx).await.unwrap_err();

        assert!(matches!(err, Error::Serve(_)));
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_panicking_accept_loop_is_fatal() {
        let (supervisor, _lifecycle) = supervisor();
        let (_tx, rx) = mpsc::channel(4);

        let running = supervisor.start(|_stop| async move {
            if true {
                panic!("accept loop blew up");
            }
            Ok::<(), Error>(())
        });
        let err = supervisor.run(running, rx).await.unwrap_err();
        assert!(matches!(err, Error::Serve(ref reason) if reason.contains("panicked")));
    }

    #[tokio::test]
    async fn test_simultaneous_triggers_record_one_cause() {
        let (supervisor, lifecycle) = supervisor();
        let (tx, rx) = mpsc::channel(4);

        let (failed_tx, failed_rx) = oneshot::channel::<()>();
        let running = supervisor.start(|_stop| async move {
            let _ = failed_tx.send(());
            Err(Error::Serve("transport broke".to_string()))
        });

        // Both the failure and the signal are ready before the race starts.
        failed_rx.await.unwrap();
        tokio::task::yield_now().await;
        tx.send(Signal::Interrupt).await.unwrap();

        let result = supervisor.run(running, rx).await;

        assert_eq!(latched_causes(&lifecycle), 1);
        match (result, lifecycle.shutdown_cause()) {
            (Err(Error::Serve(_)), Some(ShutdownCause::ServerFailure(_))) => {}
            (Ok(report), Some(cause @ ShutdownCause::Signal(_))) => assert_eq!(report.cause, cause),
            (result, cause) => panic!("inconsistent outcome {:?} / {:?}", result, cause),
        }
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_signal_during_drain_is_ignored() {
        let (supervisor, lifecycle) = supervisor();
        let (tx, rx) = mpsc::channel(4);

        let running = supervisor.start(|stop| async move {
            stop.wait().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<(), Error>(())
        });

        tx.send(Signal::Terminate).await.unwrap();
        let shutdown = tokio::spawn(supervisor.run(running, rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(Signal::Interrupt).await.unwrap();

        let report = shutdown.await.unwrap().unwrap();
        assert_eq!(report.cause, ShutdownCause::Signal(Signal::Terminate));
        assert_eq!(report.drain, DrainOutcome::Drained);
        assert_eq!(latched_causes(&lifecycle), 1);
        assert!(lifecycle
            .events()
            .contains(&LifecycleEvent::TriggerIgnored(ShutdownCause::Signal(
                Signal::Interrupt
            ))));
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_drain_deadline_forces_release() {
        let lifecycle = Arc::new(Lifecycle::new());
        let supervisor =
            Supervisor::new(lifecycle.clone()).drain_timeout(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel(4);

        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
        let running = supervisor.start(|stop| async move {
            // Holds a "connection" that never finishes.
            let _connection = DropNotify(Some(dropped_tx));
            stop.wait().await;
            std::future::pending::<Result<()>>().await
        });

        tx.send(Signal::Terminate).await.unwrap();
        let report = supervisor.run(running, rx).await.unwrap();

        assert_eq!(report.drain, DrainOutcome::DeadlineExceeded);
        assert_eq!(lifecycle.state(), ServerState::Stopped);
        dropped_rx.await.expect("accept loop resources released");
    }

    #[tokio::test]
    async fn test_drain_deadline_releases_connections() {
        let lifecycle = Arc::new(Lifecycle::new());
        let supervisor =
            Supervisor::new(lifecycle.clone()).drain_timeout(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel(4);

        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        let running = supervisor.start(|stop| {
            let release = stop.release_token();
            // Stands in for a connection task tonic spawned outside the
            // accept loop, so aborting the loop alone would not end it.
            tokio::spawn(async move {
                release.cancelled().await;
                let _ = closed_tx.send(());
            });
            async move {
                stop.wait().await;
                std::future::pending::<Result<()>>().await
            }
        });

        tx.send(Signal::Terminate).await.unwrap();
        let report = supervisor.run(running, rx).await.unwrap();

        assert_eq!(report.drain, DrainOutcome::DeadlineExceeded);
        tokio::time::timeout(Duration::from_secs(1), closed_rx)
            .await
            .expect("connection released at the deadline")
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_failure_releases_connections() {
        let (supervisor, _lifecycle) = supervisor();
        let (_tx, rx) = mpsc::channel(4);

        let (token_tx, token_rx) = oneshot::channel();
        let running = supervisor.start(|stop| {
            let _ = token_tx.send(stop.release_token());
            async move { Err(Error::Serve("listener closed".to_string())) }
        });
        let release = token_rx.await.unwrap();
        assert!(!release.is_cancelled());

        supervisor.run(running, rx).await.unwrap_err();
        assert!(release.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_signal_channel_waits_for_server() {
        let (supervisor, lifecycle) = supervisor();
        let (tx, rx) = mpsc::channel::<Signal>(4);
        drop(tx);

        let running = supervisor.start(|_stop| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(Error::Serve("gone".to_string()))
        });
        let err = supervisor.run(running, rx).await.unwrap_err();
        assert!(matches!(err, Error::Serve(_)));
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    struct DropNotify(Option<oneshot::Sender<()>>);

    impl Drop for DropNotify {
        fn drop(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(());
            }
        }
    }
}
