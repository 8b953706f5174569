//! Plugin server: runs the boot sequence end to end.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::TcpListenerStream;
#[cfg(unix)]
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::connection::releasable;
use super::handshake::{HandshakeEmitter, HandshakeRecord};
use super::lifecycle::{Lifecycle, ServerState};
use super::listener::{self, AcquiredListener, BindSpec, Incoming};
use super::registrar::{self, GrpcService, Registered};
use super::shutdown::{self, SignalReceiver};
use super::supervisor::{ShutdownReport, Supervisor, DEFAULT_DRAIN_TIMEOUT};
use crate::error::{Error, Result};
use crate::tracing::prefix;

/// Default pause between spawning the accept loop and announcing it.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Builder for plugin servers.
pub struct PluginServer {
    name: String,
    version: String,
    bind: BindSpec,
    app_protocol_version: u32,
    drain_timeout: Duration,
    settle_delay: Duration,
    lifecycle: Arc<Lifecycle>,
}

impl PluginServer {
    /// Create a new plugin server builder bound to loopback tcp.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            bind: BindSpec::loopback_tcp(),
            app_protocol_version: 1,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    /// Set what to bind.
    pub fn bind(mut self, spec: BindSpec) -> Self {
        self.bind = spec;
        self
    }

    /// Set the application protocol version announced in the handshake.
    pub fn app_protocol_version(mut self, version: u32) -> Self {
        self.app_protocol_version = version;
        self
    }

    /// Set how long in-flight calls may run after a graceful stop begins.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the advisory pause before the handshake. Zero disables it.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// The lifecycle record this server reports into.
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    /// Run the plugin: handshake on stdout, shutdown on SIGINT/SIGTERM.
    pub async fn serve<S>(self, service: S, descriptors: &[&'static [u8]]) -> Result<ShutdownReport>
    where
        S: GrpcService,
        S::Future: Send + 'static,
    {
        self.serve_with(service, descriptors, std::io::stdout(), shutdown::listen)
            .await
    }

    /// Run the plugin with an explicit handshake sink and signal source.
    ///
    /// Stages run strictly in order: bind, register, install signals, spawn
    /// the accept loop, settle, announce, then wait. A failure before the
    /// announcement writes nothing to `out`.
    pub async fn serve_with<S, W, I>(
        self,
        service: S,
        descriptors: &[&'static [u8]],
        out: W,
        install_signals: I,
    ) -> Result<ShutdownReport>
    where
        S: GrpcService,
        S::Future: Send + 'static,
        W: Write,
        I: FnOnce() -> Result<SignalReceiver>,
    {
        info!(
            "{} Starting {} v{}",
            prefix::PULSE_OPEN,
            self.name,
            self.version
        );

        let (acquired, registered, signals) =
            match self.prepare(service, descriptors, install_signals).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    error!("{} failed to start: {}", self.name, e);
                    self.lifecycle.advance(ServerState::Stopped);
                    return Err(e);
                }
            };

        let AcquiredListener {
            endpoint,
            incoming,
            socket_file,
        } = acquired;
        let Registered {
            router,
            health,
            services,
        } = registered;

        let supervisor = Supervisor::new(self.lifecycle.clone())
            .drain_timeout(self.drain_timeout)
            .health(health, services);

        let running = supervisor.start(move |stop| async move {
            let release = stop.release_token();
            match incoming {
                Incoming::Tcp(listener) => {
                    router
                        .serve_with_incoming_shutdown(
                            releasable(TcpListenerStream::new(listener), release),
                            stop.wait(),
                        )
                        .await?
                }
                #[cfg(unix)]
                Incoming::Unix(listener) => {
                    router
                        .serve_with_incoming_shutdown(
                            releasable(UnixListenerStream::new(listener), release),
                            stop.wait(),
                        )
                        .await?
                }
            }
            Ok(())
        });
        info!("  Address: {}", endpoint);

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        // An accept loop that died while settling is reported without ever
        // announcing it.
        if !running.has_exited() {
            let record = HandshakeRecord::grpc(
                self.app_protocol_version,
                endpoint.family(),
                endpoint.address(),
            );
            if let Err(e) = HandshakeEmitter::new(out).emit(&record) {
                error!("{} failed to announce: {}", self.name, e);
                supervisor.abandon(running).await;
                return Err(e);
            }
            self.lifecycle.record_handshake(&record);
        }

        let result = supervisor.run(running, signals).await;
        drop(socket_file);

        if result.is_ok() {
            info!(
                "{} {} shutdown complete",
                prefix::PULSE_CLOSE,
                self.name
            );
        }
        result
    }

    async fn prepare<S, I>(
        &self,
        service: S,
        descriptors: &[&'static [u8]],
        install_signals: I,
    ) -> Result<(AcquiredListener, Registered, SignalReceiver)>
    where
        S: GrpcService,
        S::Future: Send + 'static,
        I: FnOnce() -> Result<SignalReceiver>,
    {
        validate_bind(&self.bind)?;
        let acquired = listener::acquire(&self.bind).await?;
        self.lifecycle.record_bound(&acquired.endpoint);

        let registered = registrar::register(Server::builder(), service, descriptors).await?;
        self.lifecycle.record_registered(&registered.services);

        let signals = install_signals()?;
        Ok((acquired, registered, signals))
    }
}

/// Reject bind specs that cannot possibly be announced.
pub fn validate_bind(spec: &BindSpec) -> Result<()> {
    if spec.address.contains('|') || spec.address.contains('\n') {
        return Err(Error::Config(format!(
            "address '{}' cannot appear in a handshake line",
            spec.address
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::handshake::NetworkFamily;
    use crate::plugin::lifecycle::LifecycleEvent;
    use crate::plugin::registrar::test_support::StubService;
    use crate::plugin::shutdown::Signal;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Handshake sink shared with the test.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn test_server() -> PluginServer {
        PluginServer::new("test-plugin", "0.0.0")
            .settle_delay(Duration::ZERO)
            .drain_timeout(Duration::from_secs(2))
    }

    async fn wait_for_line(buf: &SharedBuf) -> String {
        for _ in 0..200 {
            let contents = buf.contents();
            if contents.ends_with('\n') {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no handshake line within 2s");
    }

    #[tokio::test]
    async fn test_serve_announces_after_registration() {
        let server = test_server();
        let lifecycle = server.lifecycle();
        let buf = SharedBuf::default();
        let (tx, rx) = mpsc::channel(4);

        let out = buf.clone();
        let task = tokio::spawn(async move {
            server
                .serve_with(StubService, &[], out, move || Ok(rx))
                .await
        });

        let line = wait_for_line(&buf).await;
        let record: HandshakeRecord = line.parse().unwrap();
        assert_eq!(record.network, NetworkFamily::Tcp);
        assert!(record.address.starts_with("127.0.0.1:"));
        assert_eq!(lifecycle.state(), ServerState::Serving);

        tx.send(Signal::Terminate).await.unwrap();
        let report = task.await.unwrap().unwrap();
        assert_eq!(lifecycle.state(), ServerState::Stopped);
        assert_eq!(report.cause.to_string(), "signal SIGTERM");

        let registered = lifecycle
            .position(|e| matches!(e, LifecycleEvent::Registered(_)))
            .unwrap();
        let serving = lifecycle
            .position(|e| *e == LifecycleEvent::StateChanged(ServerState::Serving))
            .unwrap();
        let announced = lifecycle
            .position(|e| matches!(e, LifecycleEvent::HandshakeEmitted(_)))
            .unwrap();
        let latched = lifecycle
            .position(|e| matches!(e, LifecycleEvent::ShutdownLatched(_)))
            .unwrap();
        assert!(registered < serving);
        assert!(serving < announced);
        assert!(announced < latched);

        assert_eq!(buf.contents().lines().count(), 1);
        assert_eq!(lifecycle.handshake(), Some(record));
    }

    #[tokio::test]
    async fn test_bind_failure_writes_nothing() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap();

        let server =
            test_server().bind(BindSpec::new(NetworkFamily::Tcp, taken.to_string()));
        let lifecycle = server.lifecycle();
        let buf = SharedBuf::default();
        let (_tx, rx) = mpsc::channel(1);

        let err = server
            .serve_with(StubService, &[], buf.clone(), move || Ok(rx))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Bind { .. }));
        assert!(buf.contents().is_empty());
        assert_eq!(lifecycle.state(), ServerState::Stopped);
        assert!(lifecycle.handshake().is_none());
    }

    #[tokio::test]
    async fn test_signal_install_failure_writes_nothing() {
        let server = test_server();
        let lifecycle = server.lifecycle();
        let buf = SharedBuf::default();

        let err = server
            .serve_with(StubService, &[], buf.clone(), || {
                Err(Error::Signal(std::io::Error::other("no signals here")))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Signal(_)));
        assert!(buf.contents().is_empty());
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_listener_released_after_shutdown() {
        let server = test_server();
        let buf = SharedBuf::default();
        let (tx, rx) = mpsc::channel(4);

        let out = buf.clone();
        let task = tokio::spawn(async move {
            server
                .serve_with(StubService, &[], out, move || Ok(rx))
                .await
        });

        let record: HandshakeRecord = wait_for_line(&buf).await.parse().unwrap();
        tokio::net::TcpStream::connect(&record.address).await.unwrap();

        tx.send(Signal::Interrupt).await.unwrap();
        task.await.unwrap().unwrap();

        assert!(tokio::net::TcpStream::connect(&record.address).await.is_err());
    }

    #[test]
    fn test_validate_bind_rejects_delimiters() {
        assert!(validate_bind(&BindSpec::loopback_tcp()).is_ok());
        let spec = BindSpec::new(NetworkFamily::Unix, "/tmp/a|b.sock");
        assert!(matches!(validate_bind(&spec), Err(Error::Config(_))));
    }
}
