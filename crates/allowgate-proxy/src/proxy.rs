//! Proxy server.
//!
//! Binds the listening socket, accepts connections and serves each one on
//! its own task. Shutdown stops the accept loop, lets open connections
//! finish for a grace period, then aborts whatever is left.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use allowgate_storage::{AuditLog, DataDir, DomainSource, RequestIntake, WhitelistStore};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::block_page::BlockPage;
use crate::error::{ProxyError, Result};
use crate::forward::Forwarder;
use crate::handler::{HandlerConfig, ProxyHandler};
use crate::shutdown::{ShutdownListener, ShutdownSignal};
use crate::tunnel::POLL_INTERVAL;
use crate::whitelist::Whitelist;
use crate::DEFAULT_PROXY_PORT;

/// Default bound on connecting upstream and on each wait for upstream bytes.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time open connections get to finish after shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pending connections the kernel queues before `accept`.
const LISTEN_BACKLOG: i32 = 128;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Where the whitelist, blocked page and logs live.
    pub data_dir: DataDir,
    /// Bound on upstream connects and on idle reads while forwarding plain
    /// HTTP. `None` disables it.
    pub upstream_timeout: Option<Duration>,
    /// How often idle tunnels re-check for shutdown.
    pub poll_interval: Duration,
    /// How long open connections may run on after shutdown.
    pub shutdown_grace: Duration,
}

impl ProxyConfig {
    /// Creates a configuration listening on all interfaces on the default port.
    pub fn new(data_dir: DataDir) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROXY_PORT)),
            data_dir,
            upstream_timeout: Some(DEFAULT_UPSTREAM_TIMEOUT),
            poll_interval: POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Creates a configuration using the platform data directory.
    pub fn with_default_dir() -> Result<Self> {
        Ok(Self::new(DataDir::with_default_dir()?))
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port, keeping the configured interface.
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Sets the upstream timeout.
    pub fn with_upstream_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Sets the tunnel poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Whitelisting forward proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    whitelist: Whitelist,
}

impl ProxyServer {
    /// Creates a proxy server, preparing its data directory.
    ///
    /// The whitelist is read from the data directory's `whitelist.json`.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.data_dir.ensure()?;
        BlockPage::open(&config.data_dir).ensure_template()?;

        let store = WhitelistStore::open(&config.data_dir);
        Ok(Self {
            whitelist: Whitelist::new(Arc::new(store)),
            config,
        })
    }

    /// Checks hosts against `source` instead of the whitelist file.
    pub fn with_whitelist_source(mut self, source: Arc<dyn DomainSource>) -> Self {
        self.whitelist = Whitelist::new(source);
        self
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Runs the proxy until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("Interrupt received");
        handle.stop().await;
        Ok(())
    }

    /// Binds the listener and serves in the background.
    ///
    /// Returns a handle that can be used to stop the server. Failing to bind
    /// is the only fatal error.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = bind(self.config.addr)?;
        let addr = listener.local_addr()?;

        let shutdown = ShutdownSignal::new();
        let data_dir = &self.config.data_dir;

        let mut handler_config = HandlerConfig::new(
            self.whitelist,
            Arc::new(AuditLog::open(data_dir)),
            BlockPage::open(data_dir),
            Arc::new(RequestIntake::open(data_dir)),
            Forwarder::new(self.config.upstream_timeout)?,
            shutdown.subscribe(),
        );
        handler_config.connect_timeout = self.config.upstream_timeout;
        handler_config.poll_interval = self.config.poll_interval;

        let handler = ProxyHandler::new(handler_config);

        tracing::info!("Proxy listening on {}", addr);
        tracing::info!("Data directory: {:?}", data_dir.root());

        let handle = tokio::spawn(accept_loop(
            listener,
            handler,
            shutdown.subscribe(),
            self.config.shutdown_grace,
        ));

        Ok(ProxyHandle {
            shutdown,
            addr,
            handle,
        })
    }
}

/// Binds a listener with `SO_REUSEADDR` so a restart does not trip over
/// sockets lingering in `TIME_WAIT`.
fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |e| ProxyError::Bind(addr, e);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

async fn accept_loop(
    listener: TcpListener,
    handler: ProxyHandler,
    mut shutdown: ShutdownListener,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    connections.spawn(async move {
                        if let Err(e) = handler.handle(stream, peer).await {
                            tracing::error!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    // Usually descriptor exhaustion; back off instead of spinning.
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    tracing::error!("Connection task failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    tracing::info!(
        "Stopped accepting; {} connection(s) still open",
        connections.len()
    );

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            "Aborting {} connection(s) still open after {:?}",
            connections.len(),
            grace
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    tracing::info!("Proxy server stopped");
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown: ShutdownSignal,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the signal that stops this proxy, for wiring to other triggers.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            tracing::error!("Proxy task failed: {}", e);
        }
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
