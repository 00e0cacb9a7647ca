//! `CONNECT` tunnels.
//!
//! A permitted tunnel is a blind byte relay between the client and the
//! origin; bytes are never framed or inspected. A denied tunnel never opens
//! an origin socket; the denial is audited and the blocked page is sent
//! in place of the `200 Connection Established` line.

use std::sync::Arc;
use std::time::Duration;

use allowgate_storage::{AuditLog, RecordOutcome};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::block_page::BlockPage;
use crate::error::{ProxyError, Result};
use crate::response::{Response, CONNECTION_ESTABLISHED};
use crate::shutdown::ShutdownListener;
use crate::whitelist::{split_authority, Whitelist};

/// Port used when a `CONNECT` target names none.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Largest single read forwarded in either direction.
pub const RELAY_CHUNK_SIZE: usize = 4096;

/// Upper bound on how long the relay waits before re-checking shutdown.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The `host:port` a client asked to tunnel to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Parses a `CONNECT` request target.
///
/// Accepts `host`, `host:port` and `[v6addr]:port`. The port defaults to 443.
pub fn parse_connect_target(target: &str) -> Result<ConnectTarget> {
    let target = target.trim();
    let (host, port) = split_authority(target)
        .ok_or_else(|| ProxyError::BadRequest(format!("invalid CONNECT target: {}", target)))?;

    Ok(ConnectTarget {
        host: host.to_string(),
        port: port.unwrap_or(DEFAULT_TUNNEL_PORT),
    })
}

/// Why a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client closed its side.
    ClientClosed,
    /// The origin closed its side.
    OriginClosed,
    /// Reading from or writing to the client failed.
    ClientError,
    /// Reading from or writing to the origin failed.
    OriginError,
    /// The proxy is shutting down.
    Shutdown,
}

/// Byte counts and end reason of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
    pub end: RelayEnd,
}

/// Which side became readable, and what the read returned.
enum Readable {
    Client(std::io::Result<usize>),
    Origin(std::io::Result<usize>),
}

/// Relays bytes between `client` and `origin` until either side closes or
/// errors, or shutdown is signalled.
///
/// Takes ownership of `origin`; it is dropped, and so closed, before this
/// returns. The client stays with the caller.
pub async fn relay<C, O>(
    client: &mut C,
    mut origin: O,
    shutdown: &ShutdownListener,
    poll_interval: Duration,
) -> RelaySummary
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = [0u8; RELAY_CHUNK_SIZE];
    let mut origin_buf = [0u8; RELAY_CHUNK_SIZE];
    let mut client_to_origin = 0u64;
    let mut origin_to_client = 0u64;

    let end = loop {
        if shutdown.is_triggered() {
            break RelayEnd::Shutdown;
        }

        // Both reads are cancel-safe, so losing the race or timing out drops
        // no data.
        let ready = tokio::time::timeout(poll_interval, async {
            tokio::select! {
                n = client.read(&mut client_buf) => Readable::Client(n),
                n = origin.read(&mut origin_buf) => Readable::Origin(n),
            }
        })
        .await;

        match ready {
            Err(_) => continue,
            Ok(Readable::Client(Ok(0))) => break RelayEnd::ClientClosed,
            Ok(Readable::Client(Ok(n))) => {
                if let Err(e) = origin.write_all(&client_buf[..n]).await {
                    tracing::debug!("Tunnel write to origin failed: {}", e);
                    break RelayEnd::OriginError;
                }
                client_to_origin += n as u64;
            }
            Ok(Readable::Client(Err(e))) => {
                tracing::debug!("Tunnel read from client failed: {}", e);
                break RelayEnd::ClientError;
            }
            Ok(Readable::Origin(Ok(0))) => break RelayEnd::OriginClosed,
            Ok(Readable::Origin(Ok(n))) => {
                if let Err(e) = client.write_all(&origin_buf[..n]).await {
                    tracing::debug!("Tunnel write to client failed: {}", e);
                    break RelayEnd::ClientError;
                }
                origin_to_client += n as u64;
            }
            Ok(Readable::Origin(Err(e))) => {
                tracing::debug!("Tunnel read from origin failed: {}", e);
                break RelayEnd::OriginError;
            }
        }
    };

    drop(origin);

    RelaySummary {
        client_to_origin,
        origin_to_client,
        end,
    }
}

/// What a `CONNECT` request led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// The target could not be parsed; a 400 was sent.
    Rejected,
    /// The host is not whitelisted; the blocked page was sent.
    Denied(RecordOutcome),
    /// The origin could not be reached; a 500 was sent.
    Unreachable,
    /// The tunnel was opened and has since closed.
    Relayed(RelaySummary),
}

/// Handles `CONNECT` requests.
#[derive(Debug, Clone)]
pub struct TunnelHandler {
    whitelist: Whitelist,
    audit: Arc<AuditLog>,
    block_page: BlockPage,
    connect_timeout: Option<Duration>,
    shutdown: ShutdownListener,
    poll_interval: Duration,
}

impl TunnelHandler {
    pub fn new(
        whitelist: Whitelist,
        audit: Arc<AuditLog>,
        block_page: BlockPage,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            whitelist,
            audit,
            block_page,
            connect_timeout: None,
            shutdown,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Bounds how long opening the origin connection may take.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets how often an idle relay re-checks for shutdown.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Serves one `CONNECT` request for `target`.
    ///
    /// `client` must be positioned just past the request head; anything it
    /// already buffered is the start of the tunnelled stream.
    pub async fn handle<C>(&self, client: &mut C, target: &str) -> Result<TunnelOutcome>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let target = match parse_connect_target(target) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!("Rejecting CONNECT: {}", e);
                Response::bad_request(&e).write_to(client).await?;
                return Ok(TunnelOutcome::Rejected);
            }
        };

        let host = target.host.to_ascii_lowercase();

        if !self.whitelist.check(&host).await {
            tracing::info!("Blocked CONNECT to {}", host);

            let audit = Arc::clone(&self.audit);
            let domain = host.clone();
            let recorded = tokio::task::spawn_blocking(move || audit.record_denial(&domain))
                .await
                .unwrap_or_default();

            Response::html(self.block_page.render_or_fallback(&host).await)
                .write_to(client)
                .await?;
            return Ok(TunnelOutcome::Denied(recorded));
        }

        let origin = match self.connect(&target).await {
            Ok(origin) => origin,
            Err(e) => {
                tracing::warn!("Failed to reach {}:{}: {}", target.host, target.port, e);
                Response::internal_error(&e).write_to(client).await?;
                return Ok(TunnelOutcome::Unreachable);
            }
        };

        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;
        tracing::info!("Tunnel open to {}:{}", host, target.port);

        let summary = relay(client, origin, &self.shutdown, self.poll_interval).await;

        tracing::debug!(
            host = %host,
            up = summary.client_to_origin,
            down = summary.origin_to_client,
            end = ?summary.end,
            "Tunnel closed"
        );

        Ok(TunnelOutcome::Relayed(summary))
    }

    async fn connect(&self, target: &ConnectTarget) -> std::io::Result<TcpStream> {
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", limit),
                )
            })?,
            None => connect.await,
        }
    }
}
