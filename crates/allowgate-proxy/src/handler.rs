//! Per-connection request dispatch.
//!
//! Each accepted connection carries exactly one request. The head is parsed
//! here and the request routed by method:
//!
//! - `CONNECT` opens (or refuses) a tunnel
//! - `GET` is forwarded when the host is whitelisted, otherwise answered
//!   with the blocked page
//! - `POST`, `HEAD` and `OPTIONS` serve the blocked page and the whitelist
//!   request endpoint
//!
//! Anything else gets a 404.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use allowgate_storage::{AuditLog, RequestIntake};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::block_page::BlockPage;
use crate::error::{ProxyError, Result};
use crate::forward::{upstream_url, Forwarder};
use crate::intake::{is_intake_path, preflight, IntakeEndpoint};
use crate::request::{read_body, read_head, RequestHead};
use crate::response::Response;
use crate::shutdown::ShutdownListener;
use crate::tunnel::{TunnelHandler, POLL_INTERVAL};
use crate::whitelist::{host_without_port, Whitelist};

/// Path the blocked page is served under.
pub const BLOCK_PAGE_PATH: &str = "/blocked.html";

/// How long a client may take to send its request head.
pub const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Substituted into the blocked page when the request names no host.
const UNKNOWN_HOST: &str = "unknown";

/// Everything a handler needs, shared by all connections.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub whitelist: Whitelist,
    pub audit: Arc<AuditLog>,
    pub block_page: BlockPage,
    pub intake: Arc<RequestIntake>,
    pub forwarder: Forwarder,
    /// Bound on opening tunnel origin connections.
    pub connect_timeout: Option<Duration>,
    /// How often idle tunnels re-check for shutdown.
    pub poll_interval: Duration,
    pub shutdown: ShutdownListener,
}

impl HandlerConfig {
    /// Builds a configuration with the default tunnel poll interval and no
    /// connect timeout.
    pub fn new(
        whitelist: Whitelist,
        audit: Arc<AuditLog>,
        block_page: BlockPage,
        intake: Arc<RequestIntake>,
        forwarder: Forwarder,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            whitelist,
            audit,
            block_page,
            intake,
            forwarder,
            connect_timeout: None,
            poll_interval: POLL_INTERVAL,
            shutdown,
        }
    }
}

/// Serves single-request connections.
#[derive(Debug, Clone)]
pub struct ProxyHandler {
    whitelist: Whitelist,
    block_page: BlockPage,
    forwarder: Forwarder,
    tunnel: TunnelHandler,
    intake: IntakeEndpoint,
}

impl ProxyHandler {
    pub fn new(config: HandlerConfig) -> Self {
        let tunnel = TunnelHandler::new(
            config.whitelist.clone(),
            config.audit,
            config.block_page.clone(),
            config.shutdown,
        )
        .with_connect_timeout(config.connect_timeout)
        .with_poll_interval(config.poll_interval);

        Self {
            whitelist: config.whitelist,
            block_page: config.block_page,
            forwarder: config.forwarder,
            tunnel,
            intake: IntakeEndpoint::new(config.intake),
        }
    }

    /// Reads one request from `stream` and answers it.
    ///
    /// Errors returned here are connection-level I/O failures; every
    /// protocol-level problem has already been answered on the wire.
    pub async fn handle<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = BufReader::new(stream);

        let head = match tokio::time::timeout(HEAD_READ_TIMEOUT, read_head(&mut client)).await {
            Ok(Ok(Some(head))) => head,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e @ (ProxyError::BadRequest(_) | ProxyError::HeadTooLarge(_)))) => {
                tracing::debug!("Bad request from {}: {}", peer, e);
                Response::bad_request(&e).write_to(&mut client).await?;
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::debug!("Timed out waiting for a request from {}", peer);
                return Ok(());
            }
        };

        tracing::debug!(
            peer = %peer,
            method = %head.method,
            target = %head.target,
            "Request"
        );

        let response = match head.method.as_str() {
            "CONNECT" => {
                self.tunnel.handle(&mut client, &head.target).await?;
                return Ok(());
            }
            "GET" => return self.handle_get(&head, &mut client).await,
            "POST" => self.handle_post(&head, &mut client).await?,
            "HEAD" if head.path().starts_with(BLOCK_PAGE_PATH) => Response::new(200, "OK")
                .header("Content-Type", "text/html; charset=utf-8")
                .head_only(),
            "OPTIONS" if is_intake_path(head.path()) => preflight(),
            _ => Response::not_found(),
        };

        response.write_to(&mut client).await?;
        Ok(())
    }

    /// Forwards a whitelisted `GET`, or answers with the blocked page.
    ///
    /// The whitelist is asked about the host of the URL that will be
    /// requested, never the raw header. A `Host` that is not a plain
    /// `host[:port]` gets a 400.
    async fn handle_get<C>(&self, head: &RequestHead, client: &mut C) -> Result<()>
    where
        C: AsyncWrite + Unpin,
    {
        let Some(authority) = head.host() else {
            tracing::info!("Blocked GET without a Host header");
            return self.write_block_page(UNKNOWN_HOST, client).await;
        };

        let url = match upstream_url(authority, head.path()) {
            Ok(url) => url,
            Err(e) => {
                tracing::info!("Rejected GET: {}", e);
                Response::bad_request(&e).write_to(client).await?;
                return Ok(());
            }
        };

        let host = url.host_str().map(host_without_port).unwrap_or_default();
        if !self.whitelist.check(host).await {
            tracing::info!("Blocked GET to {}", host);
            return self.write_block_page(host, client).await;
        }

        match self.forwarder.forward(head, url, client).await {
            Ok(_) => Ok(()),
            // The method did not parse for the upstream client.
            Err(e @ ProxyError::BadRequest(_)) => {
                Response::bad_request(&e).write_to(client).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn write_block_page<C>(&self, website: &str, client: &mut C) -> Result<()>
    where
        C: AsyncWrite + Unpin,
    {
        Response::html(self.block_page.render_or_fallback(website).await)
            .write_to(client)
            .await?;
        Ok(())
    }

    /// Routes a `POST` to the request endpoint or the blocked page.
    async fn handle_post<C>(&self, head: &RequestHead, client: &mut C) -> Result<Response>
    where
        C: AsyncRead + Unpin,
    {
        let path = head.path();

        if is_intake_path(path) {
            let body = match head.content_length() {
                Ok(len) => read_body(client, len).await,
                Err(e) => Err(e),
            };
            return Ok(match body {
                Ok(body) => self.intake.submit(&body).await,
                Err(e @ ProxyError::BadRequest(_)) => Response::bad_request(&e),
                Err(e) => return Err(e),
            });
        }

        if path.starts_with(BLOCK_PAGE_PATH) {
            let website = head.host().unwrap_or(UNKNOWN_HOST);
            return Ok(Response::html(
                self.block_page.render_or_fallback(website).await,
            ));
        }

        Ok(Response::not_found())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::shutdown::ShutdownSignal;
    use allowgate_storage::DataDir;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Fixture {
        temp_dir: TempDir,
        handler: ProxyHandler,
        _shutdown: ShutdownSignal,
    }

    fn fixture(allowed: &[&str]) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = DataDir::new(temp_dir.path());
        let block_page = BlockPage::open(&data_dir);
        std::fs::write(block_page.template_path(), "blocked {website}").unwrap();

        let domains: HashSet<String> = allowed.iter().map(|d| d.to_string()).collect();
        let shutdown = ShutdownSignal::new();
        let config = HandlerConfig::new(
            Whitelist::new(Arc::new(domains)),
            Arc::new(AuditLog::open(&data_dir)),
            block_page,
            Arc::new(RequestIntake::open(&data_dir)),
            Forwarder::new(Some(Duration::from_secs(5))).unwrap(),
            shutdown.subscribe(),
        );

        Fixture {
            temp_dir,
            handler: ProxyHandler::new(config),
            _shutdown: shutdown,
        }
    }

    /// Sends `request` and returns everything the handler wrote back.
    async fn exchange(handler: &ProxyHandler, request: &[u8]) -> String {
        let (client, mut peer_side) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let handler = handler.clone();
        let task = tokio::spawn(async move { handler.handle(client, peer).await });

        peer_side.write_all(request).await.unwrap();
        let mut response = Vec::new();
        peer_side.read_to_end(&mut response).await.unwrap();
        task.await.unwrap().unwrap();

        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn get_without_host_is_blocked() {
        let fixture = fixture(&["example.com"]);
        let text = exchange(&fixture.handler, b"GET / HTTP/1.1\r\n\r\n").await;

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("blocked unknown"));
    }

    #[tokio::test]
    async fn get_to_denied_host_is_blocked() {
        let fixture = fixture(&["example.com"]);
        let text = exchange(
            &fixture.handler,
            b"GET http://evil.com/ HTTP/1.1\r\nHost: evil.com\r\n\r\n",
        )
        .await;

        assert!(text.ends_with("blocked evil.com"));
    }

    #[tokio::test]
    async fn head_to_block_page_has_no_body() {
        let fixture = fixture(&[]);
        let text = exchange(&fixture.handler, b"HEAD /blocked.html HTTP/1.1\r\n\r\n").await;

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
    }

    #[tokio::test]
    async fn post_to_block_page_renders_it() {
        let fixture = fixture(&[]);
        let text = exchange(
            &fixture.handler,
            b"POST /blocked.html HTTP/1.1\r\nHost: evil.com\r\n\r\n",
        )
        .await;

        assert!(text.ends_with("blocked evil.com"));
    }

    #[tokio::test]
    async fn preflight_and_unknown_routes() {
        let fixture = fixture(&[]);

        let text = exchange(&fixture.handler, b"OPTIONS /request_whitelist HTTP/1.1\r\n\r\n").await;
        assert!(text.contains("Access-Control-Allow-Methods: POST, OPTIONS\r\n"));

        for request in [
            &b"OPTIONS /other HTTP/1.1\r\n\r\n"[..],
            b"HEAD /other HTTP/1.1\r\n\r\n",
            b"POST /other HTTP/1.1\r\n\r\n",
            b"DELETE / HTTP/1.1\r\n\r\n",
        ] {
            let text = exchange(&fixture.handler, request).await;
            assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", text);
        }
    }

    #[tokio::test]
    async fn submission_round_trip() {
        let fixture = fixture(&[]);
        let body = br#"{"domain":"docs.rs","description":"docs"}"#;
        let mut request = format!(
            "POST /request_whitelist HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);

        let text = exchange(&fixture.handler, &request).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(fixture
            .temp_dir
            .path()
            .join("whitelist_requests/docs_rs/approve_docs_rs.sh")
            .exists());
    }

    #[tokio::test]
    async fn malformed_submission_creates_nothing() {
        let fixture = fixture(&[]);
        let text = exchange(
            &fixture.handler,
            b"POST /request_whitelist HTTP/1.1\r\nContent-Length: 5\r\n\r\n{oops",
        )
        .await;

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!fixture.temp_dir.path().join("whitelist_requests").exists());
    }

    #[tokio::test]
    async fn malformed_head_is_400() {
        let fixture = fixture(&[]);
        let text = exchange(&fixture.handler, b"NONSENSE\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn denied_connect_gets_block_page() {
        let fixture = fixture(&[]);
        let text = exchange(
            &fixture.handler,
            b"CONNECT evil.com:443 HTTP/1.1\r\nHost: evil.com:443\r\n\r\n",
        )
        .await;

        assert!(text.ends_with("blocked evil.com"));
        let set = std::fs::read_to_string(
            fixture
                .temp_dir
                .path()
                .join("https_requests/simple_blocked_https.json"),
        )
        .unwrap();
        assert!(set.contains("evil.com"));
    }

    #[tokio::test]
    async fn smuggled_host_never_reaches_origin() {
        use tokio::net::TcpListener;

        // An origin that is not on the whitelist.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let fixture = fixture(&["allowed.test"]);

        for separator in ["/", "?", "#", "@"] {
            let request = format!(
                "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}{}.allowed.test\r\n\r\n",
                port, separator
            );
            let text = exchange(&fixture.handler, request.as_bytes()).await;
            assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", text);
        }

        let accepted =
            tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "origin was contacted");
    }

    #[tokio::test]
    async fn absolute_target_cannot_add_userinfo() {
        let fixture = fixture(&["allowed.test"]);
        let text = exchange(
            &fixture.handler,
            b"GET @127.0.0.1:9/ HTTP/1.1\r\nHost: allowed.test\r\n\r\n",
        )
        .await;

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", text);
    }
}
