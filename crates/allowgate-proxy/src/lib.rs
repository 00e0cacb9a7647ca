//! Allowgate Proxy - whitelisting HTTP/HTTPS forward proxy.
//!
//! Clients configure this as their HTTP and HTTPS proxy. Every request is
//! checked against the whitelist before anything leaves the machine.
//!
//! ## Features
//!
//! - Exact and subdomain matching against a hand-editable whitelist file
//! - Plain HTTP requests to whitelisted hosts are forwarded
//! - `CONNECT` tunnels to whitelisted hosts relay bytes untouched (no TLS
//!   interception)
//! - Denied hosts get a blocked page from which users can request access
//! - Every denied tunnel is written to an audit log
//!
//! ## Architecture
//!
//! ```text
//! Client → Proxy → Whitelist Check → Allowed?
//!                                      │
//!                    ┌─────────────────┴─────────────────┐
//!                    │ Yes                               │ No
//!                    ▼                                   ▼
//!         GET: forward upstream                  Blocked page
//!         CONNECT: relay bytes            (CONNECT: audit the denial)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use allowgate_proxy::{ProxyConfig, ProxyServer};
//!
//! # async fn example() -> allowgate_proxy::Result<()> {
//! let config = ProxyConfig::with_default_dir()?.with_port(3128);
//! let handle = ProxyServer::new(config)?.start().await?;
//! println!("listening on {}", handle.addr());
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

mod block_page;
mod error;
mod forward;
mod handler;
mod intake;
mod proxy;
pub mod request;
pub mod response;
mod shutdown;
pub mod tunnel;
mod whitelist;

pub use block_page::{BlockPage, DEFAULT_TEMPLATE, FALLBACK_MESSAGE};
pub use error::{ProxyError, Result};
pub use forward::Forwarder;
pub use handler::{HandlerConfig, ProxyHandler, BLOCK_PAGE_PATH};
pub use intake::{IntakeEndpoint, REQUEST_WHITELIST_PATH};
pub use proxy::{
    ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_SHUTDOWN_GRACE, DEFAULT_UPSTREAM_TIMEOUT,
};
pub use shutdown::{ShutdownListener, ShutdownSignal};
pub use tunnel::{parse_connect_target, relay, ConnectTarget, RelayEnd, RelaySummary};
pub use whitelist::{host_without_port, is_allowed, split_authority, Whitelist};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

