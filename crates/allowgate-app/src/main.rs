//! Allowgate - whitelisting HTTP/HTTPS forward proxy.
//!
//! Runs the proxy (the default) or manages the whitelist:
//!
//! ```text
//! allowgate serve --port 8080
//! allowgate allow crates.io
//! allowgate list
//! allowgate blocked
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use allowgate_app::{commands, control};
use allowgate_proxy::{ProxyConfig, ProxyServer, DEFAULT_PROXY_PORT};
use allowgate_storage::DataDir;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Allowgate - whitelisting HTTP/HTTPS forward proxy
#[derive(Parser, Debug)]
#[command(name = "allowgate", version, about)]
struct Args {
    /// Directory holding the whitelist, blocked page and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy (default)
    Serve(ServeArgs),
    /// Add a domain (and its subdomains) to the whitelist
    Allow { domain: String },
    /// Remove a domain from the whitelist
    Remove { domain: String },
    /// List whitelisted domains
    List,
    /// List domains that were denied a tunnel
    Blocked,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Interface to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Upstream connect and idle-read timeout in seconds (0 disables it)
    #[arg(long, default_value_t = 30)]
    upstream_timeout_secs: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROXY_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            upstream_timeout_secs: 30,
        }
    }
}

/// Initialize logging to the console and, when possible, a daily log file.
fn init_logging(args: &Args, data_dir: &DataDir) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "allowgate={0},allowgate_app={0},allowgate_proxy={0},allowgate_storage={0},warn",
            log_level
        ))
    });

    let log_dir = data_dir.logs_dir();
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(7)
            .filename_prefix("allowgate")
            .filename_suffix("log")
            .build(&log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::debug!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Runs the proxy until a stop command or Ctrl-C, then waits for the port.
async fn serve(data_dir: DataDir, args: ServeArgs) -> anyhow::Result<()> {
    let upstream_timeout =
        (args.upstream_timeout_secs > 0).then(|| Duration::from_secs(args.upstream_timeout_secs));

    let config = ProxyConfig::new(data_dir)
        .with_addr(SocketAddr::new(args.bind, args.port))
        .with_upstream_timeout(upstream_timeout);

    let server = ProxyServer::new(config).context("Failed to prepare data directory")?;
    let handle = server.start().await.context("Failed to start proxy")?;
    let addr = handle.addr();

    tracing::info!(
        "Proxy running on port {}. Type 'stop' or 'exit' to shut down.",
        addr.port()
    );

    let shutdown = handle.shutdown_signal();
    control::spawn_stdin_listener(shutdown.clone());
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received");
                shutdown.trigger();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    handle.wait().await;

    tracing::info!("Waiting for port {} to be released", addr.port());
    if control::wait_for_port_release(
        addr,
        control::PORT_RELEASE_TIMEOUT,
        control::PORT_RELEASE_POLL,
    )
    .await
    {
        tracing::info!("Port {} released", addr.port());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = match &args.data_dir {
        Some(path) => DataDir::new(path),
        None => DataDir::with_default_dir().context("Failed to locate data directory")?,
    };

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_logging(&args, &data_dir);
    tracing::debug!("Args: {:?}", args);

    let mut stdout = std::io::stdout();
    match args.command {
        None => serve(data_dir, ServeArgs::default()).await?,
        Some(Command::Serve(serve_args)) => serve(data_dir, serve_args).await?,
        Some(Command::Allow { domain }) => commands::allow(&data_dir, &domain, &mut stdout)?,
        Some(Command::Remove { domain }) => commands::remove(&data_dir, &domain, &mut stdout)?,
        Some(Command::List) => commands::list(&data_dir, &mut stdout)?,
        Some(Command::Blocked) => commands::blocked(&data_dir, &mut stdout)?,
    }

    tracing::debug!("Allowgate exiting");
    Ok(())
}
