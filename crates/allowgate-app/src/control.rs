//! Process control: the stdin stop command and waiting for the listening
//! port to become free again after shutdown.

use std::io::BufRead;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use allowgate_proxy::ShutdownSignal;

/// How long to wait for the port after shutdown.
pub const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(50);

/// How often the port is probed while waiting.
pub const PORT_RELEASE_POLL: Duration = Duration::from_secs(1);

/// Returns `true` for the lines that stop the proxy.
pub fn is_stop_command(line: &str) -> bool {
    let command = line.trim();
    command.eq_ignore_ascii_case("stop") || command.eq_ignore_ascii_case("exit")
}

/// Reads commands from `input` until a stop command or end of input.
///
/// End of input only stops listening; the proxy keeps running.
pub fn watch_commands<R: BufRead>(input: R, shutdown: &ShutdownSignal) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to read from stdin: {}", e);
                return;
            }
        };

        if is_stop_command(&line) {
            tracing::info!("Stop requested from stdin");
            shutdown.trigger();
            return;
        }

        if !line.trim().is_empty() {
            tracing::info!("Unknown command {:?}; type 'stop' or 'exit' to shut down", line.trim());
        }
    }

    tracing::debug!("Stdin closed; no longer listening for commands");
}

/// Watches stdin on a dedicated thread.
///
/// A plain thread rather than a blocking task: a read parked on stdin must
/// not hold up runtime shutdown.
pub fn spawn_stdin_listener(shutdown: ShutdownSignal) {
    let spawned = std::thread::Builder::new()
        .name("stdin-control".into())
        .spawn(move || watch_commands(std::io::stdin().lock(), &shutdown));

    if let Err(e) = spawned {
        tracing::warn!("Failed to start stdin listener: {}", e);
    }
}

/// Polls until `addr` can be bound again or `timeout` passes.
///
/// Returns `true` once the port is free.
pub async fn wait_for_port_release(addr: SocketAddr, timeout: Duration, poll: Duration) -> bool {
    let started = Instant::now();

    loop {
        match std::net::TcpListener::bind(addr) {
            Ok(probe) => {
                drop(probe);
                return true;
            }
            Err(e) => {
                if started.elapsed() >= timeout {
                    tracing::warn!("Port {} still busy after {:?}: {}", addr.port(), timeout, e);
                    return false;
                }
                tracing::debug!("Port {} not yet free: {}", addr.port(), e);
            }
        }

        tokio::time::sleep(poll).await;
    }
}
