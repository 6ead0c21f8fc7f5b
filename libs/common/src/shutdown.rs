//! Process stop signals

use std::fmt;
use std::future::{pending, Future};

use tracing::warn;

/// Signal that ended [`wait_for_shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        })
    }
}

/// Resolve on Ctrl+C, or SIGTERM where the platform has it
pub async fn wait_for_shutdown() -> ShutdownSignal {
    first_signal(interrupt(), terminate()).await
}

async fn first_signal(
    interrupt: impl Future<Output = ()>,
    terminate: impl Future<Output = ()>,
) -> ShutdownSignal {
    tokio::select! {
        () = interrupt => ShutdownSignal::Interrupt,
        () = terminate => ShutdownSignal::Terminate,
    }
}

/// Never resolves when the handler cannot be installed
async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler: {}", e);
        pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        },
        Err(e) => {
            warn!("SIGTERM handler: {}, Ctrl+C only", e);
            pending::<()>().await;
        },
    }
}

#[cfg(not(unix))]
async fn terminate() {
    pending::<()>().await;
}
