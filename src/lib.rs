//! Device-mediation actor for the du Pont 2.5m telescope: TCS, scaling ring,
//! and M2 over line-oriented TCP connections to each controller, dispatched
//! from a single logical executor (spec.md 1, 5).

pub mod actor;
pub mod collimation;
pub mod config;
pub mod core;
pub mod devices;
pub mod error;
pub mod logging;
pub mod parser;

pub use actor::Actor;
pub use error::{ActorError, Result};

/// Wait for a shutdown signal: Ctrl+C, or SIGTERM on Unix. Mirrors the
/// teacher's `wait_for_shutdown` in `services/comsrv/src/lib.rs`.
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}; only Ctrl+C will work");
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
