//! Process-level signal and unhandled-error hooks, behind a trait so tests
//! never install real OS signal handlers.

use async_trait::async_trait;
use tracing::{error, info};

/// Abstracts the process-wide hooks the root lifecycle installs once the
/// backend reaches `Running`. The real implementation waits on OS signals
/// and calls `std::process::exit`; the no-op implementation (used whenever
/// `InitializerOptions::test_mode` is set) does neither.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Resolves when an interrupt, terminate, or pre-exit signal arrives.
    /// The caller is expected to run `stop()` and then exit the process.
    async fn wait_for_shutdown_signal(&self);

    /// Terminates the process with `code`. Called after `stop()` completes
    /// in response to a signal.
    fn exit(&self, code: i32);

    /// Logs an unhandled asynchronous error without terminating the
    /// process.
    fn report_unhandled_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        error!(error = %error, "unhandled asynchronous error");
    }
}

/// Installs real `tokio::signal` handlers for interrupt and terminate, and
/// exits the process via `std::process::exit`.
#[derive(Default)]
pub struct RealProcessHost;

#[async_trait]
impl ProcessHost for RealProcessHost {
    async fn wait_for_shutdown_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            tokio::select! {
                _ = interrupt.recv() => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c");
        }
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Never resolves and never exits. Used under test mode so integration
/// tests can drive `start`/`stop` without touching process-wide state.
#[derive(Default)]
pub struct NoopProcessHost;

#[async_trait]
impl ProcessHost for NoopProcessHost {
    async fn wait_for_shutdown_signal(&self) {
        std::future::pending::<()>().await;
    }

    fn exit(&self, _code: i32) {}

    fn report_unhandled_error(&self, _error: &(dyn std::error::Error + Send + Sync)) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_host_never_resolves_within_a_yield() {
        let host = NoopProcessHost;
        let resolved = tokio::select! {
            _ = host.wait_for_shutdown_signal() => true,
            _ = tokio::task::yield_now() => false,
        };
        assert!(!resolved);
    }
}
