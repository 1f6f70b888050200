//! Startup/shutdown hook registry with fire-once semantics.
//!
//! One [`Lifecycle`] instance backs the root phase; one more is created per
//! plugin. Hooks run sequentially: `startup` in registration order,
//! `shutdown` in reverse, so the last thing brought up is the first thing
//! torn down.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tracing::{instrument, warn};

use crate::error::{BoxError, InitError, Result};
use crate::logger::Logger;

pub type HookFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = std::result::Result<(), BoxError>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Done,
    Failed,
}

struct Hooks {
    startup: Vec<HookFn>,
    shutdown: Vec<HookFn>,
    startup_phase: Phase,
    shutdown_phase: Phase,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            startup: Vec::new(),
            shutdown: Vec::new(),
            startup_phase: Phase::Idle,
            shutdown_phase: Phase::Idle,
        }
    }
}

/// A named lifecycle: `"root"` for the process-wide instance, or a plugin id
/// for a per-plugin one. Used only for diagnostics.
///
/// # Examples
///
/// ```
/// use backend_init::Lifecycle;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let lifecycle = Lifecycle::new("my-plugin");
/// lifecycle.add_startup_hook(Arc::new(|| Box::pin(async { Ok(()) })));
/// lifecycle.startup().await.unwrap();
///
/// // a second startup() call is rejected; the phase only ever fires once.
/// assert!(lifecycle.startup().await.is_err());
/// # })
/// ```
pub struct Lifecycle {
    owner: String,
    logger: Option<Arc<dyn Logger>>,
    hooks: Mutex<Hooks>,
}

impl Lifecycle {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            logger: None,
            hooks: Mutex::new(Hooks::default()),
        }
    }

    /// Like [`Lifecycle::new`], but shutdown hook failures are reported
    /// through `logger` (§7, P5) instead of a bare `tracing::warn!`. Used by
    /// `builtin::lifecycle_service_factory` and `builtin::root_lifecycle_factory`.
    pub fn with_logger(owner: impl Into<String>, logger: Arc<dyn Logger>) -> Self {
        Self {
            owner: owner.into(),
            logger: Some(logger),
            hooks: Mutex::new(Hooks::default()),
        }
    }

    pub fn add_startup_hook(&self, hook: HookFn) {
        self.hooks.lock().unwrap().startup.push(hook);
    }

    pub fn add_shutdown_hook(&self, hook: HookFn) {
        self.hooks.lock().unwrap().shutdown.push(hook);
    }

    #[instrument(level = "debug", skip(self), fields(owner = %self.owner))]
    pub async fn startup(&self) -> Result<()> {
        let hooks = {
            let mut guard = self.hooks.lock().unwrap();
            if guard.startup_phase != Phase::Idle {
                return Err(InitError::LifecycleAlreadyInvoked { phase: "startup" });
            }
            guard.startup_phase = Phase::Running;
            guard.startup.clone()
        };

        for hook in &hooks {
            if let Err(err) = hook().await {
                self.hooks.lock().unwrap().startup_phase = Phase::Failed;
                return Err(InitError::LifecycleStartupFailed {
                    owner: self.owner.clone(),
                    source: err,
                });
            }
        }

        self.hooks.lock().unwrap().startup_phase = Phase::Done;
        Ok(())
    }

    /// Runs shutdown hooks in reverse registration order. Individual hook
    /// failures are logged and do not stop the remaining hooks from running,
    /// matching the best-effort cleanup policy (§7, P5).
    #[instrument(level = "debug", skip(self), fields(owner = %self.owner))]
    pub async fn shutdown(&self) -> Result<()> {
        let hooks = {
            let mut guard = self.hooks.lock().unwrap();
            if guard.shutdown_phase != Phase::Idle {
                return Err(InitError::LifecycleAlreadyInvoked { phase: "shutdown" });
            }
            guard.shutdown_phase = Phase::Running;
            let mut hooks = guard.shutdown.clone();
            hooks.reverse();
            hooks
        };

        for hook in &hooks {
            if let Err(err) = hook().await {
                match &self.logger {
                    Some(logger) => logger.error("shutdown hook failed", err.as_ref()),
                    None => warn!(owner = %self.owner, error = %err, "shutdown hook failed"),
                }
            }
        }

        self.hooks.lock().unwrap().shutdown_phase = Phase::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_hook(order: Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> HookFn {
        Arc::new(move || {
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push(label);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn startup_runs_in_order_shutdown_in_reverse() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let lifecycle = Lifecycle::new("root");
        lifecycle.add_startup_hook(recording_hook(order.clone(), "a"));
        lifecycle.add_startup_hook(recording_hook(order.clone(), "b"));
        lifecycle.add_shutdown_hook(recording_hook(order.clone(), "a"));
        lifecycle.add_shutdown_hook(recording_hook(order.clone(), "b"));

        lifecycle.startup().await.unwrap();
        lifecycle.shutdown().await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "b", "a"]);
    }

    #[tokio::test]
    async fn startup_twice_fails() {
        let lifecycle = Lifecycle::new("root");
        lifecycle.startup().await.unwrap();
        let err = lifecycle.startup().await.unwrap_err();
        assert!(matches!(err, InitError::LifecycleAlreadyInvoked { .. }));
    }

    #[tokio::test]
    async fn startup_failure_aborts_remaining_hooks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let lifecycle = Lifecycle::new("p1");
        lifecycle.add_startup_hook(Arc::new(move || {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".into())
            })
        }));
        lifecycle.add_startup_hook(Arc::new(move || Box::pin(async move { Ok(()) })));

        let err = lifecycle.startup().await.unwrap_err();
        assert!(matches!(err, InitError::LifecycleStartupFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_continues_past_hook_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let lifecycle = Lifecycle::new("root");
        lifecycle.add_shutdown_hook(Arc::new(|| Box::pin(async move { Err("boom".into()) })));
        lifecycle.add_shutdown_hook(recording_hook(order.clone(), "ran"));

        lifecycle.shutdown().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["ran"]);
    }
}
