//! Configuration of the initializer itself, distinct from anything the
//! plugins it wires might configure (out of scope; see crate docs).

use std::sync::Arc;

use crate::process_host::{NoopProcessHost, ProcessHost, RealProcessHost};

/// Settings for one [`crate::Initializer`] instance.
pub struct InitializerOptions {
    /// When set, signal handlers and the unhandled-error hook are never
    /// installed, regardless of `process_host`. Integration tests should
    /// always set this.
    pub test_mode: bool,
    /// Overrides the process-host implementation. Defaults to
    /// [`RealProcessHost`] outside test mode and [`NoopProcessHost`] in
    /// test mode.
    pub process_host: Option<Arc<dyn ProcessHost>>,
}

impl InitializerOptions {
    pub fn test_mode() -> Self {
        Self {
            test_mode: true,
            process_host: None,
        }
    }

    pub fn with_process_host(mut self, host: Arc<dyn ProcessHost>) -> Self {
        self.process_host = Some(host);
        self
    }

    pub(crate) fn resolve_process_host(&self) -> Arc<dyn ProcessHost> {
        if let Some(host) = &self.process_host {
            return host.clone();
        }
        if self.test_mode {
            Arc::new(NoopProcessHost)
        } else {
            Arc::new(RealProcessHost)
        }
    }
}

impl Default for InitializerOptions {
    fn default() -> Self {
        Self {
            test_mode: false,
            process_host: None,
        }
    }
}
