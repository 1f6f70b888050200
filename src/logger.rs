//! Root logger collaborator (§6: `.child(fields)`, `.error(msg, err)`).
//!
//! Out of scope is only the *concrete* logging backend (§1: "concrete
//! service implementations (loggers, ...)"), not this interface — the same
//! split as [`crate::catalog::FeatureDiscovery`], which is also a trait the
//! orchestrator always has something to call even though no embedder ever
//! supplies a backing implementation.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use tracing::error;

/// A structured logger, resolved as the root-scoped `rootLogger` service.
/// `Lifecycle` holds one to route hook failures through it (§7, P5) instead
/// of logging directly.
pub trait Logger: Send + Sync {
    /// Returns a logger that carries `fields` on every subsequent call.
    fn child(&self, fields: HashMap<String, String>) -> Arc<dyn Logger>;

    /// Reports `err` alongside a human-readable `msg`, without propagating it.
    fn error(&self, msg: &str, err: &(dyn Error + Send + Sync));
}

/// Default `Logger`, backed by `tracing`. This is ambient diagnostics the
/// crate itself always carries, not a "default service bundled with the
/// runtime" in the sense §1 scopes out.
#[derive(Clone, Default)]
pub struct TracingLogger {
    fields: Vec<(String, String)>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Logger for TracingLogger {
    fn child(&self, fields: HashMap<String, String>) -> Arc<dyn Logger> {
        let mut merged = self.fields.clone();
        merged.extend(fields);
        Arc::new(TracingLogger { fields: merged })
    }

    fn error(&self, msg: &str, err: &(dyn Error + Send + Sync)) {
        error!(fields = ?self.fields, error = %err, "{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_logger_merges_fields_without_mutating_parent() {
        let root = TracingLogger::new();
        let mut fields = HashMap::new();
        fields.insert("plugin".to_string(), "alpha".to_string());
        let child = root.child(fields);
        let err: Box<dyn Error + Send + Sync> = "boom".into();
        child.error("child failed", err.as_ref());
        root.error("root still usable", err.as_ref());
    }
}
