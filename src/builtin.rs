//! Default service factories the orchestrator always wires in, ahead of any
//! embedder-supplied defaults or catalog overrides.
//!
//! These are core machinery (every plugin needs a lifecycle; the ownership
//! check in §4.3/I5 needs something to protect), not the "default services
//! bundled with the runtime" that §1 places out of scope.

use std::sync::Arc;

use crate::lifecycle::Lifecycle;
use crate::logger::{Logger, TracingLogger};
use crate::refs::{downcast, erase, ServiceRef, PLUGIN_METADATA_SERVICE_ID, ROOT_PLUGIN_ID};
use crate::registry::ServiceFactory;

pub const LIFECYCLE_SERVICE_ID: &str = "lifecycle";
pub const ROOT_LIFECYCLE_SERVICE_ID: &str = "rootLifecycle";
pub const ROOT_LOGGER_SERVICE_ID: &str = "rootLogger";

/// Identity of the plugin a `pluginMetadata` resolution was made under.
/// Mirrors the source system's `getId()` collaborator.
pub struct PluginMetadata {
    pub plugin_id: String,
}

impl PluginMetadata {
    pub fn id(&self) -> &str {
        &self.plugin_id
    }
}

fn resolved_logger(deps: &[crate::refs::AnyValue]) -> Arc<dyn Logger> {
    (*downcast::<Arc<dyn Logger>>(&deps[0])
        .expect("rootLogger factory always produces Arc<dyn Logger>"))
    .clone()
}

/// The root-scoped diagnostics sink (§6). Every plugin-scoped `lifecycle`
/// and the root-scoped `rootLifecycle` depend on this to route hook
/// failures through it instead of logging directly.
pub fn root_logger_factory() -> ServiceFactory {
    ServiceFactory::new(ServiceRef::root(ROOT_LOGGER_SERVICE_ID), vec![], |_deps, _plugin_id| {
        Box::pin(async move {
            let logger: Arc<dyn Logger> = Arc::new(TracingLogger::new());
            Ok(erase(logger))
        })
    })
}

/// The per-plugin lifecycle, one instance per plugin id. Distinct from
/// [`root_lifecycle_factory`] so an embedder can override either
/// independently (§8 happy-path: defaults register both `rootLifecycle` and
/// `lifecycle`).
pub fn lifecycle_service_factory() -> ServiceFactory {
    ServiceFactory::new(
        ServiceRef::plugin_scoped(LIFECYCLE_SERVICE_ID),
        vec![ServiceRef::root(ROOT_LOGGER_SERVICE_ID)],
        |deps, plugin_id| {
            Box::pin(async move {
                let logger = resolved_logger(&deps);
                Ok(erase(Lifecycle::with_logger(plugin_id, logger)))
            })
        },
    )
}

/// The process-wide lifecycle, resolved once under [`ROOT_PLUGIN_ID`].
pub fn root_lifecycle_factory() -> ServiceFactory {
    ServiceFactory::new(
        ServiceRef::root(ROOT_LIFECYCLE_SERVICE_ID),
        vec![ServiceRef::root(ROOT_LOGGER_SERVICE_ID)],
        |deps, _plugin_id| {
            Box::pin(async move {
                let logger = resolved_logger(&deps);
                Ok(erase(Lifecycle::with_logger(ROOT_PLUGIN_ID, logger)))
            })
        },
    )
}

pub fn plugin_metadata_factory() -> ServiceFactory {
    ServiceFactory::new(
        ServiceRef::plugin_scoped(PLUGIN_METADATA_SERVICE_ID),
        vec![],
        |_deps, plugin_id| Box::pin(async move { Ok(erase(PluginMetadata { plugin_id })) }),
    )
}

pub fn defaults() -> Vec<ServiceFactory> {
    vec![
        root_logger_factory(),
        root_lifecycle_factory(),
        lifecycle_service_factory(),
        plugin_metadata_factory(),
    ]
}
