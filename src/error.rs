//! Error taxonomy for the initializer.
//!
//! Every variant below corresponds to one row of the error table in the
//! design document; each carries a human-readable message and, where the
//! underlying cause came from feature code, the original error chained via
//! `#[source]`.

use std::fmt;

/// A type-erased error produced by feature code (a factory, an `init.func`,
/// or a lifecycle hook).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("add() called after start(), or start() called twice")]
    AlreadyStarted,

    #[error("feature failed shape validation: {0}")]
    MalformedFeature(String),

    #[error("unsupported feature version {found:?}, expected {expected:?}")]
    UnsupportedFeatureVersion {
        found: String,
        expected: &'static str,
    },

    #[error("duplicate service factory for service id {service_id:?}")]
    DuplicateServiceImpl { service_id: String },

    #[error("service {service_id:?} cannot be overridden")]
    ForbiddenServiceOverride { service_id: String },

    #[error("duplicate extension point id {ext_id:?} (already owned by plugin {owner:?})")]
    DuplicateExtensionPoint { ext_id: String, owner: String },

    #[error("duplicate plugin registration for plugin id {plugin_id:?}")]
    DuplicatePluginRegistration { plugin_id: String },

    #[error("duplicate module registration for ({plugin_id:?}, {module_id:?})")]
    DuplicateModuleRegistration {
        plugin_id: String,
        module_id: String,
    },

    #[error(
        "module of plugin {consumer:?} may not consume extension point {ext_id:?} owned by plugin {owner:?}"
    )]
    ExtensionPointOwnershipViolation {
        ext_id: String,
        owner: String,
        consumer: String,
    },

    #[error("unresolved dependencies: {}", format_missing(.missing))]
    UnresolvedDependencies { missing: Vec<MissingDep> },

    #[error("circular module dependency for plugin {plugin_id:?}: {}", format_path(.path))]
    CircularModuleDependency { plugin_id: String, path: Vec<String> },

    #[error("service dependency cycle detected resolving {service_id:?}")]
    ServiceCycle { service_id: String },

    #[error("service {service_id:?} has no registered dependency {dep_id:?}")]
    MissingDependency { service_id: String, dep_id: String },

    #[error("module {module_id:?} of plugin {plugin_id:?} failed to start: {source}")]
    ModuleStartupFailed {
        plugin_id: String,
        module_id: String,
        #[source]
        source: BoxError,
    },

    #[error("plugin {plugin_id:?} failed to start: {source}")]
    PluginStartupFailed {
        plugin_id: String,
        #[source]
        source: BoxError,
    },

    #[error("lifecycle {phase} already invoked")]
    LifecycleAlreadyInvoked { phase: &'static str },

    #[error("lifecycle startup hook failed for {owner:?}: {source}")]
    LifecycleStartupFailed {
        owner: String,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Clone)]
pub struct MissingDep {
    pub name: String,
    pub ref_id: String,
}

fn format_missing(missing: &[MissingDep]) -> String {
    missing
        .iter()
        .map(|m| format!("{} ({})", m.name, m.ref_id))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_path(path: &[String]) -> String {
    path.join(" -> ")
}

impl fmt::Display for MissingDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.ref_id)
    }
}

pub type Result<T> = std::result::Result<T, InitError>;
