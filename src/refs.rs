//! Identity types for services and extension points.

use std::any::Any;
use std::sync::Arc;

/// A type-erased value produced by a factory or carried by an extension
/// point. Consumers downcast it back to the concrete type they expect.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

pub fn erase<T: Send + Sync + 'static>(value: T) -> AnyValue {
    Arc::new(value)
}

/// Downcasts an [`AnyValue`] to `T`, returning `None` on a type mismatch.
pub fn downcast<T: Send + Sync + 'static>(value: &AnyValue) -> Option<Arc<T>> {
    value.clone().downcast::<T>().ok()
}

/// Either a `root` (one instance per process) or `plugin` (one instance per
/// plugin id) scoped service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Root,
    Plugin,
}

/// The literal plugin id used when invoking root-scoped factories and when a
/// caller resolves a service outside of any particular plugin.
pub const ROOT_PLUGIN_ID: &str = "root";

/// The one service id that can never be overridden (invariant I5).
pub const PLUGIN_METADATA_SERVICE_ID: &str = "pluginMetadata";

/// Identifies a service by a globally unique id plus its scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub id: String,
    pub scope: Scope,
}

impl ServiceRef {
    pub fn new(id: impl Into<String>, scope: Scope) -> Self {
        Self {
            id: id.into(),
            scope,
        }
    }

    pub fn root(id: impl Into<String>) -> Self {
        Self::new(id, Scope::Root)
    }

    pub fn plugin_scoped(id: impl Into<String>) -> Self {
        Self::new(id, Scope::Plugin)
    }
}

/// Identifies an extension point. Extension points are always plugin-scoped,
/// but ownership (which plugin) is determined by registration, not by this
/// identity alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtRef {
    pub id: String,
}

impl ExtRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A dependency requested by an `init.func`: either a service or an
/// extension point. Resolution (see [`crate::orchestrator`]) looks the id up
/// in the extension-point table first regardless of which variant was used,
/// matching the source system's duck-typed lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DepRef {
    Service(ServiceRef),
    Extension(ExtRef),
}

impl DepRef {
    pub fn id(&self) -> &str {
        match self {
            DepRef::Service(r) => &r.id,
            DepRef::Extension(r) => &r.id,
        }
    }
}

impl From<ServiceRef> for DepRef {
    fn from(value: ServiceRef) -> Self {
        DepRef::Service(value)
    }
}

impl From<ExtRef> for DepRef {
    fn from(value: ExtRef) -> Self {
        DepRef::Extension(value)
    }
}
