//! Feature classification and registration bookkeeping.
//!
//! Where the source system classifies an incoming feature by probing its
//! shape at runtime, this crate replaces that with the [`Feature`] enum: the
//! caller picks the right variant up front, and `FeatureCatalog::add` only
//! has to check invariants, not guess a shape.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{InitError, Result};
use crate::refs::{AnyValue, DepRef, ExtRef};
use crate::registry::ServiceFactory;

/// The only feature-format major version this catalog understands.
pub const SUPPORTED_FEATURE_VERSION: &str = "v1";

pub type InitFn = Arc<
    dyn Fn(HashMap<String, AnyValue>) -> BoxFuture<'static, std::result::Result<(), crate::error::BoxError>>
        + Send
        + Sync,
>;

/// A plugin or module's declared dependencies plus the closure that consumes
/// them once resolved.
#[derive(Clone)]
pub struct InitSpec {
    pub deps: HashMap<String, DepRef>,
    pub func: InitFn,
}

impl InitSpec {
    pub fn new(
        deps: HashMap<String, DepRef>,
        func: impl Fn(HashMap<String, AnyValue>) -> BoxFuture<'static, std::result::Result<(), crate::error::BoxError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            deps,
            func: Arc::new(func),
        }
    }

    fn consumes(&self) -> Vec<String> {
        self.deps.values().map(|r| r.id().to_string()).collect()
    }
}

#[derive(Clone)]
pub struct PluginRegistration {
    pub plugin_id: String,
    pub version: String,
    pub extension_points: Vec<(ExtRef, AnyValue)>,
    pub init: Option<InitSpec>,
}

impl PluginRegistration {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version: SUPPORTED_FEATURE_VERSION.to_string(),
            extension_points: Vec::new(),
            init: None,
        }
    }

    pub fn with_extension_point(mut self, ext: ExtRef, value: AnyValue) -> Self {
        self.extension_points.push((ext, value));
        self
    }

    pub fn with_init(mut self, init: InitSpec) -> Self {
        self.init = Some(init);
        self
    }

    fn provides(&self) -> Vec<String> {
        self.extension_points.iter().map(|(e, _)| e.id.clone()).collect()
    }

    fn consumes(&self) -> Vec<String> {
        self.init.as_ref().map(InitSpec::consumes).unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct ModuleRegistration {
    pub plugin_id: String,
    pub module_id: String,
    pub version: String,
    pub extension_points: Vec<(ExtRef, AnyValue)>,
    pub init: Option<InitSpec>,
}

impl ModuleRegistration {
    pub fn new(plugin_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            module_id: module_id.into(),
            version: SUPPORTED_FEATURE_VERSION.to_string(),
            extension_points: Vec::new(),
            init: None,
        }
    }

    pub fn with_extension_point(mut self, ext: ExtRef, value: AnyValue) -> Self {
        self.extension_points.push((ext, value));
        self
    }

    pub fn with_init(mut self, init: InitSpec) -> Self {
        self.init = Some(init);
        self
    }

    pub(crate) fn provides(&self) -> Vec<String> {
        self.extension_points.iter().map(|(e, _)| e.id.clone()).collect()
    }

    pub(crate) fn consumes(&self) -> Vec<String> {
        self.init.as_ref().map(InitSpec::consumes).unwrap_or_default()
    }
}

/// A single incoming registration, already shaped by the caller rather than
/// probed by this crate.
#[derive(Clone)]
pub enum Feature {
    ServiceFactory(ServiceFactory),
    Plugin(PluginRegistration),
    Module(ModuleRegistration),
}

/// An optional collaborator, resolved as the root-scoped `featureDiscovery`
/// service, that can contribute more features during the discovery phase
/// (§4.4). Most embedders never register one.
pub trait FeatureDiscovery: Send + Sync {
    fn get_backend_features(&self) -> BoxFuture<'static, Vec<Feature>>;
}

pub struct ExtensionPointEntry {
    pub owner: String,
    pub value: AnyValue,
}

/// The resolved registration data an orchestrator run is built from.
pub struct RegistrationIndex {
    pub plugin_inits: HashMap<String, PluginRegistration>,
    pub module_inits: HashMap<String, Vec<ModuleRegistration>>,
    pub ext_points: HashMap<String, ExtensionPointEntry>,
    pub all_plugin_ids: HashSet<String>,
}

/// Accepts features one at a time, rejecting anything that violates I1–I3 or
/// I5 as soon as it is seen.
#[derive(Default)]
pub struct FeatureCatalog {
    service_factories: Vec<ServiceFactory>,
    known_service_ids: HashSet<String>,
    plugins: HashMap<String, PluginRegistration>,
    modules: HashMap<(String, String), ModuleRegistration>,
    ext_owners: HashMap<String, String>,
}

impl FeatureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, feature: Feature) -> Result<()> {
        match feature {
            Feature::ServiceFactory(factory) => self.add_service_factory(factory),
            Feature::Plugin(registration) => self.add_plugin(registration),
            Feature::Module(registration) => self.add_module(registration),
        }
    }

    fn add_service_factory(&mut self, factory: ServiceFactory) -> Result<()> {
        if factory.service.id == crate::refs::PLUGIN_METADATA_SERVICE_ID {
            return Err(InitError::ForbiddenServiceOverride {
                service_id: factory.service.id,
            });
        }
        if !self.known_service_ids.insert(factory.service.id.clone()) {
            return Err(InitError::DuplicateServiceImpl {
                service_id: factory.service.id,
            });
        }
        self.service_factories.push(factory);
        Ok(())
    }

    fn add_plugin(&mut self, registration: PluginRegistration) -> Result<()> {
        self.check_version(&registration.version)?;
        if self.plugins.contains_key(&registration.plugin_id) {
            return Err(InitError::DuplicatePluginRegistration {
                plugin_id: registration.plugin_id,
            });
        }
        for (ext, _) in &registration.extension_points {
            self.claim_extension_point(ext, &registration.plugin_id)?;
        }
        self.plugins.insert(registration.plugin_id.clone(), registration);
        Ok(())
    }

    fn add_module(&mut self, registration: ModuleRegistration) -> Result<()> {
        self.check_version(&registration.version)?;
        let key = (registration.plugin_id.clone(), registration.module_id.clone());
        if self.modules.contains_key(&key) {
            return Err(InitError::DuplicateModuleRegistration {
                plugin_id: registration.plugin_id,
                module_id: registration.module_id,
            });
        }
        for (ext, _) in &registration.extension_points {
            self.claim_extension_point(ext, &registration.plugin_id)?;
        }
        self.modules.insert(key, registration);
        Ok(())
    }

    fn check_version(&self, version: &str) -> Result<()> {
        if version != SUPPORTED_FEATURE_VERSION {
            return Err(InitError::UnsupportedFeatureVersion {
                found: version.to_string(),
                expected: SUPPORTED_FEATURE_VERSION,
            });
        }
        Ok(())
    }

    fn claim_extension_point(&mut self, ext: &ExtRef, owner: &str) -> Result<()> {
        if let Some(existing_owner) = self.ext_owners.get(&ext.id) {
            return Err(InitError::DuplicateExtensionPoint {
                ext_id: ext.id.clone(),
                owner: existing_owner.clone(),
            });
        }
        self.ext_owners.insert(ext.id.clone(), owner.to_string());
        Ok(())
    }

    pub fn service_factories(self) -> Vec<ServiceFactory> {
        self.service_factories
    }

    /// A snapshot of the factories registered so far, without consuming the
    /// catalog. Used to freeze the registry before the discovery phase may
    /// add more features (§4.4: the registry is built before indexing).
    pub fn service_factories_cloned(&self) -> Vec<ServiceFactory> {
        self.service_factories.clone()
    }

    /// Splits the catalog into its service factories and an indexed view of
    /// plugin/module registrations, suitable for building the module graphs.
    pub fn into_parts(self) -> (Vec<ServiceFactory>, RegistrationIndex) {
        let mut module_inits: HashMap<String, Vec<ModuleRegistration>> = HashMap::new();
        for ((plugin_id, _), registration) in self.modules {
            module_inits.entry(plugin_id).or_default().push(registration);
        }

        let mut all_plugin_ids: HashSet<String> = self.plugins.keys().cloned().collect();
        all_plugin_ids.extend(module_inits.keys().cloned());

        let mut ext_points = HashMap::new();
        for (plugin_id, registration) in &self.plugins {
            for (ext, value) in &registration.extension_points {
                ext_points.insert(
                    ext.id.clone(),
                    ExtensionPointEntry {
                        owner: plugin_id.clone(),
                        value: value.clone(),
                    },
                );
            }
        }
        for modules in module_inits.values() {
            for registration in modules {
                for (ext, value) in &registration.extension_points {
                    ext_points.insert(
                        ext.id.clone(),
                        ExtensionPointEntry {
                            owner: registration.plugin_id.clone(),
                            value: value.clone(),
                        },
                    );
                }
            }
        }

        let index = RegistrationIndex {
            plugin_inits: self.plugins,
            module_inits,
            ext_points,
            all_plugin_ids,
        };
        (self.service_factories, index)
    }
}

pub(crate) fn module_graph_node(
    registration: &ModuleRegistration,
) -> backend_init_graph::Node<ModuleRegistration> {
    // Reversed on purpose: a module providing extension point E must run
    // after every module of the same plugin that consumes E, so the
    // consumer gets first say over what it needs. See design notes on the
    // module dependency graph.
    backend_init_graph::Node::new(registration.clone(), registration.consumes(), registration.provides())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::{Scope, ServiceRef};

    fn factory(id: &str) -> ServiceFactory {
        ServiceFactory::new(ServiceRef::new(id, Scope::Root), vec![], |_deps, _pid| {
            Box::pin(async move { Ok(crate::refs::erase(0i64)) })
        })
    }

    #[test]
    fn rejects_duplicate_service_factory() {
        let mut catalog = FeatureCatalog::new();
        catalog.add(Feature::ServiceFactory(factory("svc"))).unwrap();
        let err = catalog
            .add(Feature::ServiceFactory(factory("svc")))
            .unwrap_err();
        assert!(matches!(err, InitError::DuplicateServiceImpl { .. }));
    }

    #[test]
    fn rejects_plugin_metadata_override() {
        let mut catalog = FeatureCatalog::new();
        let err = catalog
            .add(Feature::ServiceFactory(factory(
                crate::refs::PLUGIN_METADATA_SERVICE_ID,
            )))
            .unwrap_err();
        assert!(matches!(err, InitError::ForbiddenServiceOverride { .. }));
    }

    #[test]
    fn rejects_duplicate_plugin_registration() {
        let mut catalog = FeatureCatalog::new();
        catalog
            .add(Feature::Plugin(PluginRegistration::new("p1")))
            .unwrap();
        let err = catalog
            .add(Feature::Plugin(PluginRegistration::new("p1")))
            .unwrap_err();
        assert!(matches!(err, InitError::DuplicatePluginRegistration { .. }));
    }

    #[test]
    fn rejects_duplicate_module_registration() {
        let mut catalog = FeatureCatalog::new();
        catalog
            .add(Feature::Module(ModuleRegistration::new("p1", "m1")))
            .unwrap();
        let err = catalog
            .add(Feature::Module(ModuleRegistration::new("p1", "m1")))
            .unwrap_err();
        assert!(matches!(err, InitError::DuplicateModuleRegistration { .. }));
    }

    #[test]
    fn rejects_unsupported_feature_version() {
        let mut catalog = FeatureCatalog::new();
        let mut registration = PluginRegistration::new("p1");
        registration.version = "v99".to_string();
        let err = catalog.add(Feature::Plugin(registration)).unwrap_err();
        assert!(matches!(err, InitError::UnsupportedFeatureVersion { .. }));
    }

    #[test]
    fn rejects_extension_point_registered_twice() {
        let mut catalog = FeatureCatalog::new();
        let value = crate::refs::erase(());
        catalog
            .add(Feature::Plugin(
                PluginRegistration::new("p1").with_extension_point(ExtRef::new("ext"), value.clone()),
            ))
            .unwrap();
        let err = catalog
            .add(Feature::Module(
                ModuleRegistration::new("p2", "m1").with_extension_point(ExtRef::new("ext"), value),
            ))
            .unwrap_err();
        assert!(matches!(err, InitError::DuplicateExtensionPoint { .. }));
    }

    #[test]
    fn module_without_plugin_is_retained() {
        let mut catalog = FeatureCatalog::new();
        catalog
            .add(Feature::Module(ModuleRegistration::new("orphan", "m1")))
            .unwrap();
        let (_, index) = catalog.into_parts();
        assert!(index.all_plugin_ids.contains("orphan"));
        assert!(!index.plugin_inits.contains_key("orphan"));
    }
}
