//! Top-level state machine: `Configuring -> Starting -> Running ->
//! Stopping -> Stopped | Failed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::{Notify, OnceCell};
use tracing::{info, instrument, warn};

use crate::builtin::{self, LIFECYCLE_SERVICE_ID, ROOT_LIFECYCLE_SERVICE_ID};
use crate::catalog::{Feature, FeatureCatalog, InitSpec, ModuleRegistration, PluginRegistration};
use crate::error::{InitError, MissingDep, Result};
use crate::lifecycle::Lifecycle;
use crate::options::InitializerOptions;
use crate::process_host::ProcessHost;
use crate::refs::{downcast, AnyValue, DepRef, ExtRef, Scope, ServiceRef, ROOT_PLUGIN_ID};
use crate::registry::{ServiceFactory, ServiceRegistry};

const FEATURE_DISCOVERY_SERVICE_ID: &str = "featureDiscovery";

/// Assembles a running backend out of the features registered via [`add`].
///
/// Returned as `Arc<Initializer>` so the caller can cheaply share a handle;
/// internally, the process-signal watcher spawned by a successful,
/// non-test-mode `start` upgrades its own weak self-reference rather than
/// requiring unusual method receivers.
pub struct Initializer {
    options: InitializerOptions,
    default_factories: Vec<ServiceFactory>,
    catalog: Mutex<Option<FeatureCatalog>>,
    started: AtomicBool,
    start_done: OnceCell<()>,
    start_notify: Notify,
    stop_once: OnceCell<()>,
    registry: OnceCell<Arc<ServiceRegistry>>,
    process_host: Arc<dyn ProcessHost>,
    self_ref: OnceLock<Weak<Self>>,
}

impl Initializer {
    pub fn new(default_factories: Vec<ServiceFactory>, options: InitializerOptions) -> Arc<Self> {
        let process_host = options.resolve_process_host();
        let this = Arc::new(Self {
            default_factories,
            options,
            catalog: Mutex::new(Some(FeatureCatalog::new())),
            started: AtomicBool::new(false),
            start_done: OnceCell::new(),
            start_notify: Notify::new(),
            stop_once: OnceCell::new(),
            registry: OnceCell::new(),
            process_host,
            self_ref: OnceLock::new(),
        });
        let _ = this.self_ref.set(Arc::downgrade(&this));
        this
    }

    /// Registers a feature. Fails with [`InitError::AlreadyStarted`] once
    /// `start` has been called.
    pub fn add(&self, feature: Feature) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(InitError::AlreadyStarted);
        }
        let mut guard = self.catalog.lock().unwrap();
        guard
            .as_mut()
            .expect("catalog is only taken once start() begins")
            .add(feature)
    }

    /// Runs the whole discovery -> root-services -> per-plugin startup
    /// sequence described in §4.4-4.5. Calling this a second time fails
    /// immediately without re-running any of it.
    #[instrument(level = "info", skip_all)]
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(InitError::AlreadyStarted);
        }

        let result = self.run_start().await;

        let _ = self.start_done.set(());
        self.start_notify.notify_waiters();

        if result.is_ok() {
            info!("backend initializer running");
            if !self.options.test_mode {
                self.spawn_signal_watcher();
            }
        } else if let Err(err) = &result {
            warn!(error = %err, "backend initializer failed to start");
        }

        result
    }

    /// No-op if never started. Otherwise awaits the in-flight (or already
    /// finished) start, then runs root shutdown hooks. Idempotent: repeated
    /// and concurrent callers share one completion.
    pub async fn stop(&self) {
        self.stop_once
            .get_or_init(|| self.do_stop())
            .await;
    }

    async fn do_stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        self.wait_for_start_done().await;

        let Some(registry) = self.registry.get() else {
            return;
        };
        match registry
            .get(&ServiceRef::root(ROOT_LIFECYCLE_SERVICE_ID), ROOT_PLUGIN_ID)
            .await
        {
            Ok(Some(any)) => {
                if let Some(lifecycle) = downcast::<Lifecycle>(&any) {
                    if let Err(err) = lifecycle.shutdown().await {
                        warn!(error = %err, "root lifecycle shutdown failed");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to resolve root lifecycle for shutdown"),
        }
    }

    async fn wait_for_start_done(&self) {
        loop {
            if self.start_done.get().is_some() {
                return;
            }
            let notified = self.start_notify.notified();
            if self.start_done.get().is_some() {
                return;
            }
            notified.await;
        }
    }

    fn spawn_signal_watcher(&self) {
        let weak = self
            .self_ref
            .get()
            .expect("self_ref is set in new() before any handle escapes")
            .clone();
        tokio::spawn(async move {
            let Some(this) = weak.upgrade() else {
                return;
            };
            this.process_host.wait_for_shutdown_signal().await;
            this.stop().await;
            this.process_host.exit(0);
        });
    }

    async fn run_start(&self) -> Result<()> {
        let mut catalog = self
            .catalog
            .lock()
            .unwrap()
            .take()
            .expect("run_start only called once");

        let mut factories = builtin::defaults();
        factories.extend(self.default_factories.clone());
        factories.extend(catalog.service_factories_cloned());
        let registry = Arc::new(ServiceRegistry::new(factories));

        if registry.contains(FEATURE_DISCOVERY_SERVICE_ID) {
            let resolved = registry
                .get(&ServiceRef::root(FEATURE_DISCOVERY_SERVICE_ID), ROOT_PLUGIN_ID)
                .await?;
            if let Some(any) = resolved {
                if let Some(discovery) =
                    downcast::<Arc<dyn crate::catalog::FeatureDiscovery>>(&any)
                {
                    for feature in discovery.get_backend_features().await {
                        catalog.add(feature)?;
                    }
                }
            }
        }

        let (late_factories, index) = catalog.into_parts();
        if !late_factories.is_empty() {
            warn!(
                count = late_factories.len(),
                "service factories discovered after the registry was frozen will not take effect"
            );
        }

        let _ = self.registry.set(registry.clone());

        for service_ref in registry.service_refs() {
            if service_ref.scope == Scope::Root {
                registry.get(&service_ref, ROOT_PLUGIN_ID).await?;
            }
        }

        let ext_points = Arc::new(index.ext_points);
        let mut handles = Vec::new();
        for plugin_id in index.all_plugin_ids {
            let registry = registry.clone();
            let ext_points = ext_points.clone();
            let modules = index.module_inits.get(&plugin_id).cloned().unwrap_or_default();
            let plugin_init = index.plugin_inits.get(&plugin_id).cloned();
            let handle = tokio::spawn(run_plugin(
                plugin_id.clone(),
                modules,
                plugin_init,
                registry,
                ext_points,
            ));
            handles.push((plugin_id, handle));
        }

        let mut first_error = None;
        for (plugin_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    // A panicking plugin task is an unhandled asynchronous
                    // error in its own right (§7, P5): report it through the
                    // process host rather than letting it take start() down
                    // with an unrelated panic message.
                    self.process_host.report_unhandled_error(&join_err);
                    Err(InitError::PluginStartupFailed {
                        plugin_id: plugin_id.clone(),
                        source: Box::new(join_err),
                    })
                }
            };
            if let Err(err) = outcome {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let root_lifecycle_any = registry
            .get(&ServiceRef::root(ROOT_LIFECYCLE_SERVICE_ID), ROOT_PLUGIN_ID)
            .await?
            .expect("rootLifecycle service is always registered");
        let root_lifecycle =
            downcast::<Lifecycle>(&root_lifecycle_any).expect("lifecycle factory type mismatch");
        root_lifecycle.startup().await?;

        Ok(())
    }
}

#[instrument(level = "debug", skip_all, fields(plugin_id = %plugin_id))]
async fn run_plugin(
    plugin_id: String,
    modules: Vec<ModuleRegistration>,
    plugin_init: Option<PluginRegistration>,
    registry: Arc<ServiceRegistry>,
    ext_points: Arc<HashMap<String, crate::catalog::ExtensionPointEntry>>,
) -> Result<()> {
    let graph = backend_init_graph::Graph::with_nodes(
        modules.iter().map(crate::catalog::module_graph_node).collect(),
    );

    if let Some(cycle) = graph.detect_circular_dependency() {
        return Err(InitError::CircularModuleDependency {
            plugin_id: plugin_id.clone(),
            path: cycle.iter().map(|m| m.module_id.clone()).collect(),
        });
    }

    let plugin_id_ref = &plugin_id;
    let registry_ref = &registry;
    let ext_points_ref = &ext_points;
    graph
        .parallel_topological_traversal(move |module: &ModuleRegistration| {
            let plugin_id = plugin_id_ref.clone();
            let registry = registry_ref.clone();
            let ext_points = ext_points_ref.clone();
            async move {
                let deps = resolve_init_deps(&module.init, &plugin_id, &registry, &ext_points).await?;
                if let Some(init) = &module.init {
                    (init.func)(deps).await.map_err(|source| InitError::ModuleStartupFailed {
                        plugin_id: plugin_id.clone(),
                        module_id: module.module_id.clone(),
                        source,
                    })?;
                }
                Ok(())
            }
        })
        .await?;

    if let Some(registration) = plugin_init {
        let deps = resolve_init_deps(&registration.init, &plugin_id, &registry, &ext_points).await?;
        if let Some(init) = &registration.init {
            (init.func)(deps)
                .await
                .map_err(|source| InitError::PluginStartupFailed {
                    plugin_id: plugin_id.clone(),
                    source,
                })?;
        }
    }

    let lifecycle_any = registry
        .get(&ServiceRef::plugin_scoped(LIFECYCLE_SERVICE_ID), &plugin_id)
        .await?
        .expect("lifecycle service is always registered");
    let lifecycle = downcast::<Lifecycle>(&lifecycle_any).expect("lifecycle factory type mismatch");
    lifecycle.startup().await?;

    Ok(())
}

/// Resolves an `init.deps` map under `plugin_id`: extension points first
/// (rejecting cross-plugin ownership), then services. All misses are
/// collected and reported together (§4.6).
async fn resolve_init_deps(
    init: &Option<InitSpec>,
    plugin_id: &str,
    registry: &ServiceRegistry,
    ext_points: &HashMap<String, crate::catalog::ExtensionPointEntry>,
) -> Result<HashMap<String, AnyValue>> {
    let Some(init) = init else {
        return Ok(HashMap::new());
    };

    let mut bound = HashMap::new();
    let mut missing = Vec::new();

    for (name, dep_ref) in &init.deps {
        if let Some(entry) = ext_points.get(dep_ref.id()) {
            if entry.owner != plugin_id {
                return Err(InitError::ExtensionPointOwnershipViolation {
                    ext_id: dep_ref.id().to_string(),
                    owner: entry.owner.clone(),
                    consumer: plugin_id.to_string(),
                });
            }
            bound.insert(name.clone(), entry.value.clone());
            continue;
        }

        match dep_ref {
            DepRef::Service(service_ref) => match registry.get(service_ref, plugin_id).await? {
                Some(value) => {
                    bound.insert(name.clone(), value);
                }
                None => missing.push(MissingDep {
                    name: name.clone(),
                    ref_id: service_ref.id.clone(),
                }),
            },
            DepRef::Extension(ext_ref) => missing.push(MissingDep {
                name: name.clone(),
                ref_id: ext_ref.id.clone(),
            }),
        }
    }

    if !missing.is_empty() {
        return Err(InitError::UnresolvedDependencies { missing });
    }

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Feature, ModuleRegistration as Module, PluginRegistration as Plugin};
    use crate::refs::erase;
    use std::sync::atomic::AtomicUsize;

    fn noop_init(deps: std::collections::HashMap<String, DepRef>) -> InitSpec {
        InitSpec::new(deps, |_deps| Box::pin(async move { Ok(()) }))
    }

    #[tokio::test]
    async fn happy_two_plugin_path_reaches_running() {
        let init = Initializer::new(vec![], InitializerOptions::test_mode());
        init.add(Feature::Plugin(
            Plugin::new("alpha").with_init(noop_init(Default::default())),
        ))
        .unwrap();
        init.add(Feature::Plugin(
            Plugin::new("beta").with_init(noop_init(Default::default())),
        ))
        .unwrap();

        init.start().await.unwrap();
        init.stop().await;
    }

    #[tokio::test]
    async fn duplicate_service_override_fails_registration() {
        let init = Initializer::new(vec![], InitializerOptions::test_mode());
        let make = || {
            ServiceFactory::new(ServiceRef::root("dup"), vec![], |_d, _p| {
                Box::pin(async move { Ok(erase(0i64)) })
            })
        };
        init.add(Feature::ServiceFactory(make())).unwrap();
        let err = init.add(Feature::ServiceFactory(make())).unwrap_err();
        assert!(matches!(err, InitError::DuplicateServiceImpl { .. }));
    }

    #[tokio::test]
    async fn cross_plugin_extension_point_consumption_fails_start() {
        let init = Initializer::new(vec![], InitializerOptions::test_mode());
        let value = erase(());
        init.add(Feature::Plugin(
            Plugin::new("owner").with_extension_point(ExtRef::new("ext"), value),
        ))
        .unwrap();

        let mut deps = std::collections::HashMap::new();
        deps.insert("ext".to_string(), DepRef::Extension(ExtRef::new("ext")));
        init.add(Feature::Module(
            Module::new("consumer", "m1").with_init(noop_init(deps)),
        ))
        .unwrap();

        let err = init.start().await.unwrap_err();
        assert!(matches!(err, InitError::ExtensionPointOwnershipViolation { .. }));
    }

    #[tokio::test]
    async fn cyclic_modules_fail_start() {
        let init = Initializer::new(vec![], InitializerOptions::test_mode());
        let mut deps_a = std::collections::HashMap::new();
        deps_a.insert("b".to_string(), DepRef::Extension(ExtRef::new("provided-by-b")));
        let mut deps_b = std::collections::HashMap::new();
        deps_b.insert("a".to_string(), DepRef::Extension(ExtRef::new("provided-by-a")));

        init.add(Feature::Module(
            Module::new("p", "a")
                .with_extension_point(ExtRef::new("provided-by-a"), erase(()))
                .with_init(noop_init(deps_a)),
        ))
        .unwrap();
        init.add(Feature::Module(
            Module::new("p", "b")
                .with_extension_point(ExtRef::new("provided-by-b"), erase(()))
                .with_init(noop_init(deps_b)),
        ))
        .unwrap();

        let err = init.start().await.unwrap_err();
        assert!(matches!(err, InitError::CircularModuleDependency { .. }));
    }

    #[tokio::test]
    async fn module_without_plugin_still_initializes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let init = Initializer::new(vec![], InitializerOptions::test_mode());
        init.add(Feature::Module(Module::new("orphan", "m1").with_init(InitSpec::new(
            Default::default(),
            move |_deps| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        ))))
        .unwrap();

        init.start().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_failure_then_stop_then_restart_rejected() {
        let init = Initializer::new(vec![], InitializerOptions::test_mode());
        init.add(Feature::Module(Module::new("p", "m1").with_init(InitSpec::new(
            Default::default(),
            |_deps| Box::pin(async move { Err("boom".into()) }),
        ))))
        .unwrap();

        let err = init.start().await.unwrap_err();
        assert!(matches!(err, InitError::ModuleStartupFailed { .. }));

        init.stop().await;

        let err = init.start().await.unwrap_err();
        assert!(matches!(err, InitError::AlreadyStarted));
    }

    #[tokio::test]
    async fn concurrent_stop_calls_share_one_completion() {
        let init = Initializer::new(vec![], InitializerOptions::test_mode());
        init.start().await.unwrap();

        let a = init.clone();
        let b = init.clone();
        tokio::join!(a.stop(), b.stop());
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let init = Initializer::new(vec![], InitializerOptions::test_mode());
        init.stop().await;
    }
}
