//! Scoped, memoized service registry.
//!
//! Mirrors the single-flight caching pattern used elsewhere in this codebase
//! for concurrent dependency resolution (see `reinhardt-di`'s singleton
//! scope): each `(service id, scope key)` pair is backed by a
//! [`tokio::sync::OnceCell`] so that racing callers share one factory
//! invocation instead of each running it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::error::{InitError, Result};
use crate::refs::{AnyValue, Scope, ServiceRef, ROOT_PLUGIN_ID};

/// `factory(deps, plugin_id) -> impl`. `deps` are positional, matching the
/// order of [`ServiceFactory::deps`].
pub type FactoryFn =
    Arc<dyn Fn(Vec<AnyValue>, String) -> BoxFuture<'static, Result<AnyValue>> + Send + Sync>;

#[derive(Clone)]
pub struct ServiceFactory {
    pub service: ServiceRef,
    pub deps: Vec<ServiceRef>,
    pub factory: FactoryFn,
}

impl ServiceFactory {
    pub fn new(
        service: ServiceRef,
        deps: Vec<ServiceRef>,
        factory: impl Fn(Vec<AnyValue>, String) -> BoxFuture<'static, Result<AnyValue>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            service,
            deps,
            factory: Arc::new(factory),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Root(String),
    Plugin(String, String),
}

impl CacheKey {
    fn for_ref(service_ref: &ServiceRef, plugin_id: &str) -> Self {
        match service_ref.scope {
            Scope::Root => CacheKey::Root(service_ref.id.clone()),
            Scope::Plugin => CacheKey::Plugin(service_ref.id.clone(), plugin_id.to_string()),
        }
    }
}

/// Resolves [`ServiceRef`]s to concrete instances, lazily and with per-scope
/// memoization.
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
    cache: DashMap<CacheKey, Arc<OnceCell<AnyValue>>>,
}

impl ServiceRegistry {
    /// Builds a registry from a flat factory list: defaults first, user
    /// overrides appended. Last write wins for identical `service.id`.
    pub fn new(factories: Vec<ServiceFactory>) -> Self {
        let mut by_id = HashMap::new();
        for factory in factories {
            by_id.insert(factory.service.id.clone(), factory);
        }
        Self {
            factories: by_id,
            cache: DashMap::new(),
        }
    }

    pub fn service_refs(&self) -> HashSet<ServiceRef> {
        self.factories.values().map(|f| f.service.clone()).collect()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.factories.contains_key(service_id)
    }

    /// Resolves `service_ref` under `plugin_id`, instantiating (and caching)
    /// it and its transitive dependencies as needed.
    #[instrument(level = "debug", skip(self), fields(service_id = %service_ref.id, plugin_id))]
    pub async fn get(
        &self,
        service_ref: &ServiceRef,
        plugin_id: &str,
    ) -> Result<Option<AnyValue>> {
        let mut in_progress = HashSet::new();
        self.resolve(service_ref, plugin_id, &mut in_progress).await
    }

    fn resolve<'a>(
        &'a self,
        service_ref: &'a ServiceRef,
        plugin_id: &'a str,
        in_progress: &'a mut HashSet<CacheKey>,
    ) -> BoxFuture<'a, Result<Option<AnyValue>>> {
        Box::pin(async move {
            let factory = match self.factories.get(&service_ref.id) {
                Some(f) => f.clone(),
                None => return Ok(None),
            };

            let key = CacheKey::for_ref(service_ref, plugin_id);

            if let Some(cell) = self.cache.get(&key) {
                if let Some(value) = cell.get() {
                    return Ok(Some(value.clone()));
                }
            }

            if !in_progress.insert(key.clone()) {
                return Err(InitError::ServiceCycle {
                    service_id: service_ref.id.clone(),
                });
            }

            let mut dep_values = Vec::with_capacity(factory.deps.len());
            for dep in &factory.deps {
                match self.resolve(dep, plugin_id, in_progress).await? {
                    Some(value) => dep_values.push(value),
                    None => {
                        return Err(InitError::MissingDependency {
                            service_id: service_ref.id.clone(),
                            dep_id: dep.id.clone(),
                        });
                    }
                }
            }
            in_progress.remove(&key);

            let cell = self
                .cache
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let factory_plugin_id = match factory.service.scope {
                Scope::Root => ROOT_PLUGIN_ID.to_string(),
                Scope::Plugin => plugin_id.to_string(),
            };

            let value = cell
                .get_or_try_init(|| (factory.factory)(dep_values, factory_plugin_id))
                .await?
                .clone();

            Ok(Some(value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::erase;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn const_factory(id: &str, value: i64) -> ServiceFactory {
        ServiceFactory::new(ServiceRef::root(id), vec![], move |_deps, _plugin_id| {
            Box::pin(async move { Ok(erase(value)) })
        })
    }

    #[tokio::test]
    async fn resolves_dependency_chain() {
        let a = const_factory("a", 1);
        let b = ServiceFactory::new(
            ServiceRef::root("b"),
            vec![ServiceRef::root("a")],
            |deps, _plugin_id| {
                Box::pin(async move {
                    let a_val = *crate::refs::downcast::<i64>(&deps[0]).unwrap();
                    Ok(erase(a_val + 41))
                })
            },
        );
        let registry = ServiceRegistry::new(vec![a, b]);
        let result = registry.get(&ServiceRef::root("b"), ROOT_PLUGIN_ID).await.unwrap();
        let value = crate::refs::downcast::<i64>(&result.unwrap()).unwrap();
        assert_eq!(*value, 42);
    }

    #[tokio::test]
    async fn unknown_service_resolves_to_none() {
        let registry = ServiceRegistry::new(vec![]);
        let result = registry
            .get(&ServiceRef::root("missing"), ROOT_PLUGIN_ID)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_declared_dependency_fails() {
        let dependent = ServiceFactory::new(
            ServiceRef::root("dependent"),
            vec![ServiceRef::root("absent")],
            |_deps, _plugin_id| Box::pin(async move { Ok(erase(0i64)) }),
        );
        let registry = ServiceRegistry::new(vec![dependent]);
        let err = registry
            .get(&ServiceRef::root("dependent"), ROOT_PLUGIN_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, InitError::MissingDependency { .. }));
    }

    #[tokio::test]
    async fn detects_service_cycle() {
        let a = ServiceFactory::new(
            ServiceRef::root("a"),
            vec![ServiceRef::root("b")],
            |_deps, _plugin_id| Box::pin(async move { Ok(erase(0i64)) }),
        );
        let b = ServiceFactory::new(
            ServiceRef::root("b"),
            vec![ServiceRef::root("a")],
            |_deps, _plugin_id| Box::pin(async move { Ok(erase(0i64)) }),
        );
        let registry = ServiceRegistry::new(vec![a, b]);
        let err = registry
            .get(&ServiceRef::root("a"), ROOT_PLUGIN_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, InitError::ServiceCycle { .. }));
    }

    #[tokio::test]
    async fn plugin_scoped_service_instantiated_once_per_plugin() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let factory = ServiceFactory::new(
            ServiceRef::plugin_scoped("widget"),
            vec![],
            move |_deps, plugin_id| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(erase(plugin_id))
                })
            },
        );
        let registry = ServiceRegistry::new(vec![factory]);
        let ref_ = ServiceRef::plugin_scoped("widget");

        let _ = registry.get(&ref_, "plugin-a").await.unwrap();
        let _ = registry.get(&ref_, "plugin-a").await.unwrap();
        let _ = registry.get(&ref_, "plugin-b").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_resolution_invokes_factory_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let factory = ServiceFactory::new(ServiceRef::root("slow"), vec![], move |_deps, _pid| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(erase(7i64))
            })
        });
        let registry = Arc::new(ServiceRegistry::new(vec![factory]));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get(&ServiceRef::root("slow"), ROOT_PLUGIN_ID)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
