//! Service pre-binding: eagerly created, cached handlers for every
//! declared capability, so dispatch never pays resolution cost twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::injector::ServiceContainer;
use crate::plugin::Plugin;
use crate::service::{CapabilityDescriptor, CapabilityKind, Request, Response, Service};

/// A bound capability handler: one cached service instance closed over by
/// an async dispatch function.
pub type BoundHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Continuation passed through a middleware chain.
pub type Next = Box<dyn FnOnce(Request) -> BoxFuture<'static, Result<Response>> + Send>;

/// Externally-supplied middleware invoked around a capability call.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handle the request, calling `next` to continue the chain.
    async fn handle(&self, request: Request, next: Next) -> Result<Response>;
}

/// Externally-supplied error handler for a capability.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Turn a failed capability call into a response, or propagate.
    async fn handle(&self, error: Error, request: Request) -> Result<Response>;
}

/// A cached service instance with access bookkeeping.
pub struct PreBoundService {
    /// Cache id, `"{kind}:{plugin|core}:{name}"`.
    pub id: String,
    /// The cached instance.
    pub instance: Arc<dyn Service>,
    /// Capability kind the entry was created for.
    pub kind: CapabilityKind,
    /// Owning plugin; `None` for core services.
    pub plugin_name: Option<String>,
    /// When the entry was created.
    pub created_at: Instant,
    last_accessed: RwLock<Instant>,
    access_count: AtomicU64,
}

impl PreBoundService {
    fn new(
        id: String,
        instance: Arc<dyn Service>,
        kind: CapabilityKind,
        plugin_name: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            instance,
            kind,
            plugin_name,
            created_at: now,
            last_accessed: RwLock::new(now),
            access_count: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        *self.last_accessed.write() = Instant::now();
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of handler invocations through this entry.
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// When the entry was last invoked.
    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.read()
    }
}

impl std::fmt::Debug for PreBoundService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreBoundService")
            .field("id", &self.id)
            .field("plugin", &self.plugin_name)
            .field("access_count", &self.access_count())
            .finish()
    }
}

/// A capability ready for registration with the dispatcher.
#[derive(Clone)]
pub struct PreBoundCapability {
    /// Cache id of the backing service entry.
    pub service_id: String,
    /// Externally-visible identifier.
    pub identifier: String,
    /// Capability kind.
    pub kind: CapabilityKind,
    /// Human-readable description.
    pub description: String,
    /// MIME type, for resources.
    pub mime_type: Option<String>,
    /// The bound dispatch handler.
    pub handler: BoundHandler,
}

impl std::fmt::Debug for PreBoundCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreBoundCapability")
            .field("identifier", &self.identifier)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Access statistics for one cache entry.
#[derive(Debug, Clone)]
pub struct ServiceAccess {
    /// Cache id.
    pub id: String,
    /// Invocation count.
    pub access_count: u64,
}

/// Aggregate pre-binder statistics. Informational only; the pre-binder
/// never evicts.
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Hits over total lookups, zero when never queried.
    pub cache_hit_rate: f64,
    /// Total cached entries.
    pub total_services: usize,
    /// Entry counts per capability kind.
    pub by_kind: HashMap<String, usize>,
    /// Entry counts per plugin (`core` for host services).
    pub by_plugin: HashMap<String, usize>,
    /// Most-accessed entries, descending.
    pub top_accessed: Vec<ServiceAccess>,
}

/// Creates and caches bound handlers for declared capabilities.
pub struct ServicePreBinder {
    cache: DashMap<String, Arc<PreBoundService>>,
    capabilities: DashMap<String, PreBoundCapability>,
    middleware: DashMap<String, Arc<dyn Middleware>>,
    error_handlers: DashMap<String, Arc<dyn ErrorHandler>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ServicePreBinder {
    /// Create an empty pre-binder.
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            capabilities: DashMap::new(),
            middleware: DashMap::new(),
            error_handlers: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Register a middleware under an id referenced by capability metadata.
    pub fn register_middleware(&self, id: impl Into<String>, middleware: Arc<dyn Middleware>) {
        self.middleware.insert(id.into(), middleware);
    }

    /// Register an error handler under an id referenced by capability
    /// metadata.
    pub fn register_error_handler(&self, id: impl Into<String>, handler: Arc<dyn ErrorHandler>) {
        self.error_handlers.insert(id.into(), handler);
    }

    /// Cache key for a capability.
    pub fn cache_key(kind: CapabilityKind, plugin: Option<&str>, name: &str) -> String {
        format!("{}:{}:{}", kind.as_str(), plugin.unwrap_or("core"), name)
    }

    /// Pre-bind every capability a plugin declares.
    ///
    /// Instances are resolved from the plugin's isolation scope; a service
    /// the injector skipped is constructed here once through its factory.
    /// A capability whose instance cannot be produced is skipped with a
    /// warning.
    pub async fn prebind_plugin(
        &self,
        plugin: &Plugin,
        container: &Arc<ServiceContainer>,
    ) -> Vec<PreBoundCapability> {
        let mut bound = Vec::new();

        for service_ref in &plugin.services {
            let descriptor = service_ref.descriptor().clone();
            for capability in &descriptor.capabilities {
                let instance = match container.resolve(&service_ref.class_name) {
                    Some(instance) => instance,
                    None => match service_ref.factory.create().await {
                        Ok(instance) => instance,
                        Err(e) => {
                            tracing::warn!(
                                plugin = %plugin.name,
                                capability = %capability.name,
                                error = %e,
                                "cannot produce service instance; capability skipped"
                            );
                            continue;
                        }
                    },
                };

                let capability_bound = self.bind_capability(
                    Some(plugin.name.as_str()),
                    instance,
                    capability,
                );
                bound.push(capability_bound);
            }
        }

        bound
    }

    /// Pre-bind every capability of a core (host-owned) service.
    pub fn prebind_core_service(&self, instance: Arc<dyn Service>) -> Vec<PreBoundCapability> {
        let descriptor = instance.descriptor().clone();
        descriptor
            .capabilities
            .iter()
            .map(|capability| self.bind_capability(None, instance.clone(), capability))
            .collect()
    }

    fn bind_capability(
        &self,
        plugin: Option<&str>,
        instance: Arc<dyn Service>,
        capability: &CapabilityDescriptor,
    ) -> PreBoundCapability {
        let key = Self::cache_key(capability.kind, plugin, &capability.name);
        let entry = self.get_or_insert(&key, instance, capability.kind, plugin);
        let handler = self.build_handler(entry, capability);

        let bound = PreBoundCapability {
            service_id: key.clone(),
            identifier: capability.name.clone(),
            kind: capability.kind,
            description: capability.description.clone(),
            mime_type: capability.mime_type.clone(),
            handler,
        };

        self.capabilities.insert(key, bound.clone());
        bound
    }

    fn get_or_insert(
        &self,
        key: &str,
        instance: Arc<dyn Service>,
        kind: CapabilityKind,
        plugin: Option<&str>,
    ) -> Arc<PreBoundService> {
        use dashmap::mapref::entry::Entry;

        match self.cache.entry(key.to_string()) {
            Entry::Occupied(e) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                e.get().clone()
            }
            Entry::Vacant(v) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(PreBoundService::new(
                    key.to_string(),
                    instance,
                    kind,
                    plugin.map(str::to_string),
                ));
                v.insert(entry.clone());
                entry
            }
        }
    }

    fn build_handler(
        &self,
        entry: Arc<PreBoundService>,
        capability: &CapabilityDescriptor,
    ) -> BoundHandler {
        let chain: Vec<Arc<dyn Middleware>> = capability
            .middleware
            .iter()
            .filter_map(|id| {
                let found = self.middleware.get(id).map(|m| m.value().clone());
                if found.is_none() {
                    tracing::warn!(middleware = %id, "unknown middleware id; skipping");
                }
                found
            })
            .collect();

        let error_handler: Option<Arc<dyn ErrorHandler>> = capability
            .error_handler
            .as_ref()
            .and_then(|id| self.error_handlers.get(id).map(|h| h.value().clone()));

        let method = capability.method_name.clone();

        Arc::new(move |request: Request| {
            let entry = entry.clone();
            let chain = chain.clone();
            let method = method.clone();
            let error_handler = error_handler.clone();

            Box::pin(async move {
                entry.touch();

                let result =
                    run_chain(chain, entry.instance.clone(), method, request.clone()).await;

                match (result, error_handler) {
                    (Err(error), Some(handler)) => handler.handle(error, request).await,
                    (result, _) => result,
                }
            })
        })
    }

    /// Look up a cached entry by id.
    pub fn get(&self, id: &str) -> Option<Arc<PreBoundService>> {
        self.cache.get(id).map(|e| e.value().clone())
    }

    /// Every bound capability of a kind, for dispatcher registration.
    pub fn capabilities_of(&self, kind: CapabilityKind) -> Vec<PreBoundCapability> {
        self.capabilities
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Bound tools.
    pub fn tools(&self) -> Vec<PreBoundCapability> {
        self.capabilities_of(CapabilityKind::Tool)
    }

    /// Bound resources.
    pub fn resources(&self) -> Vec<PreBoundCapability> {
        self.capabilities_of(CapabilityKind::Resource)
    }

    /// Bound prompts.
    pub fn prompts(&self) -> Vec<PreBoundCapability> {
        self.capabilities_of(CapabilityKind::Prompt)
    }

    /// Drop every entry belonging to a plugin. Returns how many cache
    /// entries were removed.
    pub fn remove_plugin(&self, plugin_name: &str) -> usize {
        let ids: Vec<String> = self
            .cache
            .iter()
            .filter(|e| e.plugin_name.as_deref() == Some(plugin_name))
            .map(|e| e.id.clone())
            .collect();

        for id in &ids {
            self.cache.remove(id);
            self.capabilities.remove(id);
        }

        ids.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.cache.clear();
        self.capabilities.clear();
    }

    /// Number of cached service entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Aggregate cache statistics with the `top_n` most-accessed entries.
    pub fn performance_metrics(&self, top_n: usize) -> PerformanceMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut by_plugin: HashMap<String, usize> = HashMap::new();
        let mut accesses: Vec<ServiceAccess> = Vec::new();

        for entry in self.cache.iter() {
            *by_kind.entry(entry.kind.as_str().to_string()).or_default() += 1;
            let plugin = entry.plugin_name.clone().unwrap_or_else(|| "core".to_string());
            *by_plugin.entry(plugin).or_default() += 1;
            accesses.push(ServiceAccess {
                id: entry.id.clone(),
                access_count: entry.access_count(),
            });
        }

        accesses.sort_by(|a, b| b.access_count.cmp(&a.access_count));
        accesses.truncate(top_n);

        PerformanceMetrics {
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            total_services: self.cache.len(),
            by_kind,
            by_plugin,
            top_accessed: accesses,
        }
    }
}

impl Default for ServicePreBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServicePreBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePreBinder")
            .field("cached_services", &self.cache.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

fn run_chain(
    chain: Vec<Arc<dyn Middleware>>,
    instance: Arc<dyn Service>,
    method: String,
    request: Request,
) -> BoxFuture<'static, Result<Response>> {
    if chain.is_empty() {
        return Box::pin(async move { instance.call(&method, request).await });
    }

    let head = chain[0].clone();
    let tail = chain[1..].to_vec();

    Box::pin(async move {
        let next: Next = Box::new(move |req| run_chain(tail, instance, method, req));
        head.handle(request, next).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginBuilder;
    use crate::service::{
        CallbackService, CallbackServiceFactory, ServiceDescriptor, ServiceRef,
    };
    use serde_json::json;

    fn counter_descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("CounterService").with_capability(
            CapabilityDescriptor::new(CapabilityKind::Tool, "count", "count")
                .with_description("Counts calls"),
        )
    }

    fn counter_plugin() -> Plugin {
        let descriptor = counter_descriptor();
        let inner = descriptor.clone();
        PluginBuilder::new("counter", "1.0.0")
            .service(ServiceRef::new(Arc::new(CallbackServiceFactory::new(
                descriptor,
                move || {
                    Ok(CallbackService::new(inner.clone())
                        .method("count", |req| async move { Ok(json!({"got": req})) }))
                },
            ))))
            .build()
    }

    #[tokio::test]
    async fn test_prebind_and_dispatch() {
        let prebinder = ServicePreBinder::new();
        let container = ServiceContainer::new_root("test");
        let plugin = counter_plugin();

        let bound = prebinder.prebind_plugin(&plugin, &container).await;
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].identifier, "count");
        assert_eq!(bound[0].service_id, "tool:counter:count");

        let response = (bound[0].handler)(json!({"x": 1})).await.unwrap();
        assert_eq!(response["got"]["x"], 1);

        let entry = prebinder.get("tool:counter:count").unwrap();
        assert_eq!(entry.access_count(), 1);
    }

    #[tokio::test]
    async fn test_same_key_returns_identical_instance() {
        let prebinder = ServicePreBinder::new();
        let container = ServiceContainer::new_root("test");
        let plugin = counter_plugin();

        prebinder.prebind_plugin(&plugin, &container).await;
        let first = prebinder.get("tool:counter:count").unwrap();

        prebinder.prebind_plugin(&plugin, &container).await;
        let second = prebinder.get("tool:counter:count").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first.instance, &second.instance));

        let metrics = prebinder.performance_metrics(5);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.cache_hits, 1);
        assert!((metrics.cache_hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_middleware_chain_order() {
        struct Tagger(&'static str);

        #[async_trait]
        impl Middleware for Tagger {
            async fn handle(&self, mut request: Request, next: Next) -> Result<Response> {
                let trail = request["trail"].as_str().unwrap_or("").to_string();
                request["trail"] = json!(format!("{}{}", trail, self.0));
                next(request).await
            }
        }

        let prebinder = ServicePreBinder::new();
        prebinder.register_middleware("first", Arc::new(Tagger("a")));
        prebinder.register_middleware("second", Arc::new(Tagger("b")));

        let descriptor = ServiceDescriptor::new("Traced").with_capability(
            CapabilityDescriptor::new(CapabilityKind::Tool, "trace", "trace")
                .with_middleware("first")
                .with_middleware("second")
                .with_middleware("missing-id"),
        );
        let inner = descriptor.clone();
        let plugin = PluginBuilder::new("traced", "1.0.0")
            .service(ServiceRef::new(Arc::new(CallbackServiceFactory::new(
                descriptor,
                move || {
                    Ok(CallbackService::new(inner.clone())
                        .method("trace", |req| async move { Ok(req["trail"].clone()) }))
                },
            ))))
            .build();

        let container = ServiceContainer::new_root("test");
        let bound = prebinder.prebind_plugin(&plugin, &container).await;

        let response = (bound[0].handler)(json!({})).await.unwrap();
        assert_eq!(response, json!("ab"));
    }

    #[tokio::test]
    async fn test_error_handler_catches() {
        struct Recover;

        #[async_trait]
        impl ErrorHandler for Recover {
            async fn handle(&self, error: Error, _request: Request) -> Result<Response> {
                Ok(json!({"recovered": error.to_string()}))
            }
        }

        let prebinder = ServicePreBinder::new();
        prebinder.register_error_handler("recover", Arc::new(Recover));

        let descriptor = ServiceDescriptor::new("Flaky").with_capability(
            CapabilityDescriptor::new(CapabilityKind::Tool, "flaky", "flaky")
                .with_error_handler("recover"),
        );
        let inner = descriptor.clone();
        let plugin = PluginBuilder::new("flaky", "1.0.0")
            .service(ServiceRef::new(Arc::new(CallbackServiceFactory::new(
                descriptor,
                move || {
                    Ok(CallbackService::new(inner.clone()).method("flaky", |_| async {
                        Err(Error::Invocation("always fails".into()))
                    }))
                },
            ))))
            .build();

        let container = ServiceContainer::new_root("test");
        let bound = prebinder.prebind_plugin(&plugin, &container).await;

        let response = (bound[0].handler)(json!({})).await.unwrap();
        assert!(response["recovered"]
            .as_str()
            .unwrap()
            .contains("always fails"));
    }

    #[tokio::test]
    async fn test_error_propagates_without_handler() {
        let descriptor = ServiceDescriptor::new("Flaky").with_capability(
            CapabilityDescriptor::new(CapabilityKind::Tool, "flaky", "flaky"),
        );
        let inner = descriptor.clone();
        let plugin = PluginBuilder::new("flaky", "1.0.0")
            .service(ServiceRef::new(Arc::new(CallbackServiceFactory::new(
                descriptor,
                move || {
                    Ok(CallbackService::new(inner.clone()).method("flaky", |_| async {
                        Err(Error::Invocation("always fails".into()))
                    }))
                },
            ))))
            .build();

        let prebinder = ServicePreBinder::new();
        let container = ServiceContainer::new_root("test");
        let bound = prebinder.prebind_plugin(&plugin, &container).await;

        assert!(matches!(
            (bound[0].handler)(json!({})).await,
            Err(Error::Invocation(_))
        ));
    }

    #[tokio::test]
    async fn test_prebinder_uses_scope_instance_when_present() {
        let descriptor = counter_descriptor();
        let container = ServiceContainer::new_root("scope");
        container.bind(
            "CounterService",
            Arc::new(
                CallbackService::new(descriptor.clone())
                    .method("count", |_| async { Ok(json!("from-scope")) }),
            ) as Arc<dyn Service>,
        );

        let prebinder = ServicePreBinder::new();
        let bound = prebinder.prebind_plugin(&counter_plugin(), &container).await;

        let response = (bound[0].handler)(json!({})).await.unwrap();
        assert_eq!(response, json!("from-scope"));
    }

    #[tokio::test]
    async fn test_remove_plugin_purges_entries() {
        let prebinder = ServicePreBinder::new();
        let container = ServiceContainer::new_root("test");
        let plugin = counter_plugin();

        prebinder.prebind_plugin(&plugin, &container).await;
        assert_eq!(prebinder.len(), 1);
        assert_eq!(prebinder.tools().len(), 1);

        assert_eq!(prebinder.remove_plugin("counter"), 1);
        assert!(prebinder.is_empty());
        assert!(prebinder.tools().is_empty());
    }

    #[tokio::test]
    async fn test_core_service_prebinding() {
        let descriptor = ServiceDescriptor::new("Core").with_capability(
            CapabilityDescriptor::new(CapabilityKind::Resource, "res://core/info", "info")
                .with_mime_type("application/json"),
        );
        let instance = Arc::new(
            CallbackService::new(descriptor).method("info", |_| async { Ok(json!({"core": true})) }),
        ) as Arc<dyn Service>;

        let prebinder = ServicePreBinder::new();
        let bound = prebinder.prebind_core_service(instance);

        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].service_id, "resource:core:res://core/info");
        assert_eq!(bound[0].mime_type.as_deref(), Some("application/json"));
        assert_eq!(prebinder.resources().len(), 1);
    }

    #[tokio::test]
    async fn test_performance_metrics_shape() {
        let prebinder = ServicePreBinder::new();
        let container = ServiceContainer::new_root("test");

        let bound = prebinder.prebind_plugin(&counter_plugin(), &container).await;
        for _ in 0..3 {
            (bound[0].handler)(json!({})).await.unwrap();
        }

        let metrics = prebinder.performance_metrics(10);
        assert_eq!(metrics.total_services, 1);
        assert_eq!(metrics.by_kind.get("tool"), Some(&1));
        assert_eq!(metrics.by_plugin.get("counter"), Some(&1));
        assert_eq!(metrics.top_accessed[0].access_count, 3);
    }
}
