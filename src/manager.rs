//! Plugin manager: orchestrates discovery, loading, conflict detection,
//! isolation, and pre-binding into load/unload/reload state transitions.
//!
//! The manager is the only component with mutable cross-plugin state; the
//! pipeline stages it drives are invoked functionally per plugin.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::conflict::{ConflictDetector, ConflictSeverity, DetectorConfig, PluginConflict};
use crate::discovery::{DiscoveredPlugin, DiscoveryConfig, PluginDiscovery};
use crate::error::{Error, Result};
use crate::injector::{
    FeatureInjector, IsolatedPluginInstance, IsolationLevel, IsolationOptions, ServiceContainer,
};
use crate::loader::{LoadMetrics, LoaderConfig, ModuleLoader, PluginLoader};
use crate::plugin::{Plugin, PluginStatus};
use crate::prebind::ServicePreBinder;

/// Configuration for the plugin manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Plugins root directory, one subdirectory per plugin.
    pub plugins_root: PathBuf,
    /// Loader configuration.
    pub loader: LoaderConfig,
    /// Conflict detector configuration.
    pub detector: DetectorConfig,
    /// Concurrency window for batch loads.
    pub max_concurrent_loads: usize,
    /// Conflicts at or above this severity block activation.
    pub block_on_severity: ConflictSeverity,
    /// Isolation level applied when a manifest declares none.
    pub default_isolation: IsolationLevel,
}

impl ManagerConfig {
    /// Create a configuration for a plugins root.
    pub fn new(plugins_root: impl Into<PathBuf>) -> Self {
        Self {
            plugins_root: plugins_root.into(),
            loader: LoaderConfig::default(),
            detector: DetectorConfig::default(),
            max_concurrent_loads: 5,
            block_on_severity: ConflictSeverity::Critical,
            default_isolation: IsolationLevel::Service,
        }
    }

    /// Set the loader configuration.
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Set the detector configuration.
    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    /// Set the batch-load concurrency window.
    pub fn with_max_concurrent_loads(mut self, max: usize) -> Self {
        self.max_concurrent_loads = max.max(1);
        self
    }

    /// Set the severity that blocks activation.
    pub fn with_block_on_severity(mut self, severity: ConflictSeverity) -> Self {
        self.block_on_severity = severity;
        self
    }

    /// Set the default isolation level.
    pub fn with_default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }
}

/// Per-name outcome of a batch load.
#[derive(Debug, Clone, Default)]
pub struct BatchLoadResult {
    /// Names that loaded.
    pub loaded: Vec<String>,
    /// Names that failed, with the error message.
    pub failed: Vec<(String, String)>,
}

/// Isolation-level counts across active plugins.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsolationStats {
    /// Plugins at level none.
    pub none: usize,
    /// Plugins at level service.
    pub service: usize,
    /// Plugins at level full.
    pub full: usize,
}

/// Aggregate host introspection.
#[derive(Debug, Clone)]
pub struct PluginHostInfo {
    /// Every plugin the manager has seen, by status.
    pub statuses: HashMap<String, PluginStatus>,
    /// Total tracked plugins.
    pub total_plugins: usize,
    /// Currently loaded plugins.
    pub loaded_count: usize,
    /// Plugins whose last load failed.
    pub failed_count: usize,
    /// Isolation-level distribution of active plugins.
    pub isolation: IsolationStats,
    /// Load metrics per loaded plugin.
    pub load_metrics: HashMap<String, LoadMetrics>,
}

/// Orchestrates the plugin lifecycle.
pub struct PluginManager {
    config: ManagerConfig,
    discovery: PluginDiscovery,
    loader: PluginLoader,
    detector: ConflictDetector,
    injector: FeatureInjector,
    prebinder: ServicePreBinder,
    host: Arc<ServiceContainer>,
    active: DashMap<String, Arc<Plugin>>,
    instances: DashMap<String, Arc<IsolatedPluginInstance>>,
    discovered: DashMap<String, DiscoveredPlugin>,
    load_metrics: DashMap<String, LoadMetrics>,
    status: DashMap<String, PluginStatus>,
    load_window: Arc<Semaphore>,
}

impl PluginManager {
    /// Create a manager over a module import mechanism.
    pub fn new(config: ManagerConfig, module_loader: Arc<dyn ModuleLoader>) -> Self {
        let host = ServiceContainer::new_root("host");
        let discovery = PluginDiscovery::new(DiscoveryConfig::new(&config.plugins_root));
        let loader = PluginLoader::new(config.loader.clone(), module_loader);
        let detector = ConflictDetector::new(config.detector.clone());
        let injector = FeatureInjector::new(host.clone());
        let load_window = Arc::new(Semaphore::new(config.max_concurrent_loads));

        Self {
            config,
            discovery,
            loader,
            detector,
            injector,
            prebinder: ServicePreBinder::new(),
            host,
            active: DashMap::new(),
            instances: DashMap::new(),
            discovered: DashMap::new(),
            load_metrics: DashMap::new(),
            status: DashMap::new(),
            load_window,
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The host resolution scope, for binding core services.
    pub fn host_container(&self) -> &Arc<ServiceContainer> {
        &self.host
    }

    /// The pre-binder, for dispatcher registration and middleware setup.
    pub fn prebinder(&self) -> &ServicePreBinder {
        &self.prebinder
    }

    /// The conflict detector, for custom rules and resolution.
    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    /// The discovery component.
    pub fn discovery(&self) -> &PluginDiscovery {
        &self.discovery
    }

    /// The loader component.
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Load a plugin by name.
    ///
    /// Rejects names that are already loaded or currently loading; any
    /// failure along the pipeline records status [`PluginStatus::Failed`]
    /// and surfaces the first error.
    pub async fn load_plugin(&self, name: &str) -> Result<()> {
        // Atomic status transition; rejects rather than queues, so at most
        // one load per name is ever in flight.
        match self.status.entry(name.to_string()) {
            Entry::Occupied(mut e) => match e.get() {
                PluginStatus::Loaded => {
                    return Err(Error::PluginAlreadyLoaded(name.to_string()));
                }
                PluginStatus::Loading => {
                    return Err(Error::PluginAlreadyLoading(name.to_string()));
                }
                _ => {
                    e.insert(PluginStatus::Loading);
                }
            },
            Entry::Vacant(v) => {
                v.insert(PluginStatus::Loading);
            }
        }

        match self.run_load_pipeline(name).await {
            Ok(()) => {
                self.status.insert(name.to_string(), PluginStatus::Loaded);
                Ok(())
            }
            Err(e) => {
                tracing::error!(plugin = name, error = %e, "plugin load failed");
                self.status.insert(name.to_string(), PluginStatus::Failed);
                Err(e)
            }
        }
    }

    async fn run_load_pipeline(&self, name: &str) -> Result<()> {
        let discovered = self
            .discovery
            .discover_plugin(name)?
            .ok_or_else(|| Error::plugin_not_found(name))?;

        if !discovered.is_valid {
            return Err(Error::discovery(format!(
                "{}: {}",
                name,
                discovered.validation_errors.join("; ")
            )));
        }

        let loaded = self.loader.load_plugin(&discovered).await?;
        let plugin = Arc::new(loaded.plugin);

        // Conflicts run over a snapshot of the active set plus the
        // candidate, on collected metadata only.
        let mut candidate_set: Vec<Arc<Plugin>> =
            self.active.iter().map(|e| e.value().clone()).collect();
        candidate_set.push(plugin.clone());

        let conflicts = self.detector.detect_conflicts(&candidate_set);
        if let Some(blocking) = self.blocking_conflict(&conflicts) {
            return Err(Error::CriticalConflict {
                identifier: blocking.resource.identifier.clone(),
                detail: format!(
                    "{} conflict between {:?}",
                    blocking.conflict_type,
                    blocking.plugin_names()
                ),
            });
        }

        let options = IsolationOptions {
            isolation_level: discovered
                .manifest
                .isolation_level()
                .unwrap_or(self.config.default_isolation),
            permissions: discovered.manifest.permissions(),
        };
        let instance = self
            .injector
            .create_isolated_plugin(plugin.clone(), options)
            .await?;
        let instance = Arc::new(instance);

        let bound = self
            .prebinder
            .prebind_plugin(&plugin, &instance.container)
            .await;

        self.discovered.insert(name.to_string(), discovered);
        self.load_metrics.insert(name.to_string(), loaded.metrics);
        self.active.insert(name.to_string(), plugin.clone());
        self.instances.insert(name.to_string(), instance);

        tracing::info!(
            plugin = %plugin.identity(),
            capabilities = bound.len(),
            "plugin activated"
        );

        Ok(())
    }

    /// Unload a plugin.
    ///
    /// A no-op with a warning when the plugin is not active, so the call
    /// is idempotent.
    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        let Some((_, plugin)) = self.active.remove(name) else {
            tracing::warn!(plugin = name, "unload requested for inactive plugin");
            return Ok(());
        };

        if let Some((_, instance)) = self.instances.remove(name) {
            instance.destroy().await;
        }

        self.prebinder.remove_plugin(name);
        self.discovered.remove(name);
        self.load_metrics.remove(name);
        self.status.insert(name.to_string(), PluginStatus::Unloaded);

        tracing::info!(plugin = %plugin.identity(), "plugin unloaded");
        Ok(())
    }

    /// Reload a plugin: unload if loaded, drop its cached module, load.
    ///
    /// Not transactional: a failure during the load half leaves the plugin
    /// [`PluginStatus::Failed`] with no rollback to the previous state.
    pub async fn reload_plugin(&self, name: &str) -> Result<()> {
        let entry_point = self
            .discovered
            .get(name)
            .map(|d| d.entry_point.clone())
            .or_else(|| {
                self.discovery
                    .discover_plugin(name)
                    .ok()
                    .flatten()
                    .map(|d| d.entry_point)
            });

        if self.is_plugin_loaded(name) {
            self.unload_plugin(name).await?;
        }

        if let Some(path) = entry_point {
            self.loader.invalidate(&path);
        }

        self.load_plugin(name).await
    }

    /// Load a batch of plugins with bounded concurrency.
    ///
    /// One failing load never aborts its siblings; per-name outcomes are
    /// collected.
    pub async fn load_plugins<S: AsRef<str>>(&self, names: &[S]) -> BatchLoadResult {
        let outcomes = futures::future::join_all(names.iter().map(|name| {
            let name = name.as_ref().to_string();
            let window = self.load_window.clone();
            async move {
                let result = match window.acquire().await {
                    Ok(_permit) => self.load_plugin(&name).await,
                    Err(_) => Err(Error::Invocation("load window closed".to_string())),
                };
                (name, result)
            }
        }))
        .await;

        let mut batch = BatchLoadResult::default();
        for (name, result) in outcomes {
            match result {
                Ok(()) => batch.loaded.push(name),
                Err(e) => batch.failed.push((name, e.to_string())),
            }
        }
        batch
    }

    /// Unload every active plugin best-effort and clear all state.
    ///
    /// Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let names: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.unload_plugin(&name).await {
                tracing::warn!(plugin = %name, error = %e, "unload failed during cleanup");
            }
        }

        self.prebinder.clear();
        self.loader.clear_cache();
        self.discovered.clear();
        self.load_metrics.clear();
        self.instances.clear();
        self.status.clear();

        tracing::debug!("plugin manager cleaned up");
    }

    /// Whether a plugin is loaded and usable.
    pub fn is_plugin_loaded(&self, name: &str) -> bool {
        self.get_plugin_status(name).is_loaded()
    }

    /// Status of a plugin; `Unloaded` when never seen.
    pub fn get_plugin_status(&self, name: &str) -> PluginStatus {
        self.status
            .get(name)
            .map(|s| *s)
            .unwrap_or(PluginStatus::Unloaded)
    }

    /// Every active plugin.
    pub fn get_active_plugins(&self) -> Vec<Arc<Plugin>> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// An active plugin by name.
    pub fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.active.get(name).map(|e| e.value().clone())
    }

    /// The isolated instance of an active plugin, for bridge access.
    pub fn get_isolated_instance(&self, name: &str) -> Option<Arc<IsolatedPluginInstance>> {
        self.instances.get(name).map(|e| e.value().clone())
    }

    /// Aggregate introspection over everything the manager tracks.
    pub fn get_plugin_info(&self) -> PluginHostInfo {
        let statuses: HashMap<String, PluginStatus> = self
            .status
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let loaded_count = statuses
            .values()
            .filter(|s| **s == PluginStatus::Loaded)
            .count();
        let failed_count = statuses
            .values()
            .filter(|s| **s == PluginStatus::Failed)
            .count();

        let mut isolation = IsolationStats::default();
        for entry in self.instances.iter() {
            match entry.isolation_level {
                IsolationLevel::None => isolation.none += 1,
                IsolationLevel::Service => isolation.service += 1,
                IsolationLevel::Full => isolation.full += 1,
            }
        }

        let load_metrics = self
            .load_metrics
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        PluginHostInfo {
            total_plugins: statuses.len(),
            loaded_count,
            failed_count,
            statuses,
            isolation,
            load_metrics,
        }
    }

    fn blocking_conflict<'a>(
        &self,
        conflicts: &'a [PluginConflict],
    ) -> Option<&'a PluginConflict> {
        conflicts
            .iter()
            .find(|c| c.severity >= self.config.block_on_severity)
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_root", &self.config.plugins_root)
            .field("active", &self.active.len())
            .finish()
    }
}
