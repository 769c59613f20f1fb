//! Plugin loading: module import, export resolution, module caching.
//!
//! Dynamic import goes through the [`ModuleLoader`] trait so the import
//! mechanism stays pluggable: an in-process registry of compiled plugins
//! ([`StaticModuleLoader`]), a declarative definition file on disk
//! ([`FileModuleLoader`]), or anything a host wants to wire in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::discovery::DiscoveredPlugin;
use crate::error::{Error, Result};
use crate::plugin::{Plugin, PluginBuilder};

/// Factory function export producing a plugin.
pub type PluginFactoryFn = Arc<dyn Fn() -> Result<Plugin> + Send + Sync>;

/// A constructible plugin export — the "plugin class" shape.
pub trait PluginConstructor: Send + Sync {
    /// Instantiate the plugin.
    fn construct(&self) -> Result<Plugin>;
}

/// One export from a plugin module.
#[derive(Clone)]
pub enum Export {
    /// An exported factory function.
    Factory(PluginFactoryFn),
    /// An exported plugin class to instantiate.
    Constructor(Arc<dyn PluginConstructor>),
    /// A ready plugin object.
    Plugin(Box<Plugin>),
    /// Raw data; counts as a plugin when shaped like one
    /// (`name` + `version` present).
    Value(serde_json::Value),
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Factory(_) => write!(f, "Export::Factory"),
            Self::Constructor(_) => write!(f, "Export::Constructor"),
            Self::Plugin(p) => write!(f, "Export::Plugin({})", p.name),
            Self::Value(_) => write!(f, "Export::Value"),
        }
    }
}

/// The exports of an imported plugin module.
#[derive(Debug, Clone, Default)]
pub struct ModuleExports {
    /// The default export, if any.
    pub default: Option<Export>,
    /// Named exports, iterated in name order during resolution.
    pub named: BTreeMap<String, Export>,
    /// Module size in bytes, when the loader knows it.
    pub size_bytes: Option<u64>,
}

impl ModuleExports {
    /// Create an empty export set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default export.
    pub fn with_default(mut self, export: Export) -> Self {
        self.default = Some(export);
        self
    }

    /// Add a named export.
    pub fn with_named(mut self, name: impl Into<String>, export: Export) -> Self {
        self.named.insert(name.into(), export);
        self
    }

    /// Set the module size.
    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size_bytes = Some(bytes);
        self
    }
}

/// Imports plugin modules by entry-point path.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Load the module at `path` and return its exports.
    async fn load(&self, path: &Path) -> Result<ModuleExports>;
}

/// An in-process registry of compiled plugin modules keyed by entry path.
///
/// The idiomatic stand-in for dynamic import when plugins are linked into
/// the host binary; also what the test suites use.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: DashMap<PathBuf, ModuleExports>,
}

impl StaticModuleLoader {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the module served for an entry-point path.
    pub fn register(&self, path: impl Into<PathBuf>, exports: ModuleExports) {
        self.modules.insert(path.into(), exports);
    }

    /// Remove a registered module.
    pub fn unregister(&self, path: &Path) -> bool {
        self.modules.remove(path).is_some()
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load(&self, path: &Path) -> Result<ModuleExports> {
        self.modules
            .get(path)
            .map(|m| m.value().clone())
            .ok_or_else(|| Error::module_import(format!("no module registered for {}", path.display())))
    }
}

impl std::fmt::Debug for StaticModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticModuleLoader")
            .field("modules", &self.modules.len())
            .finish()
    }
}

/// Loads declarative plugin definitions (JSON) from disk.
///
/// The definition file is the module: its JSON object becomes a
/// plugin-shaped default export.
#[derive(Debug, Default)]
pub struct FileModuleLoader;

impl FileModuleLoader {
    /// Create a file module loader.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleLoader for FileModuleLoader {
    async fn load(&self, path: &Path) -> Result<ModuleExports> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::module_import(format!("{}: {}", path.display(), e)))?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::module_import(format!("{}: {}", path.display(), e)))?;

        Ok(ModuleExports::new()
            .with_default(Export::Value(value))
            .with_size(bytes.len() as u64))
    }
}

/// Plugin-shaped raw export data.
#[derive(Debug, serde::Deserialize)]
struct PluginSpec {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    dependencies: Vec<crate::manifest::Dependency>,
    #[serde(default)]
    priority: Option<i32>,
}

fn plugin_from_value(value: &serde_json::Value) -> Option<Plugin> {
    // Plugin-shaped means name + version present.
    let spec: PluginSpec = serde_json::from_value(value.clone()).ok()?;

    let mut builder = PluginBuilder::new(spec.name, spec.version)
        .description(spec.description.unwrap_or_default());
    if let Some(author) = spec.author {
        builder = builder.author(author);
    }
    for dep in spec.dependencies {
        builder = builder.dependency(dep);
    }
    if let Some(priority) = spec.priority {
        builder = builder.priority(priority);
    }
    Some(builder.build())
}

/// Configuration for the plugin loader.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Timeout applied to a single module import.
    pub load_timeout: Duration,
    /// Whether to reject loads of candidates whose discovery failed
    /// validation.
    pub strict_validation: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            strict_validation: true,
        }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the import timeout.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Set strict validation.
    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }
}

/// Timings and sizes recorded for one load.
#[derive(Debug, Clone)]
pub struct LoadMetrics {
    /// Wall-clock duration of the load.
    pub load_time: Duration,
    /// Module size in bytes, when known.
    pub module_size: Option<u64>,
    /// Number of declared dependencies.
    pub dependency_count: Option<usize>,
}

/// A successfully loaded plugin plus its load metrics.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// The resolved plugin.
    pub plugin: Plugin,
    /// Load metrics.
    pub metrics: LoadMetrics,
    /// Whether the module came from the module cache.
    pub from_cache: bool,
}

// Removes the in-flight marker when a load finishes or is cancelled.
struct InflightGuard {
    map: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Imports entry-point modules and resolves them into [`Plugin`] objects.
pub struct PluginLoader {
    config: LoaderConfig,
    module_loader: Arc<dyn ModuleLoader>,
    cache: DashMap<PathBuf, Arc<ModuleExports>>,
    inflight: Arc<DashMap<String, ()>>,
}

impl PluginLoader {
    /// Create a loader over a module import mechanism.
    pub fn new(config: LoaderConfig, module_loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            config,
            module_loader,
            cache: DashMap::new(),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load a discovered plugin.
    ///
    /// A second call for the same `name@version` while one is in flight
    /// fails with [`Error::PluginAlreadyLoading`]; it is never queued.
    /// Import failures and timeouts are failed results, not panics.
    pub async fn load_plugin(&self, discovered: &DiscoveredPlugin) -> Result<LoadedPlugin> {
        if self.config.strict_validation && !discovered.is_valid {
            return Err(Error::discovery(format!(
                "{}: {}",
                discovered.name,
                discovered.validation_errors.join("; ")
            )));
        }

        let key = discovered.identity();
        let _guard = match self.inflight.entry(key.clone()) {
            Entry::Occupied(_) => return Err(Error::PluginAlreadyLoading(key)),
            Entry::Vacant(v) => {
                v.insert(());
                InflightGuard {
                    map: self.inflight.clone(),
                    key,
                }
            }
        };

        let started = Instant::now();
        let (exports, from_cache) = self.import_module(&discovered.entry_point).await?;

        let mut plugin = resolve_plugin(&exports).ok_or_else(|| {
            Error::UnrecognizedExports(discovered.entry_point.display().to_string())
        })??;

        self.enrich_from_manifest(&mut plugin, discovered);
        self.validate_plugin(&plugin, discovered)?;

        let metrics = LoadMetrics {
            load_time: started.elapsed(),
            module_size: exports.size_bytes,
            dependency_count: Some(plugin.dependencies.len()),
        };

        tracing::info!(
            plugin = %plugin.identity(),
            load_ms = metrics.load_time.as_millis() as u64,
            from_cache,
            "plugin loaded"
        );

        Ok(LoadedPlugin {
            plugin,
            metrics,
            from_cache,
        })
    }

    /// Invalidate the cached module for an entry path. Returns whether an
    /// entry was removed. Used by hot reload before re-importing.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.cache.remove(path).is_some()
    }

    /// Drop every cached module.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of cached modules.
    pub fn cached_modules(&self) -> usize {
        self.cache.len()
    }

    async fn import_module(&self, path: &Path) -> Result<(Arc<ModuleExports>, bool)> {
        if let Some(cached) = self.cache.get(path) {
            return Ok((cached.value().clone(), true));
        }

        let loaded = tokio::time::timeout(self.config.load_timeout, self.module_loader.load(path))
            .await
            .map_err(|_| Error::LoadTimeout {
                entry_point: path.display().to_string(),
                seconds: self.config.load_timeout.as_secs(),
            })??;

        let exports = Arc::new(loaded);
        self.cache.insert(path.to_path_buf(), exports.clone());
        Ok((exports, false))
    }

    fn enrich_from_manifest(&self, plugin: &mut Plugin, discovered: &DiscoveredPlugin) {
        let manifest = &discovered.manifest;

        if plugin.name.is_empty() {
            plugin.name = manifest.name.clone();
        }
        if plugin.version.is_empty() {
            plugin.version = manifest.version.clone();
        }
        if plugin.description.is_empty() {
            if let Some(desc) = &manifest.description {
                plugin.description = desc.clone();
            }
        }
        if plugin.author.is_none() {
            plugin.author = manifest.authors.first().cloned();
        }
        if plugin.dependencies.is_empty() {
            plugin.dependencies = manifest.dependencies.clone();
        }
        if plugin.priority.is_none() {
            plugin.priority = manifest.priority;
        }
    }

    fn validate_plugin(&self, plugin: &Plugin, discovered: &DiscoveredPlugin) -> Result<()> {
        if plugin.name.is_empty() {
            return Err(Error::PluginValidation("plugin name is empty".into()));
        }
        if plugin.version.is_empty() {
            return Err(Error::PluginValidation("plugin version is empty".into()));
        }

        for service in &plugin.services {
            if service.class_name.is_empty() {
                return Err(Error::PluginValidation(format!(
                    "{}: service with empty class name",
                    plugin.name
                )));
            }
        }

        if plugin.name != discovered.name {
            tracing::warn!(
                "module export name {} differs from manifest name {}",
                plugin.name,
                discovered.name
            );
        }

        Ok(())
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("config", &self.config)
            .field("cached_modules", &self.cache.len())
            .finish()
    }
}

/// Resolve a plugin from module exports using the fixed precedence:
/// named factory, named constructor, default plugin, default factory,
/// then any named plugin-shaped export. First match wins.
fn resolve_plugin(exports: &ModuleExports) -> Option<Result<Plugin>> {
    // (1) an exported factory function
    for export in exports.named.values() {
        if let Export::Factory(f) = export {
            return Some(f());
        }
    }

    // (2) an exported plugin class
    for export in exports.named.values() {
        if let Export::Constructor(c) = export {
            return Some(c.construct());
        }
    }

    // (3) a default export that is itself a plugin
    match &exports.default {
        Some(Export::Plugin(p)) => return Some(Ok((**p).clone())),
        Some(Export::Value(v)) => {
            if let Some(p) = plugin_from_value(v) {
                return Some(Ok(p));
            }
        }
        _ => {}
    }

    // (4) a default export that is a factory
    match &exports.default {
        Some(Export::Factory(f)) => return Some(f()),
        Some(Export::Constructor(c)) => return Some(c.construct()),
        _ => {}
    }

    // (5) a direct export shaped like a plugin
    for export in exports.named.values() {
        match export {
            Export::Plugin(p) => return Some(Ok((**p).clone())),
            Export::Value(v) => {
                if let Some(p) = plugin_from_value(v) {
                    return Some(Ok(p));
                }
            }
            _ => {}
        }
    }

    None
}
