//! Plugin representation and lifecycle status.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::manifest::Dependency;
use crate::service::ServiceRef;

/// Async lifecycle callback supplied by a plugin.
pub type HookFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Optional lifecycle callbacks a plugin may provide.
#[derive(Clone, Default)]
pub struct PluginHooks {
    /// Invoked after the isolation scope is constructed.
    pub on_load: Option<HookFn>,
    /// Invoked when the plugin is being destroyed.
    pub on_unload: Option<HookFn>,
    /// Invoked when the plugin is enabled.
    pub on_enable: Option<HookFn>,
    /// Invoked when the plugin is disabled.
    pub on_disable: Option<HookFn>,
}

impl PluginHooks {
    /// Create an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `on_load` hook.
    pub fn with_on_load<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_load = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Set the `on_unload` hook.
    pub fn with_on_unload<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_unload = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Set the `on_enable` hook.
    pub fn with_on_enable<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_enable = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Set the `on_disable` hook.
    pub fn with_on_disable<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_disable = Some(Arc::new(move || Box::pin(f())));
        self
    }
}

impl std::fmt::Debug for PluginHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHooks")
            .field("on_load", &self.on_load.is_some())
            .field("on_unload", &self.on_unload.is_some())
            .field("on_enable", &self.on_enable.is_some())
            .field("on_disable", &self.on_disable.is_some())
            .finish()
    }
}

/// A resolved plugin object. Immutable once loaded; identity is
/// `name@version`.
#[derive(Clone)]
pub struct Plugin {
    /// Plugin name (unique within the host).
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Plugin author.
    pub author: Option<String>,
    /// Declared dependencies.
    pub dependencies: Vec<Dependency>,
    /// Declared services.
    pub services: Vec<ServiceRef>,
    /// JSON schema for the plugin's configuration, if any.
    pub config_schema: Option<serde_json::Value>,
    /// Lifecycle callbacks.
    pub hooks: PluginHooks,
    /// Conflict-resolution priority.
    pub priority: Option<i32>,
}

impl Plugin {
    /// Plugin identity string, `name@version`.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Every capability descriptor declared across this plugin's services.
    pub fn capabilities(&self) -> impl Iterator<Item = &crate::service::CapabilityDescriptor> {
        self.services
            .iter()
            .flat_map(|s| s.descriptor().capabilities.iter())
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("services", &self.services.len())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

/// Builder for constructing [`Plugin`] objects.
pub struct PluginBuilder {
    plugin: Plugin,
}

impl PluginBuilder {
    /// Create a builder with the required identity fields.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            plugin: Plugin {
                name: name.into(),
                version: version.into(),
                description: String::new(),
                author: None,
                dependencies: Vec::new(),
                services: Vec::new(),
                config_schema: None,
                hooks: PluginHooks::new(),
                priority: None,
            },
        }
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.plugin.description = desc.into();
        self
    }

    /// Set the author.
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.plugin.author = Some(author.into());
        self
    }

    /// Add a dependency.
    pub fn dependency(mut self, dep: Dependency) -> Self {
        self.plugin.dependencies.push(dep);
        self
    }

    /// Add a declared service.
    pub fn service(mut self, service: ServiceRef) -> Self {
        self.plugin.services.push(service);
        self
    }

    /// Set the configuration schema.
    pub fn config_schema(mut self, schema: serde_json::Value) -> Self {
        self.plugin.config_schema = Some(schema);
        self
    }

    /// Set the lifecycle hooks.
    pub fn hooks(mut self, hooks: PluginHooks) -> Self {
        self.plugin.hooks = hooks;
        self
    }

    /// Set the conflict-resolution priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.plugin.priority = Some(priority);
        self
    }

    /// Build the plugin.
    pub fn build(self) -> Plugin {
        self.plugin
    }
}

/// Plugin status tracked by the manager; the single source of truth for
/// whether a plugin is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Not loaded.
    Unloaded,
    /// Load in progress.
    Loading,
    /// Loaded and usable.
    Loaded,
    /// Last load or reload failed.
    Failed,
}

impl PluginStatus {
    /// Whether a load may be started from this status.
    pub fn can_load(&self) -> bool {
        matches!(self, Self::Unloaded | Self::Failed)
    }

    /// Whether the plugin is currently usable.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}
