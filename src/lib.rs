//! # mcp-plugin-host
//!
//! Plugin host runtime for MCP-style servers: discovers, loads, isolates,
//! and manages third-party plugins that contribute callable capabilities
//! (tools, resources, prompts).
//!
//! This crate provides:
//! - **Plugin Discovery** - Scan a plugins root and validate manifests
//! - **Plugin Loading** - Import entry-point modules through a pluggable
//!   [`ModuleLoader`], resolve plugin exports, cache modules
//! - **Conflict Detection** - Detect naming/version collisions across the
//!   active plugin set before activation
//! - **Feature Injection** - Per-plugin isolated resolution scopes with a
//!   permission-gated bridge to the host
//! - **Service Pre-Binding** - Cached bound handlers for every declared
//!   capability, ready for dispatcher registration
//! - **Lifecycle Management** - Load, unload, and hot-reload plugins with
//!   per-name serialization and batch loading
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mcp_plugin_host::{ManagerConfig, PluginManager, FileModuleLoader};
//! use std::sync::Arc;
//!
//! // Create a manager over a plugins root
//! let manager = PluginManager::new(
//!     ManagerConfig::new("./plugins"),
//!     Arc::new(FileModuleLoader::new()),
//! );
//!
//! // Load a plugin and hand its tools to the dispatcher
//! manager.load_plugin("search").await?;
//! for tool in manager.prebinder().tools() {
//!     dispatcher.register_tool(tool);
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `watch`: Filesystem watching for hot reload
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod conflict;
mod discovery;
mod error;
mod injector;
mod loader;
mod manager;
mod manifest;
mod plugin;
mod prebind;
mod service;

#[cfg(feature = "watch")]
mod watcher;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use conflict::{
    ConflictDetector, ConflictParty, ConflictResolution, ConflictResource, ConflictRule,
    ConflictSeverity, ConflictType, DetectorConfig, PluginConflict, ResolutionStrategy,
};
pub use discovery::{DiscoveredPlugin, DiscoveryConfig, PluginDiscovery};
pub use error::{Error, Result};
pub use injector::{
    BridgeMessage, CommunicationBridge, FeatureInjector, IsolatedPluginInstance, IsolationLevel,
    IsolationOptions, PluginPermissions, ServiceContainer,
};
pub use loader::{
    Export, FileModuleLoader, LoadMetrics, LoadedPlugin, LoaderConfig, ModuleExports,
    ModuleLoader, PluginConstructor, PluginFactoryFn, PluginLoader, StaticModuleLoader,
};
pub use manager::{
    BatchLoadResult, IsolationStats, ManagerConfig, PluginHostInfo, PluginManager,
};
pub use manifest::{Dependency, IsolationSettings, ManifestBuilder, PluginManifest};
pub use plugin::{HookFn, Plugin, PluginBuilder, PluginHooks, PluginStatus};
pub use prebind::{
    BoundHandler, ErrorHandler, Middleware, Next, PerformanceMetrics, PreBoundCapability,
    PreBoundService, ServiceAccess, ServicePreBinder,
};
pub use service::{
    CallbackService, CallbackServiceFactory, CapabilityDescriptor, CapabilityKind, Request,
    Response, Service, ServiceDescriptor, ServiceFactory, ServiceRef,
};

#[cfg(feature = "watch")]
pub use watcher::{PluginWatcher, WatchConfig, WatchEvent};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PluginMetrics};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
