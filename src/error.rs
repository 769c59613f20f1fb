//! Error types for plugin host operations.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during plugin host operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Plugin not found in the plugins root.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin already loaded.
    #[error("plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    /// A load for the same plugin is already in flight.
    #[error("plugin already loading: {0}")]
    PluginAlreadyLoading(String),

    /// Discovery failed for a plugin directory.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Invalid manifest.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Missing required field in manifest.
    #[error("missing required manifest field: {0}")]
    MissingManifestField(String),

    /// Manifest parse error.
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// Module import failed.
    #[error("module import failed: {0}")]
    ModuleImport(String),

    /// Module import exceeded the configured timeout.
    #[error("module import timed out after {seconds}s: {entry_point}")]
    LoadTimeout {
        /// Entry point that timed out.
        entry_point: String,
        /// Configured timeout in seconds.
        seconds: u64,
    },

    /// Module exports did not match any recognized plugin shape.
    #[error("no recognized plugin export in module: {0}")]
    UnrecognizedExports(String),

    /// Loaded plugin object failed validation.
    #[error("plugin validation failed: {0}")]
    PluginValidation(String),

    /// A conflict at or above the blocking severity was detected.
    #[error("blocking conflict on {identifier}: {detail}")]
    CriticalConflict {
        /// Contested resource identifier.
        identifier: String,
        /// Conflict description.
        detail: String,
    },

    /// Conflict id not present in the current detection results.
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    /// Isolation scope construction failed.
    #[error("isolation failed for plugin {plugin}: {message}")]
    Isolation {
        /// Plugin name.
        plugin: String,
        /// Failure description.
        message: String,
    },

    /// A plugin lifecycle hook failed.
    #[error("hook {hook} failed for plugin {plugin}: {message}")]
    HookFailed {
        /// Plugin name.
        plugin: String,
        /// Hook name.
        hook: String,
        /// Failure description.
        message: String,
    },

    /// Bridge call without the required permission grant.
    #[error("permission denied for plugin {plugin}: requires {permission}")]
    PermissionDenied {
        /// Plugin name.
        plugin: String,
        /// Permission flag that was missing.
        permission: String,
    },

    /// Service instance construction or resolution failed.
    #[error("service resolution failed for {service}: {message}")]
    ServiceResolution {
        /// Service class name.
        service: String,
        /// Failure description.
        message: String,
    },

    /// Service not bound in the resolution scope.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Capability invocation failed inside a bound handler.
    #[error("capability invocation failed: {0}")]
    Invocation(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Watch error.
    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Watch(String),
}

impl Error {
    /// Create a plugin not found error.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::PluginNotFound(name.into())
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// Create a missing manifest field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingManifestField(field.into())
    }

    /// Create a discovery error.
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a module import error.
    pub fn module_import(msg: impl Into<String>) -> Self {
        Self::ModuleImport(msg.into())
    }

    /// Create an isolation error.
    pub fn isolation(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Isolation {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a hook failure error.
    pub fn hook_failed(
        plugin: impl Into<String>,
        hook: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::HookFailed {
            plugin: plugin.into(),
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Create a permission denied error.
    pub fn permission_denied(plugin: impl Into<String>, permission: impl Into<String>) -> Self {
        Self::PermissionDenied {
            plugin: plugin.into(),
            permission: permission.into(),
        }
    }

    /// Create a service resolution error.
    pub fn service_resolution(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServiceResolution {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error means the plugin itself is unusable
    /// (as opposed to a transient or per-call failure).
    pub fn is_fatal_to_plugin(&self) -> bool {
        matches!(
            self,
            Self::PluginNotFound(_)
                | Self::InvalidManifest(_)
                | Self::MissingManifestField(_)
                | Self::ManifestParse(_)
                | Self::ModuleImport(_)
                | Self::LoadTimeout { .. }
                | Self::UnrecognizedExports(_)
                | Self::PluginValidation(_)
                | Self::CriticalConflict { .. }
                | Self::Isolation { .. }
        )
    }

    /// Returns true if this error is a permission check failure.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}
