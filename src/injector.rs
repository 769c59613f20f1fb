//! Feature injection: isolated dependency-resolution scopes and the
//! permission-gated communication bridge between a plugin and its host.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::plugin::{HookFn, Plugin};
use crate::service::Service;

/// Degree of dependency-resolution separation granted to a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Resolve directly against the host scope. Fully-trusted system
    /// plugins only.
    None,
    /// A child scope holding the plugin's own bindings; host bindings are
    /// visible only with the `parent_services` permission.
    Service,
    /// A disjoint scope with zero visibility into host bindings,
    /// regardless of permissions.
    Full,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        Self::Service
    }
}

impl IsolationLevel {
    /// Short identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Service => "service",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Permission grants for a plugin. Default-deny: every flag is `false`
/// unless explicitly granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginPermissions {
    /// May resolve services from the host scope.
    #[serde(default)]
    pub parent_services: bool,
    /// May register services into the host scope.
    #[serde(default)]
    pub global_registration: bool,
    /// May exchange messages across the bridge.
    #[serde(default)]
    pub cross_plugin_access: bool,
    /// May touch core host systems.
    #[serde(default)]
    pub core_system_access: bool,
}

impl PluginPermissions {
    /// Deny-all permissions.
    pub fn none() -> Self {
        Self::default()
    }

    /// Grant-all permissions, for fully-trusted plugins.
    pub fn all() -> Self {
        Self {
            parent_services: true,
            global_registration: true,
            cross_plugin_access: true,
            core_system_access: true,
        }
    }

    /// Grant `parent_services`.
    pub fn with_parent_services(mut self) -> Self {
        self.parent_services = true;
        self
    }

    /// Grant `global_registration`.
    pub fn with_global_registration(mut self) -> Self {
        self.global_registration = true;
        self
    }

    /// Grant `cross_plugin_access`.
    pub fn with_cross_plugin_access(mut self) -> Self {
        self.cross_plugin_access = true;
        self
    }
}

/// A named dependency-resolution scope.
///
/// Resolution checks local bindings first, then walks to the parent scope
/// when inheritance is enabled.
pub struct ServiceContainer {
    label: String,
    parent: Option<Arc<ServiceContainer>>,
    inherit_parent: bool,
    bindings: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceContainer {
    /// Create a root scope.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            parent: None,
            inherit_parent: false,
            bindings: RwLock::new(HashMap::new()),
        })
    }

    /// Create a child scope of this one.
    pub fn child(
        self: &Arc<Self>,
        label: impl Into<String>,
        inherit_parent: bool,
    ) -> Arc<ServiceContainer> {
        Arc::new(ServiceContainer {
            label: label.into(),
            parent: Some(self.clone()),
            inherit_parent,
            bindings: RwLock::new(HashMap::new()),
        })
    }

    /// Create a disjoint scope with no parent.
    pub fn new_detached(label: impl Into<String>) -> Arc<Self> {
        Self::new_root(label)
    }

    /// Scope label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bind a service under a name.
    pub fn bind(&self, name: impl Into<String>, service: Arc<dyn Service>) {
        self.bindings.write().insert(name.into(), service);
    }

    /// Resolve a binding by name, walking to the parent when inherited.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Service>> {
        if let Some(service) = self.bindings.read().get(name) {
            return Some(service.clone());
        }
        if self.inherit_parent {
            if let Some(parent) = &self.parent {
                return parent.resolve(name);
            }
        }
        None
    }

    /// Remove a binding. Returns whether one existed.
    pub fn remove(&self, name: &str) -> bool {
        self.bindings.write().remove(name).is_some()
    }

    /// Whether a binding resolves from this scope.
    pub fn has(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Names bound locally in this scope.
    pub fn binding_names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    /// Number of local bindings.
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    /// Whether this scope has no local bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Drop every local binding.
    pub fn clear(&self) {
        self.bindings.write().clear();
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("label", &self.label)
            .field("bindings", &self.bindings.read().len())
            .field("has_parent", &self.parent.is_some())
            .field("inherit_parent", &self.inherit_parent)
            .finish()
    }
}

/// A message sent across the bridge.
#[derive(Debug, Clone)]
pub struct BridgeMessage {
    /// Sending plugin.
    pub from: String,
    /// Message topic.
    pub topic: String,
    /// Payload.
    pub payload: serde_json::Value,
}

/// Permission-gated communication channel between a plugin scope and the
/// host scope. Denied calls fail loudly; nothing degrades silently.
pub struct CommunicationBridge {
    plugin_name: String,
    permissions: PluginPermissions,
    child: Arc<ServiceContainer>,
    // None under full isolation: the host scope is unreachable.
    host: Option<Arc<ServiceContainer>>,
    outbox: Mutex<VecDeque<BridgeMessage>>,
}

impl CommunicationBridge {
    fn new(
        plugin_name: String,
        permissions: PluginPermissions,
        child: Arc<ServiceContainer>,
        host: Option<Arc<ServiceContainer>>,
    ) -> Self {
        Self {
            plugin_name,
            permissions,
            child,
            host,
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Resolve a host-scope service. Requires `parent_services`.
    pub fn request_from_parent(&self, name: &str) -> Result<Arc<dyn Service>> {
        if !self.permissions.parent_services {
            return Err(Error::permission_denied(&self.plugin_name, "parentServices"));
        }
        let host = self.host.as_ref().ok_or_else(|| {
            Error::isolation(&self.plugin_name, "host scope not reachable under full isolation")
        })?;
        host.resolve(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Register a service into the host scope. Requires
    /// `global_registration`.
    pub fn provide_to_parent(&self, name: &str, service: Arc<dyn Service>) -> Result<()> {
        if !self.permissions.global_registration {
            return Err(Error::permission_denied(
                &self.plugin_name,
                "globalRegistration",
            ));
        }
        let host = self.host.as_ref().ok_or_else(|| {
            Error::isolation(&self.plugin_name, "host scope not reachable under full isolation")
        })?;
        host.bind(name, service);
        Ok(())
    }

    /// Queue a message for the host. Requires `cross_plugin_access`.
    pub fn send_message(&self, topic: impl Into<String>, payload: serde_json::Value) -> Result<()> {
        if !self.permissions.cross_plugin_access {
            return Err(Error::permission_denied(
                &self.plugin_name,
                "crossPluginAccess",
            ));
        }
        self.outbox.lock().push_back(BridgeMessage {
            from: self.plugin_name.clone(),
            topic: topic.into(),
            payload,
        });
        Ok(())
    }

    /// Host-side: resolve a service from the plugin's scope. Ungated; the
    /// host is trusted.
    pub fn get_from_child(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.child.resolve(name)
    }

    /// Host-side: take every queued message.
    pub fn drain_messages(&self) -> Vec<BridgeMessage> {
        self.outbox.lock().drain(..).collect()
    }
}

impl std::fmt::Debug for CommunicationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationBridge")
            .field("plugin", &self.plugin_name)
            .field("permissions", &self.permissions)
            .field("queued_messages", &self.outbox.lock().len())
            .finish()
    }
}

/// Options for constructing an isolated plugin.
#[derive(Debug, Clone, Default)]
pub struct IsolationOptions {
    /// Isolation level.
    pub isolation_level: IsolationLevel,
    /// Permission grants.
    pub permissions: PluginPermissions,
}

impl IsolationOptions {
    /// Create options for a level with deny-all permissions.
    pub fn new(isolation_level: IsolationLevel) -> Self {
        Self {
            isolation_level,
            permissions: PluginPermissions::none(),
        }
    }

    /// Set the permissions.
    pub fn with_permissions(mut self, permissions: PluginPermissions) -> Self {
        self.permissions = permissions;
        self
    }
}

/// A plugin bound to its isolation scope and bridge.
///
/// At most one instance exists per plugin name at a time; the manager
/// enforces that invariant. Destroyed exactly once via [`destroy`]
/// (subsequent calls are no-ops).
///
/// [`destroy`]: IsolatedPluginInstance::destroy
pub struct IsolatedPluginInstance {
    /// The plugin.
    pub plugin: Arc<Plugin>,
    /// The plugin's resolution scope.
    pub container: Arc<ServiceContainer>,
    /// The communication bridge.
    pub bridge: Arc<CommunicationBridge>,
    /// Effective permissions.
    pub permissions: PluginPermissions,
    /// Effective isolation level.
    pub isolation_level: IsolationLevel,
    // Level None shares the host scope; destroy must not clear it.
    owns_scope: bool,
    bound_services: Mutex<Vec<String>>,
    destroyed: AtomicBool,
}

impl IsolatedPluginInstance {
    /// Whether this instance was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Run the `on_unload` hook and dispose the scope.
    ///
    /// Idempotent, and safe to call on an instance that failed partway
    /// through construction. Hook failures are logged, not raised, so
    /// teardown always completes.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(hook) = &self.plugin.hooks.on_unload {
            if let Err(e) = run_hook(hook).await {
                tracing::warn!(
                    plugin = %self.plugin.name,
                    error = %e,
                    "on_unload hook failed during destroy"
                );
            }
        }

        let bound = std::mem::take(&mut *self.bound_services.lock());
        for name in bound {
            self.container.remove(&name);
        }
        if self.owns_scope {
            self.container.clear();
        }

        tracing::debug!(plugin = %self.plugin.name, "isolated instance destroyed");
    }
}

impl std::fmt::Debug for IsolatedPluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedPluginInstance")
            .field("plugin", &self.plugin.name)
            .field("isolation_level", &self.isolation_level)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

async fn run_hook(hook: &HookFn) -> Result<()> {
    hook().await
}

/// Builds isolated dependency-resolution scopes per plugin.
pub struct FeatureInjector {
    host: Arc<ServiceContainer>,
}

impl FeatureInjector {
    /// Create an injector over the host scope.
    pub fn new(host: Arc<ServiceContainer>) -> Self {
        Self { host }
    }

    /// The host scope.
    pub fn host(&self) -> &Arc<ServiceContainer> {
        &self.host
    }

    /// Construct the isolation scope and bridge for a plugin, run its
    /// `on_load` hook, and eagerly resolve its declared services.
    ///
    /// A failure constructing one service is logged and skipped — partial
    /// capability activation is allowed. A hook failure destroys the
    /// partially-built instance and fails the load.
    pub async fn create_isolated_plugin(
        &self,
        plugin: Arc<Plugin>,
        options: IsolationOptions,
    ) -> Result<IsolatedPluginInstance> {
        let level = options.isolation_level;
        let permissions = options.permissions;
        let scope_label = format!("plugin:{}", plugin.name);

        let (container, owns_scope, bridge_host) = match level {
            IsolationLevel::None => (self.host.clone(), false, Some(self.host.clone())),
            IsolationLevel::Service => (
                self.host.child(scope_label, permissions.parent_services),
                true,
                Some(self.host.clone()),
            ),
            IsolationLevel::Full => (ServiceContainer::new_detached(scope_label), true, None),
        };

        let bridge = Arc::new(CommunicationBridge::new(
            plugin.name.clone(),
            permissions.clone(),
            container.clone(),
            bridge_host,
        ));

        let instance = IsolatedPluginInstance {
            plugin: plugin.clone(),
            container: container.clone(),
            bridge,
            permissions,
            isolation_level: level,
            owns_scope,
            bound_services: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        };

        if let Some(hook) = &plugin.hooks.on_load {
            if let Err(e) = run_hook(hook).await {
                instance.destroy().await;
                return Err(Error::hook_failed(&plugin.name, "on_load", e.to_string()));
            }
        }

        for service_ref in &plugin.services {
            match service_ref.factory.create().await {
                Ok(service) => {
                    container.bind(service_ref.class_name.clone(), service);
                    instance
                        .bound_services
                        .lock()
                        .push(service_ref.class_name.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        plugin = %plugin.name,
                        service = %service_ref.class_name,
                        error = %e,
                        "service construction failed; skipping"
                    );
                }
            }
        }

        tracing::debug!(
            plugin = %plugin.name,
            level = %level,
            services = instance.bound_services.lock().len(),
            "isolation scope constructed"
        );

        Ok(instance)
    }
}

impl std::fmt::Debug for FeatureInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureInjector")
            .field("host_bindings", &self.host.len())
            .finish()
    }
}
