//! Service capability metadata and the service invocation seam.
//!
//! Capability metadata is an explicit data structure declared by each
//! service, not derived by reflection: the conflict detector and the
//! pre-binder consume [`ServiceDescriptor`]s, never service internals.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Request payload passed to a bound handler.
pub type Request = serde_json::Value;

/// Response payload returned by a bound handler.
pub type Response = serde_json::Value;

/// Kind of externally-visible capability a service method provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// A callable tool.
    Tool,
    /// A readable resource, addressed by URI.
    Resource,
    /// A prompt template.
    Prompt,
}

impl CapabilityKind {
    /// Short identifier used in cache keys and conflict ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata for one capability exposed by a service method.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CapabilityDescriptor {
    /// Capability kind.
    pub kind: CapabilityKind,
    /// Externally-visible identifier (tool name, resource URI, prompt name).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON schema for the request payload.
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    /// Name of the service method this capability dispatches to.
    pub method_name: String,
    /// Middleware ids to run before the target method.
    #[serde(default)]
    pub middleware: Vec<String>,
    /// Error handler id invoked when the target method fails.
    #[serde(default)]
    pub error_handler: Option<String>,
    /// MIME type for resource capabilities.
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl CapabilityDescriptor {
    /// Create a capability descriptor dispatching to `method_name`.
    pub fn new(
        kind: CapabilityKind,
        name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            description: String::new(),
            input_schema: None,
            method_name: method_name.into(),
            middleware: Vec::new(),
            error_handler: None,
            mime_type: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Set the input schema.
    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Add a middleware id.
    pub fn with_middleware(mut self, id: impl Into<String>) -> Self {
        self.middleware.push(id.into());
        self
    }

    /// Set the error handler id.
    pub fn with_error_handler(mut self, id: impl Into<String>) -> Self {
        self.error_handler = Some(id.into());
        self
    }

    /// Set the MIME type.
    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }
}

/// Collected metadata for a service class: its name and every capability
/// its methods expose.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceDescriptor {
    /// Service class name, unique within a plugin.
    pub class_name: String,
    /// Capabilities exposed by this service.
    pub capabilities: Vec<CapabilityDescriptor>,
}

impl ServiceDescriptor {
    /// Create a descriptor with no capabilities.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            capabilities: Vec::new(),
        }
    }

    /// Add a capability.
    pub fn with_capability(mut self, capability: CapabilityDescriptor) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Capabilities of a given kind.
    pub fn capabilities_of(&self, kind: CapabilityKind) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.capabilities.iter().filter(move |c| c.kind == kind)
    }
}

/// A constructed service instance living inside a resolution scope.
#[async_trait]
pub trait Service: Send + Sync + std::fmt::Debug {
    /// Collected capability metadata for this service.
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Invoke a method by name with a request payload.
    async fn call(&self, method: &str, request: Request) -> Result<Response>;
}

/// Factory producing service instances inside an isolation scope.
///
/// The descriptor is available before any instance exists, so conflict
/// detection can run on candidate plugins that were never activated.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    /// Collected capability metadata for the service this factory builds.
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Construct one service instance.
    async fn create(&self) -> Result<Arc<dyn Service>>;
}

/// A service declared by a plugin: its class name plus the factory the
/// feature injector uses to construct it inside the plugin's scope.
#[derive(Clone)]
pub struct ServiceRef {
    /// Service class name.
    pub class_name: String,
    /// Factory constructing the instance.
    pub factory: Arc<dyn ServiceFactory>,
}

impl ServiceRef {
    /// Create a service reference from a factory.
    pub fn new(factory: Arc<dyn ServiceFactory>) -> Self {
        Self {
            class_name: factory.descriptor().class_name.clone(),
            factory,
        }
    }

    /// Collected capability metadata.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.factory.descriptor()
    }
}

impl std::fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRef")
            .field("class_name", &self.class_name)
            .field(
                "capabilities",
                &self.descriptor().capabilities.len(),
            )
            .finish()
    }
}

type MethodFn =
    Arc<dyn Fn(Request) -> futures::future::BoxFuture<'static, Result<Response>> + Send + Sync>;

/// A [`Service`] built from closures, one per method.
///
/// The common way to implement a service without writing a struct per
/// class; also the backbone of the test suites.
pub struct CallbackService {
    descriptor: ServiceDescriptor,
    methods: std::collections::HashMap<String, MethodFn>,
}

impl CallbackService {
    /// Create an empty service for a descriptor.
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            methods: std::collections::HashMap::new(),
        }
    }

    /// Register a method implementation.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |req| Box::pin(f(req))));
        self
    }
}

#[async_trait]
impl Service for CallbackService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn call(&self, method: &str, request: Request) -> Result<Response> {
        let f = self
            .methods
            .get(method)
            .ok_or_else(|| Error::Invocation(format!("no such method: {}", method)))?
            .clone();
        f(request).await
    }
}

impl std::fmt::Debug for CallbackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackService")
            .field("class_name", &self.descriptor.class_name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// A [`ServiceFactory`] that builds a [`CallbackService`] on demand.
pub struct CallbackServiceFactory {
    descriptor: ServiceDescriptor,
    build: Arc<dyn Fn() -> Result<CallbackService> + Send + Sync>,
}

impl CallbackServiceFactory {
    /// Create a factory from a descriptor and a build closure.
    ///
    /// The closure's descriptor should match the factory's; the factory
    /// descriptor is what conflict detection sees.
    pub fn new<F>(descriptor: ServiceDescriptor, build: F) -> Self
    where
        F: Fn() -> Result<CallbackService> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            build: Arc::new(build),
        }
    }
}

#[async_trait]
impl ServiceFactory for CallbackServiceFactory {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn create(&self) -> Result<Arc<dyn Service>> {
        Ok(Arc::new((self.build)()?))
    }
}

impl std::fmt::Debug for CallbackServiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackServiceFactory")
            .field("class_name", &self.descriptor.class_name)
            .finish()
    }
}
