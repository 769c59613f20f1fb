//! Plugin manifest schema and validation.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::injector::{IsolationLevel, PluginPermissions};

/// Plugin dependency specification.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Dependency {
    /// Dependency name.
    pub name: String,
    /// Version requirement (semver).
    pub version: String,
    /// Whether this dependency is optional.
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    /// Create a new required dependency.
    pub fn required(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            optional: false,
        }
    }

    /// Create a new optional dependency.
    pub fn optional(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            optional: true,
        }
    }
}

/// Manifest-declared isolation settings for a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IsolationSettings {
    /// Requested isolation level.
    #[serde(default)]
    pub level: IsolationLevel,
    /// Requested permission grants. Absent grants default to deny.
    #[serde(default)]
    pub permissions: PluginPermissions,
}

/// Plugin manifest defining metadata and requirements.
///
/// One manifest lives in each plugin directory (`plugin.toml` or
/// `plugin.json`) and is schema-validated at discovery time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PluginManifest {
    /// Plugin name (unique identifier).
    pub name: String,

    /// Plugin version.
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Plugin authors.
    #[serde(default)]
    pub authors: Vec<String>,

    /// Plugin license.
    #[serde(default)]
    pub license: Option<String>,

    /// Entry-point module, relative to the plugin directory.
    #[serde(default, rename = "entry-point")]
    pub entry_point: String,

    /// Conflict-resolution priority. Plugins with a priority win
    /// PRIORITY-strategy resolutions.
    #[serde(default)]
    pub priority: Option<i32>,

    /// Plugin tags for categorization.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Plugin dependencies.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Isolation level and permission grants.
    #[serde(default)]
    pub isolation: Option<IsolationSettings>,

    /// Custom metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PluginManifest {
    /// Create a new manifest with required fields.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            authors: Vec::new(),
            license: None,
            entry_point: String::new(),
            dependencies: Vec::new(),
            isolation: None,
            priority: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Load a manifest from a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    /// Parse a manifest from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Parse a manifest from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Validate the manifest, failing on the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::missing_field("name"));
        }

        if self.version.is_empty() {
            return Err(Error::missing_field("version"));
        }

        if self.entry_point.is_empty() {
            return Err(Error::missing_field("entry-point"));
        }

        for dep in &self.dependencies {
            if dep.name.is_empty() {
                return Err(Error::invalid_manifest("dependency with empty name"));
            }
        }

        Ok(())
    }

    /// Collect every validation problem instead of failing on the first.
    ///
    /// Discovery uses this to mark a candidate invalid without raising.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("missing required field: name".to_string());
        }
        if self.version.is_empty() {
            errors.push("missing required field: version".to_string());
        }
        if self.entry_point.is_empty() {
            errors.push("missing required field: entry-point".to_string());
        }
        for dep in &self.dependencies {
            if dep.name.is_empty() {
                errors.push("dependency with empty name".to_string());
            }
        }

        errors
    }

    /// Isolation level declared by the manifest, if any.
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation.as_ref().map(|i| i.level)
    }

    /// Permission grants declared by the manifest. Default-deny when absent.
    pub fn permissions(&self) -> PluginPermissions {
        self.isolation
            .as_ref()
            .map(|i| i.permissions.clone())
            .unwrap_or_default()
    }

    /// Plugin identity string.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Builder for creating manifests.
pub struct ManifestBuilder {
    manifest: PluginManifest,
}

impl ManifestBuilder {
    /// Create a new manifest builder.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            manifest: PluginManifest::new(name, version),
        }
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.manifest.description = Some(desc.into());
        self
    }

    /// Add an author.
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.manifest.authors.push(author.into());
        self
    }

    /// Set the license.
    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.manifest.license = Some(license.into());
        self
    }

    /// Set the entry point.
    pub fn entry_point(mut self, path: impl Into<String>) -> Self {
        self.manifest.entry_point = path.into();
        self
    }

    /// Add a dependency.
    pub fn dependency(mut self, dep: Dependency) -> Self {
        self.manifest.dependencies.push(dep);
        self
    }

    /// Set the isolation settings.
    pub fn isolation(mut self, level: IsolationLevel, permissions: PluginPermissions) -> Self {
        self.manifest.isolation = Some(IsolationSettings { level, permissions });
        self
    }

    /// Set the conflict-resolution priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.manifest.priority = Some(priority);
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.manifest.tags.push(tag.into());
        self
    }

    /// Add metadata.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.manifest.metadata.insert(key.into(), value.into());
        self
    }

    /// Build and validate the manifest.
    pub fn build(self) -> Result<PluginManifest> {
        self.manifest.validate()?;
        Ok(self.manifest)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> PluginManifest {
        self.manifest
    }
}
