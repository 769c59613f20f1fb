//! Plugin discovery: scanning the plugins root and validating manifests.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::manifest::PluginManifest;

/// Configuration for plugin discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Root directory holding one subdirectory per plugin.
    pub root: PathBuf,
    /// Manifest file names probed inside each plugin directory, in order.
    pub manifest_names: Vec<String>,
}

impl DiscoveryConfig {
    /// Create a discovery configuration for a plugins root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_names: vec!["plugin.toml".to_string(), "plugin.json".to_string()],
        }
    }

    /// Override the probed manifest file names.
    pub fn with_manifest_names(mut self, names: Vec<String>) -> Self {
        self.manifest_names = names;
        self
    }
}

/// A candidate plugin produced by discovery.
///
/// Validity is a property of the candidate, not an error: invalid
/// candidates carry their problems in `validation_errors` and are filtered
/// by callers on `is_valid`.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Plugin name (manifest name, or directory name when the manifest is
    /// unreadable).
    pub name: String,
    /// Plugin version; empty when unknown.
    pub version: String,
    /// Plugin directory.
    pub path: PathBuf,
    /// Resolved entry-point path.
    pub entry_point: PathBuf,
    /// Whether the manifest parsed and validated.
    pub is_valid: bool,
    /// Problems found during validation.
    pub validation_errors: Vec<String>,
    /// The parsed manifest; carries isolation/permission hints.
    pub manifest: PluginManifest,
}

impl DiscoveredPlugin {
    /// Plugin identity string.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Scans a plugins root and produces candidate descriptors.
pub struct PluginDiscovery {
    config: DiscoveryConfig,
}

impl PluginDiscovery {
    /// Create a discovery over a plugins root.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Get the discovery configuration.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Discover a single plugin by directory name.
    ///
    /// Returns `Ok(None)` when no such directory exists — distinct from
    /// "found but invalid", which returns a candidate with
    /// `is_valid = false`.
    pub fn discover_plugin(&self, name: &str) -> Result<Option<DiscoveredPlugin>> {
        let dir = self.config.root.join(name);
        if !dir.is_dir() {
            return Ok(None);
        }

        Ok(Some(self.inspect_dir(name, &dir)))
    }

    /// Scan the whole plugins root and return every candidate, valid and
    /// invalid. A missing root yields an empty list with a warning.
    pub fn discover_plugins(&self) -> Result<Vec<DiscoveredPlugin>> {
        if !self.config.root.is_dir() {
            tracing::warn!(
                "plugins root does not exist: {}",
                self.config.root.display()
            );
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(&self.config.root)?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            candidates.push(self.inspect_dir(&dir_name, &path));
        }

        Ok(candidates)
    }

    fn inspect_dir(&self, dir_name: &str, dir: &Path) -> DiscoveredPlugin {
        let manifest_path = self
            .config
            .manifest_names
            .iter()
            .map(|n| dir.join(n))
            .find(|p| p.is_file());

        let Some(manifest_path) = manifest_path else {
            return self.invalid_candidate(
                dir_name,
                dir,
                PluginManifest::new(dir_name, ""),
                vec![format!(
                    "no manifest file found (looked for {})",
                    self.config.manifest_names.join(", ")
                )],
            );
        };

        let manifest = match PluginManifest::from_file(&manifest_path) {
            Ok(m) => m,
            Err(e) => {
                return self.invalid_candidate(
                    dir_name,
                    dir,
                    PluginManifest::new(dir_name, ""),
                    vec![e.to_string()],
                );
            }
        };

        let errors = manifest.validation_errors();
        let entry_point = if manifest.entry_point.is_empty() {
            PathBuf::new()
        } else {
            dir.join(&manifest.entry_point)
        };

        if errors.is_empty() {
            tracing::debug!("discovered plugin {} at {}", manifest.identity(), dir.display());
        } else {
            tracing::warn!(
                "plugin at {} is invalid: {}",
                dir.display(),
                errors.join("; ")
            );
        }

        DiscoveredPlugin {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            path: dir.to_path_buf(),
            entry_point,
            is_valid: errors.is_empty(),
            validation_errors: errors,
            manifest,
        }
    }

    fn invalid_candidate(
        &self,
        dir_name: &str,
        dir: &Path,
        manifest: PluginManifest,
        errors: Vec<String>,
    ) -> DiscoveredPlugin {
        tracing::warn!(
            "plugin at {} is invalid: {}",
            dir.display(),
            errors.join("; ")
        );

        DiscoveredPlugin {
            name: dir_name.to_string(),
            version: String::new(),
            path: dir.to_path_buf(),
            entry_point: PathBuf::new(),
            is_valid: false,
            validation_errors: errors,
            manifest,
        }
    }
}

impl std::fmt::Debug for PluginDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDiscovery")
            .field("root", &self.config.root)
            .finish()
    }
}
