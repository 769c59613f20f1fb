//! Conflict detection and resolution across independently-authored plugins.
//!
//! Detection runs over collected capability metadata
//! ([`crate::service::ServiceDescriptor`]), never over service internals,
//! and always against the full candidate set: the currently-active plugins
//! plus the one about to be activated.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use semver::{Version, VersionReq};

use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::service::CapabilityKind;

/// Category of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Two or more plugins declare the same tool name.
    ToolName,
    /// Two or more plugins declare the same resource URI.
    ResourceUri,
    /// Two or more plugins declare the same prompt name.
    PromptName,
    /// Two or more plugins declare the same service class name.
    ServiceClass,
    /// A dependency is pinned to mutually-exclusive versions.
    Dependency,
    /// The same plugin name is present at two or more versions.
    Version,
}

impl ConflictType {
    /// Short identifier used in conflict ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolName => "tool-name",
            Self::ResourceUri => "resource-uri",
            Self::PromptName => "prompt-name",
            Self::ServiceClass => "service-class",
            Self::Dependency => "dependency",
            Self::Version => "version",
        }
    }

    /// All built-in categories.
    pub fn all() -> [ConflictType; 6] {
        [
            Self::ToolName,
            Self::ResourceUri,
            Self::PromptName,
            Self::ServiceClass,
            Self::Dependency,
            Self::Version,
        ]
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a conflict. Ordered: `Info < Warning < Error < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    /// Informational.
    Info,
    /// Suspicious but tolerable.
    Warning,
    /// Should be resolved before activation.
    Error,
    /// Must block activation.
    Critical,
}

/// Strategy for resolving a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// The first-loaded plugin keeps the resource.
    FirstWins,
    /// The last-loaded plugin keeps the resource.
    LastWins,
    /// The highest-priority plugin keeps the resource.
    Priority,
    /// Disable the contested resource for every involved plugin.
    Disable,
    /// Rename the resource for every plugin but the first.
    Rename,
    /// Requires human intervention; never auto-resolves.
    Manual,
}

/// One plugin involved in a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictParty {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Effective priority (plugin-declared or detector-configured).
    pub priority: Option<i32>,
}

impl ConflictParty {
    /// Plugin identity string.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// The contested resource of a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResource {
    /// Externally-visible identifier (tool name, URI, class name, ...).
    pub identifier: String,
    /// Resource kind label (`tool`, `resource`, `prompt`, `service-class`,
    /// `dependency`, `plugin-version`).
    pub kind: String,
}

/// A detected conflict between two or more plugins.
#[derive(Debug, Clone)]
pub struct PluginConflict {
    /// Unique id within one detection pass.
    pub id: String,
    /// Conflict category.
    pub conflict_type: ConflictType,
    /// Severity.
    pub severity: ConflictSeverity,
    /// Involved plugins, in candidate-set order (= load order).
    pub plugins: Vec<ConflictParty>,
    /// The contested resource.
    pub resource: ConflictResource,
    /// Strategy the detector recommends.
    pub recommended_strategy: ResolutionStrategy,
    /// Strategies a caller may choose instead.
    pub possible_strategies: Vec<ResolutionStrategy>,
}

impl PluginConflict {
    /// Names of the involved plugins.
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Outcome of executing a resolution strategy.
#[derive(Debug, Clone)]
pub struct ConflictResolution {
    /// Conflict that was resolved.
    pub conflict_id: String,
    /// Strategy that was executed.
    pub strategy: ResolutionStrategy,
    /// Human-readable description of what was done.
    pub action: String,
    /// Plugin that keeps the resource, if the strategy picks one.
    pub winner: Option<String>,
    /// Plugins whose use of the resource is disabled.
    pub disabled: Vec<String>,
    /// New identifiers per plugin name, for the rename strategy.
    pub renames: HashMap<String, String>,
    /// Whether the strategy resolved the conflict.
    pub success: bool,
}

/// Custom detection rule run alongside the built-in categories.
pub type ConflictRule = Arc<dyn Fn(&[Arc<Plugin>]) -> Vec<PluginConflict> + Send + Sync>;

/// Configuration for the conflict detector.
#[derive(Clone)]
pub struct DetectorConfig {
    enabled: HashSet<ConflictType>,
    priorities: HashMap<String, i32>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: ConflictType::all().into_iter().collect(),
            priorities: HashMap::new(),
        }
    }
}

impl DetectorConfig {
    /// Create a configuration with every category enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable one category.
    pub fn with_category_disabled(mut self, category: ConflictType) -> Self {
        self.enabled.remove(&category);
        self
    }

    /// Enable one category.
    pub fn with_category_enabled(mut self, category: ConflictType) -> Self {
        self.enabled.insert(category);
        self
    }

    /// Configure a plugin's resolution priority.
    pub fn with_priority(mut self, plugin: impl Into<String>, priority: i32) -> Self {
        self.priorities.insert(plugin.into(), priority);
        self
    }

    /// Whether a category is enabled.
    pub fn is_enabled(&self, category: ConflictType) -> bool {
        self.enabled.contains(&category)
    }
}

impl std::fmt::Debug for DetectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorConfig")
            .field("enabled", &self.enabled.len())
            .field("priorities", &self.priorities.len())
            .finish()
    }
}

/// Detects and resolves naming/version collisions across a plugin set.
pub struct ConflictDetector {
    config: DetectorConfig,
    custom_rules: Mutex<Vec<(String, ConflictRule)>>,
    active: Mutex<HashMap<String, PluginConflict>>,
    resolutions: Mutex<Vec<ConflictResolution>>,
    next_id: AtomicU64,
}

impl ConflictDetector {
    /// Create a detector.
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            custom_rules: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            resolutions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(DetectorConfig::default())
    }

    /// Get the detector configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Register a custom rule run on every detection pass.
    pub fn register_rule<F>(&self, name: impl Into<String>, rule: F)
    where
        F: Fn(&[Arc<Plugin>]) -> Vec<PluginConflict> + Send + Sync + 'static,
    {
        self.custom_rules.lock().push((name.into(), Arc::new(rule)));
    }

    /// Detect conflicts over the full candidate set.
    ///
    /// Conflicts are created fresh on each call; prior unresolved conflicts
    /// do not carry over.
    pub fn detect_conflicts(&self, plugins: &[Arc<Plugin>]) -> Vec<PluginConflict> {
        let mut conflicts = Vec::new();

        for kind in [
            CapabilityKind::Tool,
            CapabilityKind::Resource,
            CapabilityKind::Prompt,
        ] {
            let category = match kind {
                CapabilityKind::Tool => ConflictType::ToolName,
                CapabilityKind::Resource => ConflictType::ResourceUri,
                CapabilityKind::Prompt => ConflictType::PromptName,
            };
            if self.config.is_enabled(category) {
                self.detect_capability_clashes(plugins, kind, category, &mut conflicts);
            }
        }

        if self.config.is_enabled(ConflictType::ServiceClass) {
            self.detect_service_class_clashes(plugins, &mut conflicts);
        }
        if self.config.is_enabled(ConflictType::Dependency) {
            self.detect_dependency_clashes(plugins, &mut conflicts);
        }
        if self.config.is_enabled(ConflictType::Version) {
            self.detect_version_clashes(plugins, &mut conflicts);
        }

        self.run_custom_rules(plugins, &mut conflicts);

        let mut active = self.active.lock();
        active.clear();
        for conflict in &conflicts {
            active.insert(conflict.id.clone(), conflict.clone());
        }

        if !conflicts.is_empty() {
            tracing::warn!(count = conflicts.len(), "plugin conflicts detected");
        }

        conflicts
    }

    /// Execute a resolution strategy for a previously-detected conflict.
    ///
    /// `Manual` always yields `success = false`. Successful resolutions
    /// remove the conflict from the active set and are recorded.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ConflictResolution> {
        let conflict = self
            .active
            .lock()
            .get(conflict_id)
            .cloned()
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;

        let resolution = self.execute_strategy(&conflict, strategy);

        if resolution.success {
            self.active.lock().remove(conflict_id);
        }
        self.resolutions.lock().push(resolution.clone());

        tracing::info!(
            conflict = conflict_id,
            strategy = ?strategy,
            success = resolution.success,
            "conflict resolution executed"
        );

        Ok(resolution)
    }

    /// Conflicts from the most recent detection pass that remain unresolved.
    pub fn active_conflicts(&self) -> Vec<PluginConflict> {
        self.active.lock().values().cloned().collect()
    }

    /// Every recorded resolution.
    pub fn resolutions(&self) -> Vec<ConflictResolution> {
        self.resolutions.lock().clone()
    }

    // Detection passes

    fn detect_capability_clashes(
        &self,
        plugins: &[Arc<Plugin>],
        kind: CapabilityKind,
        category: ConflictType,
        out: &mut Vec<PluginConflict>,
    ) {
        let mut declarers: HashMap<String, Vec<&Arc<Plugin>>> = HashMap::new();

        for plugin in plugins {
            let mut seen = HashSet::new();
            for capability in plugin.capabilities().filter(|c| c.kind == kind) {
                if seen.insert(capability.name.clone()) {
                    declarers
                        .entry(capability.name.clone())
                        .or_default()
                        .push(plugin);
                }
            }
        }

        let mut identifiers: Vec<_> = declarers.into_iter().collect();
        identifiers.sort_by(|a, b| a.0.cmp(&b.0));

        for (identifier, involved) in identifiers {
            if involved.len() < 2 {
                continue;
            }
            let parties = self.parties(&involved);
            out.push(self.build_conflict(
                category,
                ConflictSeverity::Error,
                parties,
                ConflictResource {
                    identifier,
                    kind: kind.as_str().to_string(),
                },
            ));
        }
    }

    fn detect_service_class_clashes(
        &self,
        plugins: &[Arc<Plugin>],
        out: &mut Vec<PluginConflict>,
    ) {
        let mut declarers: HashMap<String, Vec<&Arc<Plugin>>> = HashMap::new();

        for plugin in plugins {
            let mut seen = HashSet::new();
            for service in &plugin.services {
                if seen.insert(service.class_name.clone()) {
                    declarers
                        .entry(service.class_name.clone())
                        .or_default()
                        .push(plugin);
                }
            }
        }

        let mut classes: Vec<_> = declarers.into_iter().collect();
        classes.sort_by(|a, b| a.0.cmp(&b.0));

        for (class_name, involved) in classes {
            if involved.len() < 2 {
                continue;
            }
            let parties = self.parties(&involved);
            out.push(self.build_conflict(
                ConflictType::ServiceClass,
                ConflictSeverity::Warning,
                parties,
                ConflictResource {
                    identifier: class_name,
                    kind: "service-class".to_string(),
                },
            ));
        }
    }

    fn detect_dependency_clashes(&self, plugins: &[Arc<Plugin>], out: &mut Vec<PluginConflict>) {
        let mut pins: HashMap<String, Vec<(&Arc<Plugin>, String)>> = HashMap::new();

        for plugin in plugins {
            for dep in &plugin.dependencies {
                pins.entry(dep.name.clone())
                    .or_default()
                    .push((plugin, dep.version.clone()));
            }
        }

        let mut names: Vec<_> = pins.into_iter().collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));

        for (dep_name, pinned) in names {
            let distinct: HashSet<&str> = pinned.iter().map(|(_, v)| v.as_str()).collect();
            if distinct.len() < 2 {
                continue;
            }
            let requirements: Vec<&str> = distinct.into_iter().collect();
            if !requirements_exclusive(&requirements) {
                continue;
            }

            let involved: Vec<&Arc<Plugin>> = pinned.iter().map(|(p, _)| *p).collect();
            let parties = self.parties(&involved);
            out.push(self.build_conflict(
                ConflictType::Dependency,
                ConflictSeverity::Warning,
                parties,
                ConflictResource {
                    identifier: dep_name,
                    kind: "dependency".to_string(),
                },
            ));
        }
    }

    fn detect_version_clashes(&self, plugins: &[Arc<Plugin>], out: &mut Vec<PluginConflict>) {
        let mut by_name: HashMap<String, Vec<&Arc<Plugin>>> = HashMap::new();

        for plugin in plugins {
            by_name.entry(plugin.name.clone()).or_default().push(plugin);
        }

        let mut names: Vec<_> = by_name.into_iter().collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, involved) in names {
            let versions: HashSet<&str> =
                involved.iter().map(|p| p.version.as_str()).collect();
            if versions.len() < 2 {
                continue;
            }
            let parties = self.parties(&involved);
            out.push(self.build_conflict(
                ConflictType::Version,
                ConflictSeverity::Error,
                parties,
                ConflictResource {
                    identifier: name,
                    kind: "plugin-version".to_string(),
                },
            ));
        }
    }

    fn run_custom_rules(&self, plugins: &[Arc<Plugin>], out: &mut Vec<PluginConflict>) {
        let rules = self.custom_rules.lock().clone();

        for (name, rule) in rules {
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| rule(plugins)));
            match result {
                Ok(mut found) => {
                    for conflict in &mut found {
                        if conflict.id.is_empty() {
                            conflict.id = self.make_id(
                                conflict.conflict_type,
                                &conflict.resource.identifier,
                            );
                        }
                    }
                    out.extend(found);
                }
                Err(_) => {
                    tracing::error!(rule = %name, "custom conflict rule panicked; skipping");
                }
            }
        }
    }

    // Helpers

    fn parties(&self, involved: &[&Arc<Plugin>]) -> Vec<ConflictParty> {
        involved
            .iter()
            .map(|p| ConflictParty {
                name: p.name.clone(),
                version: p.version.clone(),
                priority: p
                    .priority
                    .or_else(|| self.config.priorities.get(&p.name).copied()),
            })
            .collect()
    }

    fn build_conflict(
        &self,
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        plugins: Vec<ConflictParty>,
        resource: ConflictResource,
    ) -> PluginConflict {
        let recommended = recommend_strategy(conflict_type, &plugins);
        PluginConflict {
            id: self.make_id(conflict_type, &resource.identifier),
            conflict_type,
            severity,
            plugins,
            resource,
            recommended_strategy: recommended,
            possible_strategies: possible_strategies(conflict_type),
        }
    }

    fn make_id(&self, conflict_type: ConflictType, identifier: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", conflict_type.as_str(), identifier, n)
    }

    fn execute_strategy(
        &self,
        conflict: &PluginConflict,
        strategy: ResolutionStrategy,
    ) -> ConflictResolution {
        let mut resolution = ConflictResolution {
            conflict_id: conflict.id.clone(),
            strategy,
            action: String::new(),
            winner: None,
            disabled: Vec::new(),
            renames: HashMap::new(),
            success: true,
        };

        // Custom rules may hand over conflicts with no recorded parties;
        // nothing to pick a winner from.
        if conflict.plugins.is_empty() && strategy != ResolutionStrategy::Manual {
            resolution.success = false;
            resolution.action = "no plugins recorded for conflict".to_string();
            return resolution;
        }

        let identifier = &conflict.resource.identifier;
        match strategy {
            ResolutionStrategy::FirstWins => {
                let winner = &conflict.plugins[0];
                resolution.winner = Some(winner.name.clone());
                resolution.disabled = conflict.plugins[1..]
                    .iter()
                    .map(|p| p.name.clone())
                    .collect();
                resolution.action =
                    format!("{} keeps {}; later declarers disabled", winner.name, identifier);
            }
            ResolutionStrategy::LastWins => {
                let winner = &conflict.plugins[conflict.plugins.len() - 1];
                resolution.winner = Some(winner.name.clone());
                resolution.disabled = conflict.plugins[..conflict.plugins.len() - 1]
                    .iter()
                    .map(|p| p.name.clone())
                    .collect();
                resolution.action =
                    format!("{} keeps {}; earlier declarers disabled", winner.name, identifier);
            }
            ResolutionStrategy::Priority => {
                let winner = conflict
                    .plugins
                    .iter()
                    .max_by_key(|p| p.priority.unwrap_or(0))
                    .unwrap_or(&conflict.plugins[0]);
                resolution.winner = Some(winner.name.clone());
                resolution.disabled = conflict
                    .plugins
                    .iter()
                    .filter(|p| p.name != winner.name)
                    .map(|p| p.name.clone())
                    .collect();
                resolution.action = format!(
                    "{} keeps {} by priority {}",
                    winner.name,
                    identifier,
                    winner.priority.unwrap_or(0)
                );
            }
            ResolutionStrategy::Disable => {
                resolution.disabled =
                    conflict.plugins.iter().map(|p| p.name.clone()).collect();
                resolution.action = format!("{} disabled for every declarer", identifier);
            }
            ResolutionStrategy::Rename => {
                let winner = &conflict.plugins[0];
                resolution.winner = Some(winner.name.clone());
                for party in &conflict.plugins[1..] {
                    resolution
                        .renames
                        .insert(party.name.clone(), format!("{}_{}", identifier, party.name));
                }
                resolution.action = format!(
                    "{} kept by {}; later declarers renamed",
                    identifier, winner.name
                );
            }
            ResolutionStrategy::Manual => {
                resolution.success = false;
                resolution.action = "manual intervention required".to_string();
            }
        }

        resolution
    }
}

impl std::fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictDetector")
            .field("config", &self.config)
            .field("custom_rules", &self.custom_rules.lock().len())
            .field("active_conflicts", &self.active.lock().len())
            .finish()
    }
}

fn possible_strategies(conflict_type: ConflictType) -> Vec<ResolutionStrategy> {
    use ResolutionStrategy::*;
    match conflict_type {
        ConflictType::ToolName
        | ConflictType::ResourceUri
        | ConflictType::PromptName
        | ConflictType::ServiceClass => vec![Rename, FirstWins, LastWins, Priority, Disable, Manual],
        ConflictType::Dependency => vec![LastWins, Priority, Manual],
        ConflictType::Version => vec![LastWins, FirstWins, Priority, Disable, Manual],
    }
}

fn recommend_strategy(
    conflict_type: ConflictType,
    parties: &[ConflictParty],
) -> ResolutionStrategy {
    if parties.iter().any(|p| p.priority.is_some()) {
        return ResolutionStrategy::Priority;
    }
    match conflict_type {
        ConflictType::ToolName
        | ConflictType::ResourceUri
        | ConflictType::PromptName
        | ConflictType::ServiceClass => ResolutionStrategy::Rename,
        ConflictType::Dependency | ConflictType::Version => ResolutionStrategy::LastWins,
    }
}

/// Whether a set of distinct requirement strings for one dependency cannot
/// all be satisfied at once.
fn requirements_exclusive(requirements: &[&str]) -> bool {
    let pins: Vec<Option<Version>> = requirements
        .iter()
        .map(|r| Version::parse(r.trim().trim_start_matches('=').trim()).ok())
        .collect();

    // All exact pins: exclusive unless they pin the same version.
    if pins.iter().all(|p| p.is_some()) {
        let versions: Vec<&Version> = pins.iter().flatten().collect();
        return versions.windows(2).any(|w| w[0] != w[1]);
    }

    let reqs: Vec<VersionReq> = requirements
        .iter()
        .filter_map(|r| VersionReq::parse(r).ok())
        .collect();

    // Unparseable strings in the mix: distinct strings, assume exclusive.
    if reqs.len() != requirements.len() && pins.iter().all(|p| p.is_none()) {
        return true;
    }

    // A pin that satisfies every range means the set can coexist.
    for pin in pins.iter().flatten() {
        if reqs.iter().all(|req| req.matches(pin)) {
            return false;
        }
    }

    // Ranges only: tolerate textual differences that may still intersect.
    pins.iter().any(|p| p.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Dependency;
    use crate::plugin::PluginBuilder;
    use crate::service::{
        CallbackService, CallbackServiceFactory, CapabilityDescriptor, ServiceDescriptor,
        ServiceRef,
    };

    fn tool_service(class_name: &str, tool: &str) -> ServiceRef {
        let descriptor = ServiceDescriptor::new(class_name).with_capability(
            CapabilityDescriptor::new(CapabilityKind::Tool, tool, "run"),
        );
        let inner = descriptor.clone();
        ServiceRef::new(Arc::new(CallbackServiceFactory::new(descriptor, move || {
            Ok(CallbackService::new(inner.clone()))
        })))
    }

    fn plugin_with_tool(name: &str, version: &str, tool: &str) -> Arc<Plugin> {
        Arc::new(
            PluginBuilder::new(name, version)
                .service(tool_service(&format!("{}Service", name), tool))
                .build(),
        )
    }

    #[test]
    fn test_tool_name_conflict() {
        let a = plugin_with_tool("alpha", "1.0.0", "search");
        let b = plugin_with_tool("beta", "1.0.0", "search");

        let detector = ConflictDetector::default_config();
        let conflicts = detector.detect_conflicts(&[a, b]);

        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.conflict_type, ConflictType::ToolName);
        assert_eq!(conflict.severity, ConflictSeverity::Error);
        assert_eq!(conflict.resource.identifier, "search");
        assert_eq!(conflict.plugin_names(), vec!["alpha", "beta"]);
        assert_eq!(conflict.recommended_strategy, ResolutionStrategy::Rename);
    }

    #[test]
    fn test_no_conflict_for_distinct_tools() {
        let a = plugin_with_tool("alpha", "1.0.0", "search");
        let b = plugin_with_tool("beta", "1.0.0", "browse");

        let detector = ConflictDetector::default_config();
        assert!(detector.detect_conflicts(&[a, b]).is_empty());
    }

    #[test]
    fn test_version_conflict() {
        let a = plugin_with_tool("alpha", "1.0.0", "one");
        let b = plugin_with_tool("alpha", "2.0.0", "two");

        let detector = ConflictDetector::default_config();
        let conflicts = detector.detect_conflicts(&[a, b]);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Version);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Error);
        assert_eq!(
            conflicts[0].recommended_strategy,
            ResolutionStrategy::LastWins
        );
    }

    #[test]
    fn test_service_class_conflict_is_warning() {
        let a = Arc::new(
            PluginBuilder::new("alpha", "1.0.0")
                .service(tool_service("SharedService", "a-tool"))
                .build(),
        );
        let b = Arc::new(
            PluginBuilder::new("beta", "1.0.0")
                .service(tool_service("SharedService", "b-tool"))
                .build(),
        );

        let detector = ConflictDetector::default_config();
        let conflicts = detector.detect_conflicts(&[a, b]);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::ServiceClass);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Warning);
    }

    #[test]
    fn test_dependency_conflict() {
        let a = Arc::new(
            PluginBuilder::new("alpha", "1.0.0")
                .dependency(Dependency::required("http-client", "1.0.0"))
                .build(),
        );
        let b = Arc::new(
            PluginBuilder::new("beta", "1.0.0")
                .dependency(Dependency::required("http-client", "2.0.0"))
                .build(),
        );

        let detector = ConflictDetector::default_config();
        let conflicts = detector.detect_conflicts(&[a, b]);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Dependency);
        assert_eq!(conflicts[0].resource.identifier, "http-client");
    }

    #[test]
    fn test_compatible_dependency_pins_do_not_conflict() {
        let a = Arc::new(
            PluginBuilder::new("alpha", "1.0.0")
                .dependency(Dependency::required("http-client", "1.2.0"))
                .build(),
        );
        let b = Arc::new(
            PluginBuilder::new("beta", "1.0.0")
                .dependency(Dependency::required("http-client", "^1.0"))
                .build(),
        );

        let detector = ConflictDetector::default_config();
        assert!(detector.detect_conflicts(&[a, b]).is_empty());
    }

    #[test]
    fn test_category_toggle() {
        let a = plugin_with_tool("alpha", "1.0.0", "search");
        let b = plugin_with_tool("beta", "1.0.0", "search");

        let detector = ConflictDetector::new(
            DetectorConfig::new().with_category_disabled(ConflictType::ToolName),
        );
        assert!(detector.detect_conflicts(&[a, b]).is_empty());
    }

    #[test]
    fn test_priority_recommendation() {
        let a = plugin_with_tool("alpha", "1.0.0", "search");
        let b = plugin_with_tool("beta", "1.0.0", "search");

        let detector = ConflictDetector::new(DetectorConfig::new().with_priority("beta", 10));
        let conflicts = detector.detect_conflicts(&[a, b]);

        assert_eq!(
            conflicts[0].recommended_strategy,
            ResolutionStrategy::Priority
        );
    }

    #[test]
    fn test_resolution_strategies() {
        let a = plugin_with_tool("alpha", "1.0.0", "search");
        let b = plugin_with_tool("beta", "1.0.0", "search");

        let detector = ConflictDetector::new(DetectorConfig::new().with_priority("beta", 10));
        let conflicts = detector.detect_conflicts(&[a.clone(), b.clone()]);
        let id = conflicts[0].id.clone();

        let resolution = detector
            .resolve_conflict(&id, ResolutionStrategy::Priority)
            .unwrap();
        assert!(resolution.success);
        assert_eq!(resolution.winner.as_deref(), Some("beta"));
        assert_eq!(resolution.disabled, vec!["alpha".to_string()]);

        // Resolved conflicts leave the active set.
        assert!(detector.active_conflicts().is_empty());
        assert!(matches!(
            detector.resolve_conflict(&id, ResolutionStrategy::Manual),
            Err(Error::ConflictNotFound(_))
        ));

        // Fresh detection; other strategies.
        let conflicts = detector.detect_conflicts(&[a.clone(), b.clone()]);
        let id = conflicts[0].id.clone();

        let manual = detector
            .resolve_conflict(&id, ResolutionStrategy::Manual)
            .unwrap();
        assert!(!manual.success);
        // Manual leaves the conflict active.
        assert_eq!(detector.active_conflicts().len(), 1);

        let rename = detector
            .resolve_conflict(&id, ResolutionStrategy::Rename)
            .unwrap();
        assert!(rename.success);
        assert_eq!(rename.renames.get("beta").unwrap(), "search_beta");

        assert_eq!(detector.resolutions().len(), 3);
    }

    #[test]
    fn test_first_and_last_wins() {
        let a = plugin_with_tool("alpha", "1.0.0", "search");
        let b = plugin_with_tool("beta", "1.0.0", "search");

        let detector = ConflictDetector::default_config();

        let conflicts = detector.detect_conflicts(&[a.clone(), b.clone()]);
        let first = detector
            .resolve_conflict(&conflicts[0].id, ResolutionStrategy::FirstWins)
            .unwrap();
        assert_eq!(first.winner.as_deref(), Some("alpha"));

        let conflicts = detector.detect_conflicts(&[a, b]);
        let last = detector
            .resolve_conflict(&conflicts[0].id, ResolutionStrategy::LastWins)
            .unwrap();
        assert_eq!(last.winner.as_deref(), Some("beta"));
    }

    #[test]
    fn test_custom_rule_runs_and_panics_are_contained() {
        let a = plugin_with_tool("alpha", "1.0.0", "one");

        let detector = ConflictDetector::default_config();
        detector.register_rule("always-flag", |plugins| {
            vec![PluginConflict {
                id: String::new(),
                conflict_type: ConflictType::ToolName,
                severity: ConflictSeverity::Critical,
                plugins: plugins
                    .iter()
                    .map(|p| ConflictParty {
                        name: p.name.clone(),
                        version: p.version.clone(),
                        priority: None,
                    })
                    .collect(),
                resource: ConflictResource {
                    identifier: "flagged".to_string(),
                    kind: "tool".to_string(),
                },
                recommended_strategy: ResolutionStrategy::Manual,
                possible_strategies: vec![ResolutionStrategy::Manual],
            }]
        });
        detector.register_rule("broken", |_| panic!("rule exploded"));

        let conflicts = detector.detect_conflicts(&[a]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Critical);
        assert!(!conflicts[0].id.is_empty());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ConflictSeverity::Critical > ConflictSeverity::Error);
        assert!(ConflictSeverity::Error > ConflictSeverity::Warning);
        assert!(ConflictSeverity::Warning > ConflictSeverity::Info);
    }
}
