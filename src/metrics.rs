//! Prometheus metrics integration for the plugin host.

use prometheus::{Counter, Histogram, Registry};

/// Configuration for plugin host metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plugin host metrics.
    pub prefix: String,
    /// Whether to collect detailed timing histograms.
    pub detailed_timing: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "plugin_host".to_string(),
            detailed_timing: true,
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable or disable detailed timing.
    pub fn with_detailed_timing(mut self, enabled: bool) -> Self {
        self.detailed_timing = enabled;
        self
    }
}

/// Plugin host metrics collector.
pub struct PluginMetrics {
    config: MetricsConfig,
    registry: Registry,
    plugins_loaded: Counter,
    plugins_unloaded: Counter,
    plugin_errors: Counter,
    conflicts_detected: Counter,
    load_duration: Histogram,
    dispatch_duration: Histogram,
}

impl PluginMetrics {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        let registry = Registry::new();

        let plugins_loaded = Counter::new(
            format!("{}_loaded_total", config.prefix),
            "Total number of plugins loaded",
        )
        .unwrap();

        let plugins_unloaded = Counter::new(
            format!("{}_unloaded_total", config.prefix),
            "Total number of plugins unloaded",
        )
        .unwrap();

        let plugin_errors = Counter::new(
            format!("{}_errors_total", config.prefix),
            "Total number of plugin load/unload errors",
        )
        .unwrap();

        let conflicts_detected = Counter::new(
            format!("{}_conflicts_total", config.prefix),
            "Total number of plugin conflicts detected",
        )
        .unwrap();

        let load_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                format!("{}_load_duration_seconds", config.prefix),
                "Plugin load duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )
        .unwrap();

        let dispatch_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                format!("{}_dispatch_duration_seconds", config.prefix),
                "Bound handler dispatch duration in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )
        .unwrap();

        registry.register(Box::new(plugins_loaded.clone())).ok();
        registry.register(Box::new(plugins_unloaded.clone())).ok();
        registry.register(Box::new(plugin_errors.clone())).ok();
        registry.register(Box::new(conflicts_detected.clone())).ok();
        registry.register(Box::new(load_duration.clone())).ok();
        registry.register(Box::new(dispatch_duration.clone())).ok();

        Self {
            config,
            registry,
            plugins_loaded,
            plugins_unloaded,
            plugin_errors,
            conflicts_detected,
            load_duration,
            dispatch_duration,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a plugin load event.
    pub fn record_load(&self, duration_secs: f64) {
        self.plugins_loaded.inc();
        self.load_duration.observe(duration_secs);
    }

    /// Record a plugin unload event.
    pub fn record_unload(&self) {
        self.plugins_unloaded.inc();
    }

    /// Record a plugin error.
    pub fn record_error(&self) {
        self.plugin_errors.inc();
    }

    /// Record detected conflicts.
    pub fn record_conflicts(&self, count: usize) {
        self.conflicts_detected.inc_by(count as f64);
    }

    /// Record a bound handler dispatch.
    pub fn record_dispatch(&self, duration_secs: f64) {
        self.dispatch_duration.observe(duration_secs);
    }

    /// Get the total number of plugins loaded.
    pub fn plugins_loaded_total(&self) -> u64 {
        self.plugins_loaded.get() as u64
    }

    /// Get the total number of plugins unloaded.
    pub fn plugins_unloaded_total(&self) -> u64 {
        self.plugins_unloaded.get() as u64
    }

    /// Get the total number of plugin errors.
    pub fn plugin_errors_total(&self) -> u64 {
        self.plugin_errors.get() as u64
    }

    /// Get the total number of conflicts detected.
    pub fn conflicts_detected_total(&self) -> u64 {
        self.conflicts_detected.get() as u64
    }
}

impl std::fmt::Debug for PluginMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMetrics")
            .field("config", &self.config)
            .field("plugins_loaded", &self.plugins_loaded_total())
            .field("plugins_unloaded", &self.plugins_unloaded_total())
            .field("plugin_errors", &self.plugin_errors_total())
            .finish()
    }
}
