//! Integration tests for mcp-plugin-host.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use mcp_plugin_host::{
    CallbackService, CallbackServiceFactory, CapabilityDescriptor, CapabilityKind,
    ConflictSeverity, ConflictType, Error, ManagerConfig, ModuleExports, ModuleLoader,
    Plugin, PluginBuilder, PluginManager, PluginStatus, Result, Service, ServiceDescriptor,
    ServiceRef, StaticModuleLoader,
};
use mcp_plugin_host::Export;

// Helpers

fn tool_service(class_name: &str, tool: &str) -> ServiceRef {
    let descriptor = ServiceDescriptor::new(class_name).with_capability(
        CapabilityDescriptor::new(CapabilityKind::Tool, tool, "run")
            .with_description("test tool"),
    );
    let inner = descriptor.clone();
    let tool_name = tool.to_string();
    ServiceRef::new(Arc::new(CallbackServiceFactory::new(descriptor, move || {
        let tool_name = tool_name.clone();
        Ok(CallbackService::new(inner.clone()).method("run", move |req| {
            let tool_name = tool_name.clone();
            async move { Ok(json!({"tool": tool_name, "request": req})) }
        }))
    })))
}

fn tool_plugin(name: &str, version: &str, tool: &str) -> Plugin {
    PluginBuilder::new(name, version)
        .description("integration test plugin")
        .service(tool_service(&format!("{}-service", name), tool))
        .build()
}

/// Write a plugin directory with a manifest and register its module.
fn install_plugin(
    root: &Path,
    modules: &StaticModuleLoader,
    plugin: Plugin,
    manifest_extra: &str,
) {
    let dir = root.join(&plugin.name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("plugin.toml"),
        format!(
            "name = \"{}\"\nversion = \"{}\"\nentry-point = \"module.json\"\n{}",
            plugin.name, plugin.version, manifest_extra
        ),
    )
    .unwrap();

    modules.register(
        dir.join("module.json"),
        ModuleExports::new().with_named(
            "create_plugin",
            Export::Factory(Arc::new(move || Ok(plugin.clone()))),
        ),
    );
}

fn manager_with_modules(root: &Path) -> (PluginManager, Arc<StaticModuleLoader>) {
    let modules = Arc::new(StaticModuleLoader::new());
    let manager = PluginManager::new(ManagerConfig::new(root), modules.clone());
    (manager, modules)
}

// Lifecycle

#[tokio::test]
async fn test_load_marks_plugin_loaded() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    manager.load_plugin("search").await.unwrap();

    assert!(manager.is_plugin_loaded("search"));
    assert_eq!(manager.get_plugin_status("search"), PluginStatus::Loaded);
    assert_eq!(manager.get_active_plugins().len(), 1);
    assert_eq!(
        manager.get_plugin("search").unwrap().identity(),
        "search@1.0.0"
    );
}

#[tokio::test]
async fn test_double_load_is_rejected_without_mutation() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    manager.load_plugin("search").await.unwrap();
    let before = manager.get_plugin("search").unwrap();

    let result = manager.load_plugin("search").await;
    assert!(matches!(result, Err(Error::PluginAlreadyLoaded(_))));

    // Existing state untouched.
    assert_eq!(manager.get_plugin_status("search"), PluginStatus::Loaded);
    let after = manager.get_plugin("search").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
}

#[tokio::test]
async fn test_unload_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    manager.load_plugin("search").await.unwrap();
    manager.unload_plugin("search").await.unwrap();
    assert_eq!(manager.get_plugin_status("search"), PluginStatus::Unloaded);
    assert!(manager.get_active_plugins().is_empty());

    // Second unload warns but does not error.
    manager.unload_plugin("search").await.unwrap();
}

#[tokio::test]
async fn test_reload_of_never_loaded_plugin_loads_it() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    manager.reload_plugin("search").await.unwrap();
    assert!(manager.is_plugin_loaded("search"));
}

#[tokio::test]
async fn test_reload_picks_up_new_module() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    manager.load_plugin("search").await.unwrap();
    assert_eq!(manager.get_plugin("search").unwrap().version, "1.0.0");

    // Replace the module and the manifest behind the loader's back.
    install_plugin(tmp.path(), &modules, tool_plugin("search", "2.0.0", "search"), "");

    manager.reload_plugin("search").await.unwrap();
    assert_eq!(manager.get_plugin("search").unwrap().version, "2.0.0");
}

#[tokio::test]
async fn test_load_missing_plugin_rejects_and_marks_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, _modules) = manager_with_modules(tmp.path());

    let result = manager.load_plugin("missing").await;
    assert!(matches!(result, Err(Error::PluginNotFound(_))));
    assert_eq!(manager.get_plugin_status("missing"), PluginStatus::Failed);
    assert!(!manager.is_plugin_loaded("missing"));
}

#[tokio::test]
async fn test_failed_plugin_can_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());

    // Manifest exists but no module is registered: import fails.
    let dir = tmp.path().join("late");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("plugin.toml"),
        "name = \"late\"\nversion = \"1.0.0\"\nentry-point = \"module.json\"\n",
    )
    .unwrap();

    assert!(manager.load_plugin("late").await.is_err());
    assert_eq!(manager.get_plugin_status("late"), PluginStatus::Failed);

    // Module shows up; retry succeeds.
    modules.register(
        dir.join("module.json"),
        ModuleExports::new().with_named(
            "create_plugin",
            Export::Factory(Arc::new(|| {
                Ok(PluginBuilder::new("late", "1.0.0").build())
            })),
        ),
    );
    manager.load_plugin("late").await.unwrap();
    assert!(manager.is_plugin_loaded("late"));
}

// Concurrency

struct SlowModuleLoader {
    inner: Arc<StaticModuleLoader>,
    delay: Duration,
}

#[async_trait]
impl ModuleLoader for SlowModuleLoader {
    async fn load(&self, path: &Path) -> Result<ModuleExports> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(path).await
    }
}

#[tokio::test]
async fn test_concurrent_loads_of_same_name_yield_one_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let modules = Arc::new(StaticModuleLoader::new());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    let manager = Arc::new(PluginManager::new(
        ManagerConfig::new(tmp.path()),
        Arc::new(SlowModuleLoader {
            inner: modules,
            delay: Duration::from_millis(50),
        }),
    ));

    let (first, second) = tokio::join!(
        manager.load_plugin("search"),
        manager.load_plugin("search"),
    );

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);

    let rejected = if first.is_err() { first } else { second };
    assert!(matches!(
        rejected,
        Err(Error::PluginAlreadyLoading(_)) | Err(Error::PluginAlreadyLoaded(_))
    ));

    assert!(manager.is_plugin_loaded("search"));
    assert!(manager.get_isolated_instance("search").is_some());
    assert_eq!(manager.get_active_plugins().len(), 1);
}

#[tokio::test]
async fn test_batch_load_isolates_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("alpha", "1.0.0", "a"), "");
    install_plugin(tmp.path(), &modules, tool_plugin("beta", "1.0.0", "b"), "");

    let batch = manager
        .load_plugins(&["alpha", "missing", "beta"])
        .await;

    assert_eq!(batch.loaded.len(), 2);
    assert!(batch.loaded.contains(&"alpha".to_string()));
    assert!(batch.loaded.contains(&"beta".to_string()));
    assert_eq!(batch.failed.len(), 1);
    assert_eq!(batch.failed[0].0, "missing");
    assert_eq!(manager.get_plugin_status("missing"), PluginStatus::Failed);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("alpha", "1.0.0", "a"), "");
    install_plugin(tmp.path(), &modules, tool_plugin("beta", "1.0.0", "b"), "");

    manager.load_plugins(&["alpha", "beta"]).await;
    assert_eq!(manager.get_active_plugins().len(), 2);

    manager.cleanup().await;
    assert!(manager.get_active_plugins().is_empty());
    assert!(manager.prebinder().is_empty());

    manager.cleanup().await;
    assert!(manager.get_active_plugins().is_empty());
}

// Conflicts

#[tokio::test]
async fn test_tool_conflict_detected_across_loads() {
    let tmp = tempfile::tempdir().unwrap();
    let modules = Arc::new(StaticModuleLoader::new());
    install_plugin(tmp.path(), &modules, tool_plugin("alpha", "1.0.0", "search"), "");
    install_plugin(tmp.path(), &modules, tool_plugin("beta", "1.0.0", "search"), "");

    // Error-severity conflicts block activation for this host.
    let manager = PluginManager::new(
        ManagerConfig::new(tmp.path()).with_block_on_severity(ConflictSeverity::Error),
        modules,
    );

    manager.load_plugin("alpha").await.unwrap();
    let result = manager.load_plugin("beta").await;

    let Err(Error::CriticalConflict { identifier, .. }) = result else {
        panic!("expected a blocking conflict");
    };
    assert_eq!(identifier, "search");
    assert_eq!(manager.get_plugin_status("beta"), PluginStatus::Failed);
    assert!(manager.is_plugin_loaded("alpha"));

    let conflicts = manager.detector().active_conflicts();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::ToolName);
    assert_eq!(conflict.severity, ConflictSeverity::Error);
    assert_eq!(conflict.resource.identifier, "search");
    assert_eq!(conflict.plugin_names(), vec!["alpha", "beta"]);
}

#[tokio::test]
async fn test_error_conflicts_do_not_block_at_default_severity() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("alpha", "1.0.0", "search"), "");
    install_plugin(tmp.path(), &modules, tool_plugin("beta", "1.0.0", "search"), "");

    // Default threshold is Critical; an Error-severity clash loads, but
    // the detector still reports it.
    manager.load_plugin("alpha").await.unwrap();
    manager.load_plugin("beta").await.unwrap();

    assert_eq!(manager.detector().active_conflicts().len(), 1);
}

// Isolation

#[tokio::test]
async fn test_full_isolation_hides_host_bindings() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());

    // A host-only core service.
    let core = ServiceDescriptor::new("CoreService");
    manager.host_container().bind(
        "CoreService",
        Arc::new(CallbackService::new(core)) as Arc<dyn Service>,
    );

    install_plugin(
        tmp.path(),
        &modules,
        tool_plugin("sandboxed", "1.0.0", "boxed"),
        "[isolation]\nlevel = \"full\"\n\n[isolation.permissions]\nparent-services = true\n",
    );

    manager.load_plugin("sandboxed").await.unwrap();
    let instance = manager.get_isolated_instance("sandboxed").unwrap();

    // Host-only bindings are unreachable regardless of granted permissions.
    assert!(instance.container.resolve("CoreService").is_none());
    assert!(instance.bridge.request_from_parent("CoreService").is_err());
    // The plugin's own service still resolves.
    assert!(instance.container.resolve("sandboxed-service").is_some());
}

#[tokio::test]
async fn test_service_isolation_permission_gate_via_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());

    let core = ServiceDescriptor::new("CoreService");
    manager.host_container().bind(
        "CoreService",
        Arc::new(CallbackService::new(core)) as Arc<dyn Service>,
    );

    install_plugin(
        tmp.path(),
        &modules,
        tool_plugin("trusted", "1.0.0", "t"),
        "[isolation]\nlevel = \"service\"\n\n[isolation.permissions]\nparent-services = true\n",
    );
    install_plugin(
        tmp.path(),
        &modules,
        tool_plugin("untrusted", "1.0.0", "u"),
        "[isolation]\nlevel = \"service\"\n",
    );

    manager.load_plugin("trusted").await.unwrap();
    manager.load_plugin("untrusted").await.unwrap();

    let trusted = manager.get_isolated_instance("trusted").unwrap();
    assert!(trusted.bridge.request_from_parent("CoreService").is_ok());

    let untrusted = manager.get_isolated_instance("untrusted").unwrap();
    let err = untrusted
        .bridge
        .request_from_parent("CoreService")
        .unwrap_err();
    assert!(err.is_permission_denied());
}

// Pre-binding and dispatch

#[tokio::test]
async fn test_loaded_plugin_capabilities_are_dispatchable() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    manager.load_plugin("search").await.unwrap();

    let tools = manager.prebinder().tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].identifier, "search");

    let response = (tools[0].handler)(json!({"q": "rust"})).await.unwrap();
    assert_eq!(response["tool"], "search");
    assert_eq!(response["request"]["q"], "rust");

    let entry = manager.prebinder().get("tool:search:search").unwrap();
    assert_eq!(entry.access_count(), 1);
}

#[tokio::test]
async fn test_prebind_cache_returns_identical_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    manager.load_plugin("search").await.unwrap();
    let plugin = manager.get_plugin("search").unwrap();
    let instance = manager.get_isolated_instance("search").unwrap();

    let first = manager.prebinder().get("tool:search:search").unwrap();

    // A second pre-bind request for the same key reuses the cached entry.
    manager
        .prebinder()
        .prebind_plugin(&plugin, &instance.container)
        .await;
    let second = manager.prebinder().get("tool:search:search").unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first.instance, &second.instance));
}

#[tokio::test]
async fn test_unload_removes_bound_capabilities() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("search", "1.0.0", "search"), "");

    manager.load_plugin("search").await.unwrap();
    assert_eq!(manager.prebinder().tools().len(), 1);

    manager.unload_plugin("search").await.unwrap();
    assert!(manager.prebinder().tools().is_empty());
    assert!(manager.prebinder().get("tool:search:search").is_none());
}

// Introspection

#[tokio::test]
async fn test_plugin_info_aggregates() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, modules) = manager_with_modules(tmp.path());
    install_plugin(tmp.path(), &modules, tool_plugin("alpha", "1.0.0", "a"), "");
    install_plugin(
        tmp.path(),
        &modules,
        tool_plugin("boxed", "1.0.0", "b"),
        "[isolation]\nlevel = \"full\"\n",
    );

    manager.load_plugin("alpha").await.unwrap();
    manager.load_plugin("boxed").await.unwrap();
    let _ = manager.load_plugin("missing").await;

    let info = manager.get_plugin_info();
    assert_eq!(info.total_plugins, 3);
    assert_eq!(info.loaded_count, 2);
    assert_eq!(info.failed_count, 1);
    assert_eq!(info.statuses["alpha"], PluginStatus::Loaded);
    assert_eq!(info.statuses["missing"], PluginStatus::Failed);
    assert_eq!(info.isolation.service, 1);
    assert_eq!(info.isolation.full, 1);
    assert!(info.load_metrics.contains_key("alpha"));
}

#[tokio::test]
async fn test_invalid_manifest_candidate_fails_load() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, _modules) = manager_with_modules(tmp.path());

    let dir = tmp.path().join("broken");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.toml"), "name = \"broken\"\n").unwrap();

    let result = manager.load_plugin("broken").await;
    assert!(matches!(result, Err(Error::Discovery(_))));
    assert_eq!(manager.get_plugin_status("broken"), PluginStatus::Failed);
}
