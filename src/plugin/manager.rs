//! Plugin lifecycle management.
//!
//! Owns plugin instances for the lifetime of one invocation, loads global
//! plugins with a two-pass strategy that lets one plugin's configuration
//! reference secrets provided by another, and derives API-scoped managers
//! that share unchanged instances by reference.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value as JsonValue;

use super::{build_plugin, PluginContext, PluginCreateFn, PluginRegistrations, PluginSnapshot};
use crate::cache::CacheManager;
use crate::config::{ApiPluginConfiguration, PluginConfiguration, VariableMap};
use crate::core::error::{HcResult, HttpcraftError};
use crate::plugin_error;
use crate::vars::{VariableContext, VariableResolver};

/// One loaded plugin instance: its resolved configuration and everything it
/// registered during `setup`.
pub struct LoadedPlugin {
    pub name: String,
    pub config: JsonValue,
    pub registrations: PluginRegistrations,
}

/// Owns plugin instances and publishes their aggregate view.
///
/// The published [`PluginSnapshot`] is refreshed after every load so the
/// variable resolver observes each plugin's secret resolvers before the
/// next plugin's configuration is resolved.
pub struct PluginManager {
    registry: Option<HashMap<&'static str, PluginCreateFn>>,
    plugins: Vec<Arc<LoadedPlugin>>,
    snapshot: Arc<ArcSwap<PluginSnapshot>>,
    config_dir: PathBuf,
    cache: Option<Arc<CacheManager>>,
}

impl PluginManager {
    /// Manager backed by the builtin plugin registry.
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            registry: None,
            plugins: Vec::new(),
            snapshot: Arc::new(ArcSwap::from_pointee(PluginSnapshot::default())),
            config_dir,
            cache: None,
        }
    }

    /// Give loaded plugins a namespace-bound view of the persistent cache.
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Manager with an explicit factory registry. Used by tests.
    pub fn with_registry(
        config_dir: PathBuf,
        registry: HashMap<&'static str, PluginCreateFn>,
    ) -> Self {
        Self {
            registry: Some(registry),
            ..Self::new(config_dir)
        }
    }

    /// Swappable handle onto the aggregate view; hand this to the variable
    /// resolver and the transport layer.
    pub fn handle(&self) -> Arc<ArcSwap<PluginSnapshot>> {
        self.snapshot.clone()
    }

    /// Current aggregate view.
    pub fn snapshot(&self) -> Arc<PluginSnapshot> {
        self.snapshot.load_full()
    }

    pub fn plugins(&self) -> &[Arc<LoadedPlugin>] {
        &self.plugins
    }

    fn create_instance(&self, name: &str) -> HcResult<Arc<dyn super::HttpPlugin>> {
        match &self.registry {
            Some(registry) => {
                let builder = registry
                    .get(name)
                    .ok_or_else(|| plugin_error!("unknown plugin '{name}'"))?;
                Ok(builder())
            }
            None => build_plugin(name),
        }
    }

    /// Load every globally configured plugin.
    ///
    /// Two-pass strategy: plugins whose configuration carries no `{{…}}`
    /// placeholders load first, then placeholder-bearing plugins that look
    /// like secret providers, then the remaining consumers. The aggregate
    /// view is republished after each load, so a consumer's `{{secret.X}}`
    /// resolves against resolvers registered moments earlier.
    pub async fn load_global(
        &mut self,
        configs: &[PluginConfiguration],
        resolver: &VariableResolver,
        ctx: &VariableContext,
    ) -> HcResult<()> {
        for cfg in plan_load_order(configs) {
            self.load_one(&cfg.name, &cfg.config, resolver, ctx).await?;
        }
        Ok(())
    }

    async fn load_one(
        &mut self,
        name: &str,
        config: &VariableMap,
        resolver: &VariableResolver,
        ctx: &VariableContext,
    ) -> HcResult<()> {
        if self.plugins.iter().any(|p| p.name == name) {
            return Err(plugin_error!("plugin '{name}' is declared more than once"));
        }

        let resolved = resolver.resolve_value(&map_to_value(config), ctx).await?;
        let registrations = self.setup_instance(name, resolved.clone()).await?;
        self.plugins.push(Arc::new(LoadedPlugin {
            name: name.to_string(),
            config: resolved,
            registrations,
        }));
        self.publish();
        log::debug!("loaded plugin '{name}'");
        Ok(())
    }

    async fn setup_instance(&self, name: &str, config: JsonValue) -> HcResult<PluginRegistrations> {
        let instance = self.create_instance(name)?;
        let plugin_cache = self
            .cache
            .as_ref()
            .map(|cache| CacheManager::plugin_cache(cache, name));
        let mut ctx =
            PluginContext::new(config, self.config_dir.clone()).with_cache(plugin_cache);
        instance.setup(&mut ctx).await.map_err(|e| match e {
            HttpcraftError::Plugin(_) => e,
            other => HttpcraftError::Plugin(format!("plugin '{name}' setup failed: {other}")),
        })?;
        Ok(ctx.into_registrations())
    }

    /// Derive a manager for one API's plugin override list.
    ///
    /// Each override's configuration is resolved in the current context and
    /// shallow-merged over the global plugin's configuration. A merged
    /// configuration identical to the global one reuses the already-loaded
    /// instance by reference; a differing one gets a fresh instance, placed
    /// after the untouched globals in the order the API declares.
    pub async fn api_scoped(
        &self,
        overrides: &[ApiPluginConfiguration],
        resolver: &VariableResolver,
        ctx: &VariableContext,
    ) -> HcResult<PluginManager> {
        let mut kept = self.plugins.clone();
        let mut scoped = Vec::new();

        for override_cfg in overrides {
            let name = &override_cfg.name;
            let pos = kept.iter().position(|p| &p.name == name).ok_or_else(|| {
                plugin_error!("API-level plugin '{name}' is not declared globally")
            })?;

            let api_config = resolver
                .resolve_value(&map_to_value(&override_cfg.config), ctx)
                .await?;
            let merged = shallow_merge(&kept[pos].config, &api_config);
            if canonical(&merged) == canonical(&kept[pos].config) {
                // Byte-identical merged configuration: share the global
                // instance instead of running setup twice.
                continue;
            }

            let registrations = self.setup_instance(name, merged.clone()).await?;
            kept.remove(pos);
            scoped.push(Arc::new(LoadedPlugin {
                name: name.clone(),
                config: merged,
                registrations,
            }));
        }

        kept.extend(scoped);
        let manager = PluginManager {
            registry: self.registry.clone(),
            plugins: kept,
            snapshot: Arc::new(ArcSwap::from_pointee(PluginSnapshot::default())),
            config_dir: self.config_dir.clone(),
            cache: self.cache.clone(),
        };
        manager.publish();
        Ok(manager)
    }

    fn publish(&self) {
        self.snapshot.store(Arc::new(build_snapshot(&self.plugins)));
    }
}

/// Global load order: placeholder-free configs, then secret providers, then
/// secret consumers, preserving declared order within each group.
fn plan_load_order(configs: &[PluginConfiguration]) -> Vec<&PluginConfiguration> {
    let mut static_configs = Vec::new();
    let mut providers = Vec::new();
    let mut consumers = Vec::new();

    for cfg in configs {
        let serialized = serde_json::to_string(&cfg.config).unwrap_or_default();
        if !serialized.contains("{{") {
            static_configs.push(cfg);
        } else if is_secret_provider(&cfg.name, &serialized) {
            providers.push(cfg);
        } else {
            consumers.push(cfg);
        }
    }

    static_configs.extend(providers);
    static_configs.extend(consumers);
    static_configs
}

/// Heuristic from the configuration shape: a plugin is a secret provider if
/// its config mentions `secretMapping` or its name suggests a secret store.
fn is_secret_provider(name: &str, serialized_config: &str) -> bool {
    if serialized_config.contains("secretMapping") {
        return true;
    }
    let lower = name.to_lowercase();
    lower.contains("secret") || lower.contains("vault") || lower.contains("keystore")
}

fn map_to_value(config: &VariableMap) -> JsonValue {
    JsonValue::Object(config.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Overlay `api` onto `global`, last writer wins per top-level key.
fn shallow_merge(global: &JsonValue, api: &JsonValue) -> JsonValue {
    match (global, api) {
        (JsonValue::Object(global_map), JsonValue::Object(api_map)) => {
            let mut merged = global_map.clone();
            for (key, value) in api_map {
                merged.insert(key.clone(), value.clone());
            }
            JsonValue::Object(merged)
        }
        (JsonValue::Null, other) => other.clone(),
        (_, JsonValue::Null) => global.clone(),
        (_, other) => other.clone(),
    }
}

/// Canonical serialization for configuration identity comparison.
/// `serde_json`'s map keeps keys sorted, so equal trees serialize equally.
fn canonical(value: &JsonValue) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn build_snapshot(plugins: &[Arc<LoadedPlugin>]) -> PluginSnapshot {
    let mut snapshot = PluginSnapshot::default();
    for plugin in plugins {
        let regs = &plugin.registrations;
        snapshot
            .pre_request_hooks
            .extend(regs.pre_request_hooks.iter().cloned());
        snapshot
            .post_response_hooks
            .extend(regs.post_response_hooks.iter().cloned());
        if !regs.variable_sources.is_empty() {
            let entry = snapshot
                .variable_sources
                .entry(plugin.name.clone())
                .or_default();
            for (name, source) in &regs.variable_sources {
                entry.insert(name.clone(), source.clone());
            }
        }
        if !regs.parameterized_sources.is_empty() {
            let entry = snapshot
                .parameterized_sources
                .entry(plugin.name.clone())
                .or_default();
            for (name, source) in &regs.parameterized_sources {
                entry.insert(name.clone(), source.clone());
            }
        }
        snapshot
            .secret_resolvers
            .extend(regs.secret_resolvers.iter().cloned());
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{HttpPlugin, PluginContext};
    use crate::vars::mask::SecretMask;
    use async_trait::async_trait;
    use futures::FutureExt;
    use serde_json::json;

    /// Registers a variable source `value` echoing its configured value.
    struct EchoPlugin;

    #[async_trait]
    impl HttpPlugin for EchoPlugin {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn setup(&self, ctx: &mut PluginContext) -> HcResult<()> {
            let value = ctx
                .config
                .get("value")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            ctx.register_variable_source(
                "value",
                Arc::new(move || {
                    let value = value.clone();
                    async move { Ok(value) }.boxed()
                }),
            );
            Ok(())
        }
    }

    /// Registers a secret resolver backed by the `secretMapping` config key.
    struct MappingSecretsPlugin;

    #[async_trait]
    impl HttpPlugin for MappingSecretsPlugin {
        fn name(&self) -> &'static str {
            "test-secrets"
        }

        async fn setup(&self, ctx: &mut PluginContext) -> HcResult<()> {
            let mapping: HashMap<String, String> = ctx
                .config
                .get("secretMapping")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            ctx.register_secret_resolver(Arc::new(move |name: String| {
                let mapping = mapping.clone();
                async move { Ok(mapping.get(&name).cloned()) }.boxed()
            }));
            Ok(())
        }
    }

    fn create_echo() -> Arc<dyn HttpPlugin> {
        Arc::new(EchoPlugin)
    }

    fn create_secrets() -> Arc<dyn HttpPlugin> {
        Arc::new(MappingSecretsPlugin)
    }

    fn test_registry() -> HashMap<&'static str, PluginCreateFn> {
        let arr: Vec<(&'static str, PluginCreateFn)> =
            vec![("echo", create_echo), ("test-secrets", create_secrets)];
        arr.into_iter().collect()
    }

    fn plugin_cfg(name: &str, config: serde_json::Value) -> PluginConfiguration {
        PluginConfiguration {
            name: name.to_string(),
            path: None,
            npm_package: None,
            config: serde_json::from_value(config).unwrap(),
        }
    }

    #[tokio::test]
    async fn consumer_config_sees_provider_secrets_regardless_of_declared_order() {
        let mut manager = PluginManager::with_registry(PathBuf::from("."), test_registry());
        let mut resolver = VariableResolver::new(Arc::new(SecretMask::new()));
        resolver.set_plugin_handle(manager.handle());
        let ctx = VariableContext::new();

        // The consumer is declared first; the provider heuristic must load
        // test-secrets before it anyway.
        let configs = vec![
            plugin_cfg("echo", json!({"value": "{{secret.API_KEY}}"})),
            plugin_cfg("test-secrets", json!({"secretMapping": {"API_KEY": "k-123"}})),
        ];
        manager.load_global(&configs, &resolver, &ctx).await.unwrap();

        let names: Vec<&str> = manager.plugins().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["test-secrets", "echo"]);
        assert_eq!(
            manager.plugins()[1].config.get("value").unwrap(),
            &json!("k-123")
        );
    }

    #[tokio::test]
    async fn unknown_plugin_name_is_an_error() {
        let mut manager = PluginManager::with_registry(PathBuf::from("."), test_registry());
        let resolver = VariableResolver::new(Arc::new(SecretMask::new()));
        let ctx = VariableContext::new();
        let configs = vec![plugin_cfg("nope", json!({}))];
        let err = manager
            .load_global(&configs, &resolver, &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn identical_api_override_reuses_global_instance() {
        let mut manager = PluginManager::with_registry(PathBuf::from("."), test_registry());
        let mut resolver = VariableResolver::new(Arc::new(SecretMask::new()));
        resolver.set_plugin_handle(manager.handle());
        let ctx = VariableContext::new();

        manager
            .load_global(
                &[plugin_cfg("echo", json!({"value": "global"}))],
                &resolver,
                &ctx,
            )
            .await
            .unwrap();

        // Same effective config: the instance is shared by reference, which
        // also means setup did not run a second time.
        let same = ApiPluginConfiguration {
            name: "echo".to_string(),
            config: serde_json::from_value(json!({"value": "global"})).unwrap(),
        };
        let scoped = manager.api_scoped(&[same], &resolver, &ctx).await.unwrap();
        assert!(Arc::ptr_eq(&scoped.plugins()[0], &manager.plugins()[0]));

        // Different config: fresh instance with merged config.
        let changed = ApiPluginConfiguration {
            name: "echo".to_string(),
            config: serde_json::from_value(json!({"value": "api"})).unwrap(),
        };
        let scoped = manager.api_scoped(&[changed], &resolver, &ctx).await.unwrap();
        assert!(!Arc::ptr_eq(&scoped.plugins()[0], &manager.plugins()[0]));
        assert_eq!(
            scoped.plugins()[0].config.get("value").unwrap(),
            &json!("api")
        );
        // The global manager keeps its original instance untouched.
        assert_eq!(
            manager.plugins()[0].config.get("value").unwrap(),
            &json!("global")
        );
    }

    #[tokio::test]
    async fn api_override_must_name_a_global_plugin() {
        let manager = PluginManager::with_registry(PathBuf::from("."), test_registry());
        let resolver = VariableResolver::new(Arc::new(SecretMask::new()));
        let ctx = VariableContext::new();
        let override_cfg = ApiPluginConfiguration {
            name: "echo".to_string(),
            config: VariableMap::new(),
        };
        let err = manager
            .api_scoped(&[override_cfg], &resolver, &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not declared globally"));
    }

    #[tokio::test]
    async fn overridden_plugins_run_after_untouched_globals() {
        let mut manager = PluginManager::with_registry(PathBuf::from("."), test_registry());
        let mut resolver = VariableResolver::new(Arc::new(SecretMask::new()));
        resolver.set_plugin_handle(manager.handle());
        let ctx = VariableContext::new();

        manager
            .load_global(
                &[
                    plugin_cfg("echo", json!({"value": "global"})),
                    plugin_cfg("test-secrets", json!({"secretMapping": {}})),
                ],
                &resolver,
                &ctx,
            )
            .await
            .unwrap();

        let changed = ApiPluginConfiguration {
            name: "echo".to_string(),
            config: serde_json::from_value(json!({"value": "api"})).unwrap(),
        };
        let scoped = manager.api_scoped(&[changed], &resolver, &ctx).await.unwrap();
        let names: Vec<&str> = scoped.plugins().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["test-secrets", "echo"]);
    }
}
