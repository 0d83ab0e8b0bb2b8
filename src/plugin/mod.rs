//! Plugin subsystem.
//!
//! Plugins are compiled-in registrations chosen by name: the configuration's
//! `plugins:` entries are looked up in a global factory registry, and each
//! instance's `setup` receives a context through which it registers request
//! hooks, variable sources, parameterized functions, and secret resolvers.

pub mod manager;
pub mod oauth2;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;

use crate::cache::PluginCache;
use crate::client::{HttpRequest, HttpResponse};
use crate::core::error::{HcResult, HttpcraftError};

/// Hook run on the request before transport. Receives the request, may
/// rewrite it, and returns it; a failure aborts the surrounding request.
pub type PreRequestHook =
    Arc<dyn Fn(HttpRequest) -> BoxFuture<'static, HcResult<HttpRequest>> + Send + Sync>;

/// Hook run on the response after transport, same transformer shape.
pub type PostResponseHook =
    Arc<dyn Fn(HttpResponse) -> BoxFuture<'static, HcResult<HttpResponse>> + Send + Sync>;

/// Producer behind `plugins.<plugin>.<name>`.
pub type VariableSource = Arc<dyn Fn() -> BoxFuture<'static, HcResult<String>> + Send + Sync>;

/// Producer behind `plugins.<plugin>.<name>(args…)`; receives the resolved
/// string arguments in call order.
pub type ParameterizedVariableSource =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, HcResult<String>> + Send + Sync>;

/// Maps a secret name to a value, or `None` when this resolver does not know
/// the name (the next resolver is consulted).
pub type SecretResolver =
    Arc<dyn Fn(String) -> BoxFuture<'static, HcResult<Option<String>>> + Send + Sync>;

/// Everything one plugin registered during `setup`, in registration order.
#[derive(Default)]
pub struct PluginRegistrations {
    pub pre_request_hooks: Vec<PreRequestHook>,
    pub post_response_hooks: Vec<PostResponseHook>,
    pub variable_sources: Vec<(String, VariableSource)>,
    pub parameterized_sources: Vec<(String, ParameterizedVariableSource)>,
    pub secret_resolvers: Vec<SecretResolver>,
}

/// Setup context handed to [`HttpPlugin::setup`].
pub struct PluginContext {
    /// Effective (merged and template-resolved) plugin configuration
    pub config: JsonValue,
    /// Directory of the configuration file, for resolving relative paths
    pub config_dir: PathBuf,
    /// Persistent cache view bound to this plugin's namespace, when the
    /// invocation carries a cache manager
    pub cache: Option<PluginCache>,
    registrations: PluginRegistrations,
}

impl PluginContext {
    pub fn new(config: JsonValue, config_dir: PathBuf) -> Self {
        Self {
            config,
            config_dir,
            cache: None,
            registrations: PluginRegistrations::default(),
        }
    }

    pub fn with_cache(mut self, cache: Option<PluginCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn register_pre_request_hook(&mut self, hook: PreRequestHook) {
        self.registrations.pre_request_hooks.push(hook);
    }

    pub fn register_post_response_hook(&mut self, hook: PostResponseHook) {
        self.registrations.post_response_hooks.push(hook);
    }

    pub fn register_variable_source(&mut self, name: impl Into<String>, source: VariableSource) {
        self.registrations
            .variable_sources
            .push((name.into(), source));
    }

    pub fn register_parameterized_variable_source(
        &mut self,
        name: impl Into<String>,
        source: ParameterizedVariableSource,
    ) {
        self.registrations
            .parameterized_sources
            .push((name.into(), source));
    }

    pub fn register_secret_resolver(&mut self, resolver: SecretResolver) {
        self.registrations.secret_resolvers.push(resolver);
    }

    pub(crate) fn into_registrations(self) -> PluginRegistrations {
        self.registrations
    }
}

/// A compiled-in plugin.
#[async_trait]
pub trait HttpPlugin: Send + Sync {
    /// Registry name; configuration entries refer to it.
    fn name(&self) -> &'static str;

    /// Inspect `ctx.config` and register hooks and sources.
    async fn setup(&self, ctx: &mut PluginContext) -> HcResult<()>;
}

/// Plugin factory function type
pub type PluginCreateFn = fn() -> Arc<dyn HttpPlugin>;

/// Global registry mapping plugin names to their factory functions.
static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> =
        vec![(oauth2::PLUGIN_NAME, oauth2::create_oauth2_plugin)];
    arr.into_iter().collect()
});

/// Look up a plugin factory by name in the builtin registry.
pub fn build_plugin(name: &str) -> HcResult<Arc<dyn HttpPlugin>> {
    let builder = PLUGIN_BUILDER_REGISTRY.get(name).ok_or_else(|| {
        HttpcraftError::Plugin(format!("unknown plugin '{name}' (not a builtin plugin)"))
    })?;
    Ok(builder())
}

/// Aggregate, ordered view over every loaded plugin's registrations.
///
/// Published by the plugin manager through an `ArcSwap` handle so the
/// variable resolver observes registrations as soon as each plugin loads.
#[derive(Default)]
pub struct PluginSnapshot {
    /// Flattened in plugin order, then within-plugin registration order
    pub pre_request_hooks: Vec<PreRequestHook>,
    pub post_response_hooks: Vec<PostResponseHook>,
    /// plugin name → variable name → source
    pub variable_sources: HashMap<String, HashMap<String, VariableSource>>,
    /// plugin name → function name → source
    pub parameterized_sources: HashMap<String, HashMap<String, ParameterizedVariableSource>>,
    /// Flattened in plugin order
    pub secret_resolvers: Vec<SecretResolver>,
}
