//! Variable resolution engine.
//!
//! Expands `{{…}}` placeholders from a layered context with a fixed
//! precedence order, resolves scoped names (`env.`, `profile.`, `secret.`,
//! `steps.`, `plugins.`…), evaluates parameterized plugin calls, and tracks
//! every resolved secret for masking.

pub mod jsonpath;
pub mod mask;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::core::error::{HcResult, HttpcraftError};
use crate::plugin::PluginSnapshot;
use mask::SecretMask;
use template::{find_placeholders, parse_function_call, single_placeholder, CallArg};

/// Request state recorded for a completed chain step.
#[derive(Debug, Clone, Default)]
pub struct StepRequestState {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Response state recorded for a completed chain step.
#[derive(Debug, Clone, Default)]
pub struct StepResponseState {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// One prior step, addressable as `steps.<id>.request.*` / `steps.<id>.response.*`.
#[derive(Debug, Clone, Default)]
pub struct StepState {
    pub request: StepRequestState,
    pub response: StepResponseState,
}

/// Layered variable scopes for one request or chain step.
///
/// Precedence, highest first: CLI > step.with pathParams > endpoint > API >
/// chain vars > merged profile > global variables. `env.*`, `secret.*`,
/// `steps.*`, and `plugins.*` are reached through their prefixes only.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub cli: HashMap<String, JsonValue>,
    pub path_params: HashMap<String, JsonValue>,
    pub endpoint: HashMap<String, JsonValue>,
    pub api: HashMap<String, JsonValue>,
    pub chain: HashMap<String, JsonValue>,
    pub profile: HashMap<String, JsonValue>,
    pub global: HashMap<String, JsonValue>,
    pub steps: HashMap<String, StepState>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup_unscoped(&self, name: &str) -> Option<&JsonValue> {
        self.cli
            .get(name)
            .or_else(|| self.path_params.get(name))
            .or_else(|| self.endpoint.get(name))
            .or_else(|| self.api.get(name))
            .or_else(|| self.chain.get(name))
            .or_else(|| self.profile.get(name))
            .or_else(|| self.global.get(name))
    }
}

/// Render a context value for substitution into a string template.
pub fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolves templates against a [`VariableContext`].
///
/// Holds a swappable handle onto the plugin manager's aggregate view so that
/// the two-pass plugin load can publish newly registered secret resolvers
/// and variable sources mid-load.
pub struct VariableResolver {
    plugins: Arc<ArcSwap<PluginSnapshot>>,
    mask: Arc<SecretMask>,
}

impl VariableResolver {
    pub fn new(mask: Arc<SecretMask>) -> Self {
        Self {
            plugins: Arc::new(ArcSwap::from_pointee(PluginSnapshot::default())),
            mask,
        }
    }

    /// Point this resolver at a plugin manager's published view.
    pub fn set_plugin_handle(&mut self, handle: Arc<ArcSwap<PluginSnapshot>>) {
        self.plugins = handle;
    }

    pub fn mask_set(&self) -> Arc<SecretMask> {
        self.mask.clone()
    }

    /// Expand every `{{…}}` occurrence in `template`.
    ///
    /// Optional placeholders that do not resolve become empty strings; any
    /// other unresolved name is a [`HttpcraftError::VariableResolution`].
    pub fn resolve<'a>(
        &'a self,
        template: &'a str,
        ctx: &'a VariableContext,
    ) -> BoxFuture<'a, HcResult<String>> {
        async move {
            let placeholders = find_placeholders(template);
            if placeholders.is_empty() {
                return Ok(template.to_string());
            }
            let mut out = String::new();
            let mut cursor = 0;
            for ph in placeholders {
                out.push_str(&template[cursor..ph.start]);
                match self.resolve_name(&ph.name, ctx).await? {
                    Some(value) => out.push_str(&value),
                    None if ph.optional => {}
                    None => {
                        return Err(HttpcraftError::variable(
                            &ph.name,
                            "variable not found in any scope",
                        ))
                    }
                }
                cursor = ph.end;
            }
            out.push_str(&template[cursor..]);
            Ok(out)
        }
        .boxed()
    }

    /// Walk a JSON tree resolving every string leaf. Non-string scalars pass
    /// through untouched.
    pub fn resolve_value<'a>(
        &'a self,
        value: &'a JsonValue,
        ctx: &'a VariableContext,
    ) -> BoxFuture<'a, HcResult<JsonValue>> {
        async move {
            match value {
                JsonValue::String(s) => Ok(JsonValue::String(self.resolve(s, ctx).await?)),
                JsonValue::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_value(item, ctx).await?);
                    }
                    Ok(JsonValue::Array(out))
                }
                JsonValue::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (k, v) in map {
                        out.insert(k.clone(), self.resolve_value(v, ctx).await?);
                    }
                    Ok(JsonValue::Object(out))
                }
                other => Ok(other.clone()),
            }
        }
        .boxed()
    }

    /// Resolve a headers/params mapping, reporting which entries were solely
    /// an unresolved optional placeholder so the request builder can omit
    /// them entirely.
    pub async fn resolve_with_optional_handling(
        &self,
        entries: &HashMap<String, JsonValue>,
        ctx: &VariableContext,
    ) -> HcResult<(HashMap<String, String>, Vec<String>)> {
        let mut resolved = HashMap::with_capacity(entries.len());
        let mut excluded = Vec::new();

        for (key, value) in entries {
            if let JsonValue::String(s) = value {
                if let Some(ph) = single_placeholder(s) {
                    if ph.optional {
                        match self.resolve_name(&ph.name, ctx).await? {
                            Some(v) => {
                                resolved.insert(key.clone(), v);
                            }
                            None => excluded.push(key.clone()),
                        }
                        continue;
                    }
                }
                resolved.insert(key.clone(), self.resolve(s, ctx).await?);
                continue;
            }
            resolved.insert(key.clone(), value_to_string(value));
        }

        Ok((resolved, excluded))
    }

    /// Resolve one placeholder name. `Ok(None)` means "not found" in a scope
    /// where absence is recoverable (optional placeholders); hard failures
    /// (unresolved secrets, step zero-matches, malformed calls) are errors.
    async fn resolve_name(
        &self,
        name: &str,
        ctx: &VariableContext,
    ) -> HcResult<Option<String>> {
        if let Some(dynamic) = name.strip_prefix('$') {
            return self.resolve_dynamic(name, dynamic).map(Some);
        }

        if let Some(parsed) = parse_function_call(name) {
            let call = parsed.map_err(|reason| HttpcraftError::variable(name, reason))?;
            return self.invoke_parameterized(name, call, ctx).await.map(Some);
        }

        if let Some((scope, rest)) = name.split_once('.') {
            match scope {
                "env" => return Ok(std::env::var(rest).ok()),
                "profile" => return Ok(ctx.profile.get(rest).map(value_to_string)),
                "api" => return Ok(ctx.api.get(rest).map(value_to_string)),
                "endpoint" => return Ok(ctx.endpoint.get(rest).map(value_to_string)),
                "secret" => return self.resolve_secret(name, rest).await.map(Some),
                "steps" => return self.resolve_step(name, rest, ctx).map(Some),
                "plugins" => return self.resolve_plugin_variable(name, rest).await.map(Some),
                _ => {}
            }
        }

        Ok(ctx.lookup_unscoped(name).map(value_to_string))
    }

    fn resolve_dynamic(&self, full: &str, name: &str) -> HcResult<String> {
        match name {
            "timestamp" => Ok(Utc::now().timestamp().to_string()),
            "isoTimestamp" => Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            "randomInt" => Ok(rand::thread_rng().gen::<i32>().to_string()),
            "guid" => Ok(Uuid::new_v4().to_string()),
            _ => Err(HttpcraftError::variable(full, "unknown dynamic variable")),
        }
    }

    /// Iterate registered secret resolvers in registration order, falling
    /// back to the process environment. Resolved values are tracked for
    /// masking before they are returned.
    async fn resolve_secret(&self, full: &str, name: &str) -> HcResult<String> {
        let snapshot = self.plugins.load_full();
        for resolver in &snapshot.secret_resolvers {
            match resolver(name.to_string()).await {
                Ok(Some(value)) => {
                    self.mask.track(&value);
                    return Ok(value);
                }
                Ok(None) => {}
                Err(err) => {
                    log::debug!("secret resolver failed for '{name}': {err}");
                }
            }
        }
        if let Ok(value) = std::env::var(name) {
            self.mask.track(&value);
            return Ok(value);
        }
        Err(HttpcraftError::variable(
            full,
            "no secret resolver or environment variable produced a value",
        ))
    }

    fn resolve_step(
        &self,
        full: &str,
        rest: &str,
        ctx: &VariableContext,
    ) -> HcResult<String> {
        let mut parts = rest.splitn(3, '.');
        let (Some(step_id), Some(side), Some(what)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpcraftError::variable(
                full,
                "expected steps.<id>.request.* or steps.<id>.response.*",
            ));
        };

        let step = ctx.steps.get(step_id).ok_or_else(|| {
            HttpcraftError::variable(full, format!("no completed step with id '{step_id}'"))
        })?;

        let lookup_header = |headers: &HashMap<String, String>, header: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(header))
                .map(|(_, v)| v.clone())
        };

        let body_value = |body: &Option<String>, path: Option<&str>| -> HcResult<String> {
            let body = body.as_deref().ok_or_else(|| {
                HttpcraftError::variable(full, "step recorded no body")
            })?;
            match path {
                None => Ok(body.to_string()),
                Some(path) => {
                    let parsed: JsonValue = serde_json::from_str(body).map_err(|_| {
                        HttpcraftError::variable(full, "step body is not valid JSON")
                    })?;
                    jsonpath::query_as_string(&parsed, path)
                        .map_err(|reason| HttpcraftError::variable(full, reason))
                }
            }
        };

        match side {
            "request" => {
                let req = &step.request;
                match what.split_once('.') {
                    None if what == "url" => Ok(req.url.clone()),
                    None if what == "method" => Ok(req.method.clone()),
                    None if what == "body" => body_value(&req.body, None),
                    Some(("headers", header)) => {
                        lookup_header(&req.headers, header).ok_or_else(|| {
                            HttpcraftError::variable(full, format!("request has no header '{header}'"))
                        })
                    }
                    Some(("body", path)) => body_value(&req.body, Some(path)),
                    _ => Err(HttpcraftError::variable(
                        full,
                        format!("unknown request attribute '{what}'"),
                    )),
                }
            }
            "response" => {
                let resp = &step.response;
                match what.split_once('.') {
                    None if what == "status" => Ok(resp.status.to_string()),
                    None if what == "statusText" => Ok(resp.status_text.clone()),
                    None if what == "body" => body_value(&resp.body, None),
                    Some(("headers", header)) => {
                        lookup_header(&resp.headers, header).ok_or_else(|| {
                            HttpcraftError::variable(full, format!("response has no header '{header}'"))
                        })
                    }
                    Some(("body", path)) => body_value(&resp.body, Some(path)),
                    _ => Err(HttpcraftError::variable(
                        full,
                        format!("unknown response attribute '{what}'"),
                    )),
                }
            }
            other => Err(HttpcraftError::variable(
                full,
                format!("expected 'request' or 'response', got '{other}'"),
            )),
        }
    }

    async fn resolve_plugin_variable(&self, full: &str, rest: &str) -> HcResult<String> {
        let Some((plugin, var)) = rest.split_once('.') else {
            return Err(HttpcraftError::variable(
                full,
                "expected plugins.<plugin>.<variable>",
            ));
        };
        let snapshot = self.plugins.load_full();
        let sources = snapshot.variable_sources.get(plugin).ok_or_else(|| {
            HttpcraftError::variable(full, format!("no loaded plugin named '{plugin}'"))
        })?;
        let source = sources.get(var).ok_or_else(|| {
            HttpcraftError::variable(
                full,
                format!("plugin '{plugin}' registers no variable '{var}'"),
            )
        })?;
        source()
            .await
            .map_err(|err| HttpcraftError::variable(full, format!("variable source failed: {err}")))
    }

    async fn invoke_parameterized(
        &self,
        full: &str,
        call: template::FunctionCall,
        ctx: &VariableContext,
    ) -> HcResult<String> {
        let snapshot = self.plugins.load_full();
        let sources = snapshot
            .parameterized_sources
            .get(&call.plugin)
            .ok_or_else(|| {
                HttpcraftError::variable(full, format!("no loaded plugin named '{}'", call.plugin))
            })?;
        let func = sources.get(&call.func).ok_or_else(|| {
            HttpcraftError::variable(
                full,
                format!(
                    "plugin '{}' registers no parameterized function '{}'",
                    call.plugin, call.func
                ),
            )
        })?;

        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            match arg {
                CallArg::Literal(s) => args.push(s.clone()),
                CallArg::Template(t) => args.push(self.resolve(t, ctx).await?),
            }
        }

        func(args)
            .await
            .map_err(|err| HttpcraftError::variable(full, format!("function call failed: {err}")))
    }
}
