//! Request and chain execution.
//!
//! Coordinates one API call end to end — plugin loading, variable context
//! assembly, URL construction, hooks, transport — and walks chains step by
//! step, exposing every completed step's request and response to later
//! steps as `steps.<id>.*` variables.

use std::collections::HashMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use serde_json::Value as JsonValue;

use crate::client::{HttpRequest, HttpResponse, ResponseBody};
use crate::config::loader::LoadedConfig;
use crate::config::{parse_call, ApiDefinition, ChainDefinition, ChainStep, EndpointDefinition, StepOverrides, VariableMap};
use crate::core::app::App;
use crate::core::error::HcResult;
use crate::output::{Diagnostics, Timing};
use crate::plugin::manager::PluginManager;
use crate::plugin::PluginSnapshot;
use crate::utils::url::{append_query, build_url, merge_string_maps};
use crate::vars::{
    value_to_string, StepRequestState, StepResponseState, StepState, VariableContext,
    VariableResolver,
};

/// One invocation's fixed inputs, shared by single requests and chains.
pub struct Invocation<'a> {
    pub app: &'a App,
    pub loaded: &'a LoadedConfig,
    pub cli_vars: VariableMap,
    pub profile: VariableMap,
    pub diag: Diagnostics,
    pub dry_run: bool,
}

/// `step.with` after template resolution.
#[derive(Debug, Default)]
pub struct ResolvedOverrides {
    pub path_params: HashMap<String, JsonValue>,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub body: Option<JsonValue>,
}

/// Outcome of one chain step.
#[derive(Debug)]
pub struct StepExecution {
    pub step_id: String,
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub timing: Option<Timing>,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of a whole chain run.
#[derive(Debug)]
pub struct ChainResult {
    pub chain_name: String,
    pub steps: Vec<StepExecution>,
}

impl ChainResult {
    pub fn success(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.success)
    }

    /// The last successful step's response, the chain's default output.
    pub fn final_response(&self) -> Option<&HttpResponse> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.success)
            .and_then(|s| s.response.as_ref())
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn base_context(inv: &Invocation<'_>) -> VariableContext {
    let mut ctx = VariableContext::new();
    ctx.cli = inv.cli_vars.clone();
    ctx.profile = inv.profile.clone();
    ctx.global = inv.loaded.config.global_variables.clone();
    ctx
}

/// Execute a single `<api> <endpoint>` call.
pub async fn execute_request(
    inv: &Invocation<'_>,
    api_name: &str,
    endpoint_name: &str,
) -> HcResult<(HttpRequest, HttpResponse, Timing)> {
    let mut resolver = inv.app.resolver();
    let mut manager =
        PluginManager::new(inv.loaded.dir.clone()).with_cache(inv.app.cache.clone());
    resolver.set_plugin_handle(manager.handle());

    let mut ctx = base_context(inv);
    inv.diag.verbose(&format!(
        "loading {} global plugin(s)",
        inv.loaded.config.plugins.len()
    ));
    manager
        .load_global(&inv.loaded.config.plugins, &resolver, &ctx)
        .await?;

    let (api, endpoint) = inv.loaded.config.get_endpoint(api_name, endpoint_name)?;
    ctx.api = api.variables.clone();
    ctx.endpoint = endpoint.variables.clone();

    let snapshot = scope_plugins(&manager, api, &mut resolver, &ctx).await?;
    let mut request = build_request(&resolver, &ctx, api, endpoint, None).await?;
    let (response, timing) = send_or_dry_run(inv, &mut request, &snapshot).await?;
    Ok((request, response, timing))
}

/// Execute every step of a chain, stopping on the first failure.
pub async fn execute_chain(inv: &Invocation<'_>, chain_name: &str) -> HcResult<ChainResult> {
    let chain = inv.loaded.config.get_chain(chain_name)?;
    let mut resolver = inv.app.resolver();
    let mut manager =
        PluginManager::new(inv.loaded.dir.clone()).with_cache(inv.app.cache.clone());
    resolver.set_plugin_handle(manager.handle());

    let base = base_context(inv);
    manager
        .load_global(&inv.loaded.config.plugins, &resolver, &base)
        .await?;

    inv.diag
        .chain(&format!("running chain '{chain_name}' ({} steps)", chain.steps.len()));

    let mut result = ChainResult {
        chain_name: chain_name.to_string(),
        steps: Vec::new(),
    };
    let mut prior: HashMap<String, StepState> = HashMap::new();

    for step in &chain.steps {
        inv.diag.step(&step.id, &format!("calling {}", step.call));
        match run_step(inv, &manager, &mut resolver, chain, step, &prior).await {
            Ok((request, response, timing)) => {
                let success = response.status < 400;
                prior.insert(step.id.clone(), make_step_state(&request, &response));
                let error = if success {
                    None
                } else {
                    Some(format!(
                        "HTTP {} {}",
                        response.status, response.status_text
                    ))
                };
                result.steps.push(StepExecution {
                    step_id: step.id.clone(),
                    request: Some(request),
                    response: Some(response),
                    timing: Some(timing),
                    success,
                    error,
                });
                if !success {
                    inv.diag
                        .chain(&format!("step '{}' failed; stopping chain", step.id));
                    break;
                }
            }
            Err(e) => {
                inv.diag
                    .chain(&format!("step '{}' failed; stopping chain", step.id));
                result.steps.push(StepExecution {
                    step_id: step.id.clone(),
                    request: None,
                    response: None,
                    timing: None,
                    success: false,
                    error: Some(format!("{} {e}", e.prefix())),
                });
                break;
            }
        }
    }

    Ok(result)
}

async fn run_step(
    inv: &Invocation<'_>,
    global_manager: &PluginManager,
    resolver: &mut VariableResolver,
    chain: &ChainDefinition,
    step: &ChainStep,
    prior: &HashMap<String, StepState>,
) -> HcResult<(HttpRequest, HttpResponse, Timing)> {
    let (api_name, endpoint_name) = parse_call(&step.call)?;
    let (api, endpoint) = inv.loaded.config.get_endpoint(api_name, endpoint_name)?;

    let mut ctx = base_context(inv);
    ctx.chain = chain.vars.clone();
    ctx.api = api.variables.clone();
    ctx.endpoint = endpoint.variables.clone();
    ctx.steps = prior.clone();

    // A previous step may have pointed the resolver at an API-scoped view.
    resolver.set_plugin_handle(global_manager.handle());
    let snapshot = scope_plugins(global_manager, api, resolver, &ctx).await?;

    let overrides = match &step.with {
        Some(with) => Some(resolve_overrides(resolver, &mut ctx, with).await?),
        None => None,
    };

    let mut request = build_request(resolver, &ctx, api, endpoint, overrides.as_ref()).await?;
    let (response, timing) = send_or_dry_run(inv, &mut request, &snapshot).await?;
    Ok((request, response, timing))
}

/// Apply the API's plugin override list, if any, and point the resolver at
/// the resulting view.
async fn scope_plugins(
    manager: &PluginManager,
    api: &ApiDefinition,
    resolver: &mut VariableResolver,
    ctx: &VariableContext,
) -> HcResult<std::sync::Arc<PluginSnapshot>> {
    if api.plugins.is_empty() {
        return Ok(manager.snapshot());
    }
    let scoped = manager.api_scoped(&api.plugins, resolver, ctx).await?;
    resolver.set_plugin_handle(scoped.handle());
    Ok(scoped.snapshot())
}

/// Resolve `step.with`, injecting pathParams into the context so the
/// endpoint's path template can see them.
async fn resolve_overrides(
    resolver: &VariableResolver,
    ctx: &mut VariableContext,
    with: &StepOverrides,
) -> HcResult<ResolvedOverrides> {
    let mut resolved = ResolvedOverrides::default();

    for (name, value) in &with.path_params {
        resolved
            .path_params
            .insert(name.clone(), resolver.resolve_value(value, ctx).await?);
    }
    for (name, value) in &resolved.path_params {
        ctx.path_params.insert(name.clone(), value.clone());
    }

    let (headers, _) = resolver
        .resolve_with_optional_handling(&with.headers, ctx)
        .await?;
    resolved.headers = headers;
    let (params, _) = resolver
        .resolve_with_optional_handling(&with.params, ctx)
        .await?;
    resolved.params = params;

    if let Some(body) = &with.body {
        resolved.body = Some(resolver.resolve_value(body, ctx).await?);
    }
    Ok(resolved)
}

/// Resolve everything the outgoing request needs and assemble it.
async fn build_request(
    resolver: &VariableResolver,
    ctx: &VariableContext,
    api: &ApiDefinition,
    endpoint: &EndpointDefinition,
    overrides: Option<&ResolvedOverrides>,
) -> HcResult<HttpRequest> {
    let base_url = resolver.resolve(&api.base_url, ctx).await?;
    let path = resolver.resolve(&endpoint.path, ctx).await?;

    let (api_headers, _) = resolver
        .resolve_with_optional_handling(&api.headers, ctx)
        .await?;
    let (api_params, _) = resolver
        .resolve_with_optional_handling(&api.params, ctx)
        .await?;
    let (endpoint_headers, _) = resolver
        .resolve_with_optional_handling(&endpoint.headers, ctx)
        .await?;
    let (endpoint_params, _) = resolver
        .resolve_with_optional_handling(&endpoint.params, ctx)
        .await?;

    let mut header_layers = vec![&api_headers, &endpoint_headers];
    let mut param_layers = vec![&api_params, &endpoint_params];
    if let Some(overrides) = overrides {
        header_layers.push(&overrides.headers);
        param_layers.push(&overrides.params);
    }
    let headers = merge_string_maps(&header_layers);
    let params = merge_string_maps(&param_layers);

    let body = match overrides.and_then(|o| o.body.clone()) {
        Some(body) => Some(body),
        None => match &endpoint.body {
            Some(body) => Some(resolver.resolve_value(body, ctx).await?),
            None => None,
        },
    };

    let mut url = build_url(&base_url, &path);
    if let Some(overrides) = overrides {
        // Targeted second pass: step.with pathParams substitute into any
        // placeholder the generic resolver left behind.
        url = substitute_path_params(&url, &overrides.path_params);
    }
    let url = append_query(&url, &params);

    let mut request = HttpRequest::new(endpoint.method.clone(), url);
    request.headers = headers;
    request.body = body;
    Ok(request)
}

async fn send_or_dry_run(
    inv: &Invocation<'_>,
    request: &mut HttpRequest,
    snapshot: &PluginSnapshot,
) -> HcResult<(HttpResponse, Timing)> {
    inv.diag.request(request);
    let start_time = now_ms();

    let response = if inv.dry_run {
        inv.diag
            .dry_run(&format!("{} {}", request.method, request.url));
        let mut names: Vec<&String> = request.headers.keys().collect();
        names.sort();
        for name in names {
            inv.diag
                .dry_run(&format!("{name}: {}", request.headers[name]));
        }
        if let Some(body) = request.body_text() {
            inv.diag.dry_run(&format!("body: {body}"));
        }
        dry_run_response()
    } else {
        inv.app
            .client
            .execute_with_hooks(request, snapshot)
            .await?
    };

    let timing = Timing {
        start_time,
        end_time: now_ms(),
    };
    inv.diag.response(&response);
    Ok((response, timing))
}

fn dry_run_response() -> HttpResponse {
    HttpResponse {
        status: 200,
        status_text: "OK (DRY RUN)".to_string(),
        headers: HashMap::new(),
        body: ResponseBody::Text(String::new()),
        content_type: None,
        content_length: Some(0),
    }
}

static PATH_PARAM_CACHE: Lazy<std::sync::Mutex<HashMap<String, Regex>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

/// Replace `{{name}}` occurrences in the URL for each path parameter.
/// Names are regex-escaped; replacement text is literal.
fn substitute_path_params(url: &str, path_params: &HashMap<String, JsonValue>) -> String {
    let mut out = url.to_string();
    for (name, value) in path_params {
        let mut cache = PATH_PARAM_CACHE.lock().unwrap();
        let regex = match cache.get(name) {
            Some(regex) => regex.clone(),
            None => {
                let pattern = format!(r"\{{\{{\s*{}\s*\}}\}}", regex::escape(name));
                match Regex::new(&pattern) {
                    Ok(regex) => {
                        cache.insert(name.clone(), regex.clone());
                        regex
                    }
                    Err(_) => continue,
                }
            }
        };
        drop(cache);
        out = regex
            .replace_all(&out, NoExpand(&value_to_string(value)))
            .to_string();
    }
    out
}

fn make_step_state(request: &HttpRequest, response: &HttpResponse) -> StepState {
    StepState {
        request: StepRequestState {
            url: request.url.clone(),
            method: request.method.to_string(),
            headers: request.headers.clone(),
            body: request.body_text(),
        },
        response: StepResponseState {
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            body: response.body.as_text().map(str::to_string),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use std::path::PathBuf;

    fn loaded(yaml: &str) -> LoadedConfig {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate_all("test.yaml").unwrap();
        LoadedConfig {
            config,
            path: PathBuf::from("test.yaml"),
            dir: PathBuf::from("."),
        }
    }

    fn invocation<'a>(app: &'a App, loaded: &'a LoadedConfig) -> Invocation<'a> {
        Invocation {
            app,
            loaded,
            cli_vars: VariableMap::new(),
            profile: VariableMap::new(),
            diag: Diagnostics::new(false, app.mask.clone()),
            dry_run: true,
        }
    }

    #[tokio::test]
    async fn single_request_merges_headers_and_substitutes_path() {
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: https://example.test
    headers:
      X-A: api
    endpoints:
      ep:
        method: GET
        path: /v/{{id}}
        headers:
          X-B: ep
"#,
        );
        let mut inv = invocation(&app, &loaded);
        inv.cli_vars.insert("id".to_string(), json!("42"));

        let (request, response, _) = execute_request(&inv, "api1", "ep").await.unwrap();
        assert_eq!(request.url, "https://example.test/v/42");
        assert_eq!(request.header("X-A"), Some("api"));
        assert_eq!(request.header("X-B"), Some("ep"));
        assert_eq!(response.status_text, "OK (DRY RUN)");
    }

    #[tokio::test]
    async fn optional_params_are_elided_from_the_query() {
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: https://example.test
    endpoints:
      list:
        method: GET
        path: /items
        params:
          pageSize: "{{pageSize}}"
          pageKey: "{{pageKey?}}"
"#,
        );
        let mut inv = invocation(&app, &loaded);
        inv.cli_vars.insert("pageSize".to_string(), json!(25));

        let (request, _, _) = execute_request(&inv, "api1", "list").await.unwrap();
        assert_eq!(request.url, "https://example.test/items?pageSize=25");
    }

    #[tokio::test]
    async fn endpoint_values_override_api_values() {
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: https://example.test
    headers:
      X-Shared: api
    params:
      q: api
    endpoints:
      ep:
        method: GET
        path: /x
        headers:
          X-Shared: ep
        params:
          q: ep
"#,
        );
        let inv = invocation(&app, &loaded);
        let (request, _, _) = execute_request(&inv, "api1", "ep").await.unwrap();
        assert_eq!(request.header("X-Shared"), Some("ep"));
        assert_eq!(request.url, "https://example.test/x?q=ep");
    }

    #[tokio::test]
    async fn missing_endpoint_is_a_config_error() {
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: https://example.test
    endpoints:
      ep: { method: GET, path: /x }
"#,
        );
        let inv = invocation(&app, &loaded);
        assert!(execute_request(&inv, "api1", "missing").await.is_err());
        assert!(execute_request(&inv, "ghost", "ep").await.is_err());
    }

    #[tokio::test]
    async fn chain_steps_run_in_order_with_overrides() {
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  blog:
    baseUrl: https://blog.test
    endpoints:
      createPost:
        method: POST
        path: /posts
        body: { title: "{{title}}" }
      getPost:
        method: GET
        path: /posts/{{postId}}
chains:
  publish:
    vars:
      title: hello
    steps:
      - id: createPost
        call: blog.createPost
      - id: getPost
        call: blog.getPost
        with:
          pathParams:
            postId: "7"
          headers:
            X-Trace: "{{title}}"
"#,
        );
        let inv = invocation(&app, &loaded);
        let result = execute_chain(&inv, "publish").await.unwrap();
        assert!(result.success());
        assert_eq!(result.steps.len(), 2);

        let create = &result.steps[0];
        assert_eq!(
            create.request.as_ref().unwrap().body,
            Some(json!({"title": "hello"}))
        );

        let get = &result.steps[1];
        let request = get.request.as_ref().unwrap();
        assert_eq!(request.url, "https://blog.test/posts/7");
        assert_eq!(request.header("X-Trace"), Some("hello"));
    }

    #[tokio::test]
    async fn chain_stops_on_variable_failure() {
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: https://example.test
    endpoints:
      ok: { method: GET, path: /ok }
      broken: { method: GET, path: "/x/{{missingVar}}" }
chains:
  failing:
    steps:
      - id: first
        call: api1.ok
      - id: second
        call: api1.broken
      - id: never
        call: api1.ok
"#,
        );
        let inv = invocation(&app, &loaded);
        let result = execute_chain(&inv, "failing").await.unwrap();
        assert!(!result.success());
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps[0].success);
        assert!(!result.steps[1].success);
        let error = result.steps[1].error.as_ref().unwrap();
        assert!(error.starts_with("Variable Error:"));
        assert!(error.contains("missingVar"));
        // The default output is the last successful step's response.
        assert!(result.final_response().is_some());
    }

    #[tokio::test]
    async fn later_steps_see_prior_step_state() {
        // Dry-run responses have an empty body, so reference request state.
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: https://example.test
    endpoints:
      first: { method: GET, path: /first }
      echo:
        method: GET
        path: /echo
        headers:
          X-Prior-Url: "{{steps.first.request.url}}"
          X-Prior-Status: "{{steps.first.response.status}}"
chains:
  c:
    steps:
      - id: first
        call: api1.first
      - id: second
        call: api1.echo
"#,
        );
        let inv = invocation(&app, &loaded);
        let result = execute_chain(&inv, "c").await.unwrap();
        assert!(result.success());
        let second = result.steps[1].request.as_ref().unwrap();
        assert_eq!(second.header("X-Prior-Url"), Some("https://example.test/first"));
        assert_eq!(second.header("X-Prior-Status"), Some("200"));
    }

    #[tokio::test]
    async fn resolved_secrets_are_tracked_for_masking() {
        std::env::set_var("HTTPCRAFT_EXEC_SECRET", "wicked-value");
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: https://example.test
    endpoints:
      ep:
        method: GET
        path: /x
        headers:
          Authorization: "Bearer {{secret.HTTPCRAFT_EXEC_SECRET}}"
"#,
        );
        let inv = invocation(&app, &loaded);
        let (request, _, _) = execute_request(&inv, "api1", "ep").await.unwrap();
        assert_eq!(request.header("Authorization"), Some("Bearer wicked-value"));
        // Any diagnostic line passing through the mask hides the value.
        assert_eq!(
            app.mask.mask("Authorization: Bearer wicked-value"),
            "Authorization: Bearer [SECRET]"
        );
    }

    #[tokio::test]
    async fn profile_values_fill_templates_below_cli() {
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: "https://{{host}}"
    endpoints:
      ep: { method: GET, path: "/{{stage}}" }
"#,
        );
        let mut inv = invocation(&app, &loaded);
        inv.profile
            .insert("host".to_string(), json!("profile.example.test"));
        inv.profile.insert("stage".to_string(), json!("dev"));
        inv.cli_vars.insert("stage".to_string(), json!("prod"));

        let (request, _, _) = execute_request(&inv, "api1", "ep").await.unwrap();
        assert_eq!(request.url, "https://profile.example.test/prod");
    }

    #[tokio::test]
    async fn step_body_override_replaces_endpoint_body() {
        let app = App::new().unwrap();
        let loaded = loaded(
            r#"
apis:
  api1:
    baseUrl: https://example.test
    endpoints:
      submit:
        method: POST
        path: /submit
        body: { from: endpoint }
chains:
  c:
    steps:
      - id: only
        call: api1.submit
        with:
          body: { from: step }
"#,
        );
        let inv = invocation(&app, &loaded);
        let result = execute_chain(&inv, "c").await.unwrap();
        assert!(result.success());
        assert_eq!(
            result.steps[0].request.as_ref().unwrap().body,
            Some(json!({"from": "step"}))
        );
    }

    #[test]
    fn path_param_substitution_is_literal_and_global() {
        let params = HashMap::from([
            ("id".to_string(), json!("a$1b")),
            ("other".to_string(), json!(9)),
        ]);
        let url = substitute_path_params("https://x/{{id}}/{{ id }}/{{other}}", &params);
        assert_eq!(url, "https://x/a$1b/a$1b/9");
    }
}
