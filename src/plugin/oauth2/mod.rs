//! OAuth2 authentication plugin.
//!
//! Supports the client-credentials, authorization-code (optionally
//! interactive with PKCE), and refresh-token grants. Tokens are cached in
//! memory and in a pluggable persistent store, keyed by an explicit
//! `cacheKey` or the MD5 of `{tokenUrl, clientId, grantType, scope}`. A
//! pre-request hook injects the `Authorization` header; `accessToken`,
//! `tokenType`, and `getTokenWithScope(scope)` are exposed as variable
//! sources.

pub mod flow;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::client::HttpRequest;
use crate::core::error::{HcResult, HttpcraftError};
use crate::plugin::{HttpPlugin, PluginContext};
use flow::{
    build_authorization_url, generate_pkce, generate_state, is_ci_environment, stdout_is_tty,
    AuthorizationRequest, CallbackServer,
};
use store::{select_store, TokenRecord, TokenStore};

pub const PLUGIN_NAME: &str = "oauth2";

/// Safety margin subtracted from the server-reported expiry.
const EXPIRY_MARGIN_MS: u64 = 60_000;

/// Hard timeout for the interactive browser flow.
const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_CALLBACK_PORT: u16 = 8080;

pub fn create_oauth2_plugin() -> Arc<dyn HttpPlugin> {
    Arc::new(OAuth2Plugin)
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "OAuth2Config::validate_grant"))]
pub struct OAuth2Config {
    #[serde(default = "OAuth2Config::default_grant_type")]
    pub grant_type: String,

    #[validate(length(min = 1))]
    pub token_url: String,
    #[validate(length(min = 1))]
    pub client_id: String,
    pub client_secret: Option<String>,

    pub authorization_url: Option<String>,
    pub authorization_code: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub audience: Option<String>,

    /// `basic` puts credentials in the Authorization header; `post` puts
    /// them in the form body.
    #[serde(default = "OAuth2Config::default_auth_method")]
    pub auth_method: String,

    #[serde(default)]
    pub additional_params: HashMap<String, String>,

    #[serde(default = "OAuth2Config::default_use_pkce")]
    pub use_pkce: bool,
    #[serde(default = "OAuth2Config::default_code_challenge_method")]
    pub code_challenge_method: String,

    /// Explicit override for the interactive-flow auto-detection
    pub interactive: Option<bool>,
    pub callback_port: Option<u16>,
    #[serde(default = "OAuth2Config::default_callback_path")]
    pub callback_path: String,

    pub token_storage: Option<String>,
    pub cache_key: Option<String>,
    pub token_type: Option<String>,

    #[serde(default = "OAuth2Config::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl OAuth2Config {
    fn default_grant_type() -> String {
        "client_credentials".to_string()
    }

    fn default_auth_method() -> String {
        "post".to_string()
    }

    fn default_use_pkce() -> bool {
        true
    }

    fn default_code_challenge_method() -> String {
        "S256".to_string()
    }

    fn default_callback_path() -> String {
        "/callback".to_string()
    }

    fn default_timeout_ms() -> u64 {
        30_000
    }

    fn validate_grant(&self) -> Result<(), ValidationError> {
        if !matches!(
            self.grant_type.as_str(),
            "client_credentials" | "authorization_code" | "refresh_token"
        ) {
            return Err(ValidationError::new("unsupported_grant_type"));
        }
        if !matches!(self.auth_method.as_str(), "post" | "basic") {
            return Err(ValidationError::new("auth_method_must_be_post_or_basic"));
        }
        Ok(())
    }
}

/// Raw token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
    id_token: Option<String>,
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Build a storable record, applying the expiry safety margin.
fn to_record(
    response: TokenEndpointResponse,
    requested_scope: Option<&str>,
    audience: Option<&str>,
    previous_refresh_token: Option<String>,
    now: u64,
) -> TokenRecord {
    let lifetime_ms = response.expires_in.unwrap_or(3600).saturating_mul(1000);
    TokenRecord {
        access_token: response.access_token,
        refresh_token: response.refresh_token.or(previous_refresh_token),
        id_token: response.id_token,
        expires_at: now
            .saturating_add(lifetime_ms)
            .saturating_sub(EXPIRY_MARGIN_MS),
        token_type: response.token_type,
        scope: response.scope.or_else(|| requested_scope.map(str::to_string)),
        audience: audience.map(str::to_string),
    }
}

struct OAuth2State {
    config: OAuth2Config,
    http: reqwest::Client,
    store: Arc<dyn TokenStore>,
    memory: DashMap<String, TokenRecord>,
}

impl OAuth2State {
    fn new(config: OAuth2Config) -> HcResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| {
                HttpcraftError::Internal(format!("failed to build OAuth2 HTTP client: {e}"))
            })?;
        let store: Arc<dyn TokenStore> = Arc::from(select_store(config.token_storage.as_deref()));
        log::debug!("oauth2 token storage tier: {}", store.kind());
        Ok(Self {
            config,
            http,
            store,
            memory: DashMap::new(),
        })
    }

    /// Cache key: explicit `cacheKey` when configured (and no scope
    /// override is in play), else MD5 of the stable identity JSON.
    fn cache_key(&self, scope: Option<&str>, scope_overridden: bool) -> String {
        if let Some(key) = &self.config.cache_key {
            if !scope_overridden {
                return key.clone();
            }
        }
        let identity = serde_json::json!({
            "tokenUrl": self.config.token_url,
            "clientId": self.config.client_id,
            "grantType": self.config.grant_type,
            "scope": scope,
        });
        format!("{:x}", md5::compute(identity.to_string()))
    }

    fn auth_scheme(&self, record: &TokenRecord) -> String {
        self.config
            .token_type
            .clone()
            .or_else(|| record.token_type.clone())
            .unwrap_or_else(|| "Bearer".to_string())
    }

    /// Memory → persistent store → stored refresh token → fresh grant.
    async fn get_access_token(&self, scope_override: Option<&str>) -> HcResult<TokenRecord> {
        let scope = scope_override
            .map(str::to_string)
            .or_else(|| self.config.scope.clone());
        let key = self.cache_key(scope.as_deref(), scope_override.is_some());
        let now = now_ms();

        if let Some(record) = self.memory.get(&key) {
            if !record.is_expired(now) {
                return Ok(record.value().clone());
            }
        }

        let stored = self.store.get(&key).await;
        if let Some(record) = &stored {
            if !record.is_expired(now) {
                self.memory.insert(key.clone(), record.clone());
                return Ok(record.clone());
            }
        }

        if let Some(refresh_token) = stored.as_ref().and_then(|r| r.refresh_token.clone()) {
            match self.refresh(&refresh_token, scope.as_deref()).await {
                Ok(record) => {
                    self.store.set(&key, &record).await;
                    self.memory.insert(key, record.clone());
                    return Ok(record);
                }
                Err(e) => {
                    log::debug!("stored refresh token rejected ({e}); re-acquiring");
                    self.store.delete(&key).await;
                    self.memory.remove(&key);
                }
            }
        }

        let record = self.acquire(scope.as_deref()).await?;
        self.store.set(&key, &record).await;
        self.memory.insert(key, record.clone());
        Ok(record)
    }

    async fn acquire(&self, scope: Option<&str>) -> HcResult<TokenRecord> {
        match self.config.grant_type.as_str() {
            "client_credentials" => {
                let mut form = vec![("grant_type".to_string(), "client_credentials".to_string())];
                if let Some(scope) = scope {
                    form.push(("scope".to_string(), scope.to_string()));
                }
                if let Some(audience) = &self.config.audience {
                    form.push(("audience".to_string(), audience.clone()));
                }
                for (key, value) in &self.config.additional_params {
                    form.push((key.clone(), value.clone()));
                }
                let response = self.request_token(form).await?;
                Ok(to_record(
                    response,
                    scope,
                    self.config.audience.as_deref(),
                    None,
                    now_ms(),
                ))
            }
            "authorization_code" => {
                if self.should_run_interactive() {
                    self.interactive_acquire(scope).await
                } else {
                    let code = self.config.authorization_code.clone().ok_or_else(|| {
                        HttpcraftError::Auth(
                            "authorization_code grant requires 'authorizationCode' (or an interactive terminal)"
                                .to_string(),
                        )
                    })?;
                    let form = vec![
                        ("grant_type".to_string(), "authorization_code".to_string()),
                        ("code".to_string(), code),
                    ];
                    let response = self.request_token(form).await?;
                    Ok(to_record(
                        response,
                        scope,
                        self.config.audience.as_deref(),
                        None,
                        now_ms(),
                    ))
                }
            }
            "refresh_token" => {
                let refresh_token = self.config.refresh_token.clone().ok_or_else(|| {
                    HttpcraftError::Auth(
                        "refresh_token grant requires 'refreshToken' in the plugin config"
                            .to_string(),
                    )
                })?;
                self.refresh(&refresh_token, scope).await
            }
            other => Err(HttpcraftError::Auth(format!(
                "unsupported grant type '{other}'"
            ))),
        }
    }

    async fn refresh(&self, refresh_token: &str, scope: Option<&str>) -> HcResult<TokenRecord> {
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        if let Some(scope) = scope {
            form.push(("scope".to_string(), scope.to_string()));
        }
        let response = self.request_token(form).await?;
        Ok(to_record(
            response,
            scope,
            self.config.audience.as_deref(),
            Some(refresh_token.to_string()),
            now_ms(),
        ))
    }

    /// Auto-detected unless `interactive` is set explicitly: the
    /// authorization-code grant, no pre-provided code, a configured
    /// authorization URL, an attached terminal, and no CI indicator.
    fn should_run_interactive(&self) -> bool {
        if let Some(explicit) = self.config.interactive {
            return explicit;
        }
        self.config.grant_type == "authorization_code"
            && self.config.authorization_code.is_none()
            && self.config.authorization_url.is_some()
            && stdout_is_tty()
            && !is_ci_environment()
    }

    async fn interactive_acquire(&self, scope: Option<&str>) -> HcResult<TokenRecord> {
        let authorization_url = self.config.authorization_url.as_deref().ok_or_else(|| {
            HttpcraftError::Auth("the interactive flow requires 'authorizationUrl'".to_string())
        })?;

        let pkce = self.config.use_pkce.then(generate_pkce);
        let state = generate_state();
        let server = CallbackServer::bind(
            self.config.callback_port.unwrap_or(DEFAULT_CALLBACK_PORT),
            &self.config.callback_path,
        )
        .await?;
        let redirect_uri = server.redirect_uri();

        let url = build_authorization_url(&AuthorizationRequest {
            authorization_url,
            client_id: &self.config.client_id,
            redirect_uri: &redirect_uri,
            state: &state,
            scope,
            audience: self.config.audience.as_deref(),
            additional_params: &self.config.additional_params,
            pkce: pkce.as_ref(),
            code_challenge_method: &self.config.code_challenge_method,
        })?;

        eprintln!("Opening your browser to complete authentication...");
        if webbrowser::open(&url).is_err() {
            eprintln!("Could not open a browser automatically. Visit:\n  {url}");
        }

        let code = server.wait_for_code(&state, INTERACTIVE_TIMEOUT).await?;

        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code),
            ("redirect_uri".to_string(), redirect_uri),
        ];
        if let Some(pkce) = &pkce {
            form.push(("code_verifier".to_string(), pkce.verifier.clone()));
        }
        let response = self.request_token(form).await?;
        Ok(to_record(
            response,
            scope,
            self.config.audience.as_deref(),
            None,
            now_ms(),
        ))
    }

    async fn request_token(
        &self,
        mut form: Vec<(String, String)>,
    ) -> HcResult<TokenEndpointResponse> {
        let mut builder = self.http.post(&self.config.token_url);
        if self.config.auth_method == "basic" {
            builder = builder.basic_auth(
                &self.config.client_id,
                self.config.client_secret.as_deref(),
            );
        } else {
            form.push(("client_id".to_string(), self.config.client_id.clone()));
            if let Some(secret) = &self.config.client_secret {
                form.push(("client_secret".to_string(), secret.clone()));
            }
        }

        let response = builder.form(&form).send().await.map_err(|e| {
            HttpcraftError::Auth(format!("token endpoint request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpcraftError::Auth(format!(
                "token endpoint returned HTTP {}: {body}",
                status.as_u16()
            )));
        }

        response.json::<TokenEndpointResponse>().await.map_err(|e| {
            HttpcraftError::Auth(format!("token endpoint returned malformed JSON: {e}"))
        })
    }
}

pub struct OAuth2Plugin;

#[async_trait]
impl HttpPlugin for OAuth2Plugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn setup(&self, ctx: &mut PluginContext) -> HcResult<()> {
        let config: OAuth2Config = serde_json::from_value(ctx.config.clone()).map_err(|e| {
            HttpcraftError::Plugin(format!("invalid oauth2 plugin config: {e}"))
        })?;
        config.validate().map_err(|e| {
            HttpcraftError::Plugin(format!("invalid oauth2 plugin config: {e}"))
        })?;

        let state = Arc::new(OAuth2State::new(config)?);

        let hook_state = state.clone();
        ctx.register_pre_request_hook(Arc::new(move |mut request: HttpRequest| {
            let state = hook_state.clone();
            async move {
                let record = state.get_access_token(None).await?;
                let scheme = state.auth_scheme(&record);
                request.headers.insert(
                    "Authorization".to_string(),
                    format!("{scheme} {}", record.access_token),
                );
                Ok(request)
            }
            .boxed()
        }));

        let token_state = state.clone();
        ctx.register_variable_source(
            "accessToken",
            Arc::new(move || {
                let state = token_state.clone();
                async move {
                    let record = state.get_access_token(None).await?;
                    Ok(record.access_token)
                }
                .boxed()
            }),
        );

        let type_state = state.clone();
        ctx.register_variable_source(
            "tokenType",
            Arc::new(move || {
                let state = type_state.clone();
                async move {
                    Ok(state
                        .config
                        .token_type
                        .clone()
                        .unwrap_or_else(|| "Bearer".to_string()))
                }
                .boxed()
            }),
        );

        let scope_state = state.clone();
        ctx.register_parameterized_variable_source(
            "getTokenWithScope",
            Arc::new(move |args: Vec<String>| {
                let state = scope_state.clone();
                async move {
                    let [scope] = args.as_slice() else {
                        return Err(HttpcraftError::Plugin(
                            "getTokenWithScope expects exactly one argument".to_string(),
                        ));
                    };
                    let record = state.get_access_token(Some(scope.as_str())).await?;
                    Ok(record.access_token)
                }
                .boxed()
            }),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_config() -> OAuth2Config {
        serde_json::from_value(json!({
            "tokenUrl": "https://auth.example.test/token",
            "clientId": "client-1",
        }))
        .unwrap()
    }

    #[test]
    fn config_defaults_are_applied() {
        let config = minimal_config();
        config.validate().unwrap();
        assert_eq!(config.grant_type, "client_credentials");
        assert_eq!(config.auth_method, "post");
        assert!(config.use_pkce);
        assert_eq!(config.code_challenge_method, "S256");
        assert_eq!(config.callback_path, "/callback");
        assert_eq!(config.timeout_ms, 30_000);
    }

    #[test]
    fn config_rejects_unknown_grant_and_auth_method() {
        let mut config = minimal_config();
        config.grant_type = "password".to_string();
        assert!(config.validate().is_err());

        let mut config = minimal_config();
        config.auth_method = "query".to_string();
        assert!(config.validate().is_err());
    }

    fn state_with(config: OAuth2Config) -> OAuth2State {
        let mut config = config;
        // Memory storage keeps tests away from the keychain and filesystem.
        config.token_storage = Some("memory".to_string());
        OAuth2State::new(config).unwrap()
    }

    #[test]
    fn cache_key_is_stable_and_scope_sensitive() {
        let state = state_with(minimal_config());
        let read = state.cache_key(Some("read"), false);
        assert_eq!(read, state.cache_key(Some("read"), false));
        assert_ne!(read, state.cache_key(Some("write"), false));
        assert_ne!(read, state.cache_key(None, false));
        // 32 hex chars of MD5
        assert_eq!(read.len(), 32);
        assert!(read.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn explicit_cache_key_wins_unless_scope_overridden() {
        let mut config = minimal_config();
        config.cache_key = Some("shared-token".to_string());
        let state = state_with(config);
        assert_eq!(state.cache_key(Some("read"), false), "shared-token");
        assert_ne!(state.cache_key(Some("read"), true), "shared-token");
    }

    #[test]
    fn record_expiry_carries_safety_margin() {
        let response = TokenEndpointResponse {
            access_token: "tok".to_string(),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3600),
            refresh_token: None,
            scope: None,
            id_token: None,
        };
        let record = to_record(response, Some("read"), None, None, 1_000_000);
        assert_eq!(record.expires_at, 1_000_000 + 3_600_000 - 60_000);
        assert_eq!(record.scope.as_deref(), Some("read"));
    }

    #[test]
    fn refresh_preserves_previous_refresh_token() {
        let response = TokenEndpointResponse {
            access_token: "tok-2".to_string(),
            token_type: None,
            expires_in: Some(60),
            refresh_token: None,
            scope: None,
            id_token: None,
        };
        let record = to_record(response, None, None, Some("keep-me".to_string()), 0);
        assert_eq!(record.refresh_token.as_deref(), Some("keep-me"));
    }

    #[test]
    fn explicit_interactive_flag_overrides_detection() {
        let mut config = minimal_config();
        config.grant_type = "authorization_code".to_string();
        config.interactive = Some(false);
        config.authorization_url = Some("https://auth.example.test/authorize".to_string());
        let state = state_with(config.clone());
        assert!(!state.should_run_interactive());

        config.interactive = Some(true);
        let state = state_with(config);
        assert!(state.should_run_interactive());
    }

    #[test]
    fn auth_scheme_prefers_configured_type() {
        let mut config = minimal_config();
        config.token_type = Some("DPoP".to_string());
        let state = state_with(config);
        let record = TokenRecord {
            access_token: "t".to_string(),
            refresh_token: None,
            id_token: None,
            expires_at: 0,
            token_type: Some("Bearer".to_string()),
            scope: None,
            audience: None,
        };
        assert_eq!(state.auth_scheme(&record), "DPoP");

        let state = state_with(minimal_config());
        assert_eq!(state.auth_scheme(&record), "Bearer");
    }
}
