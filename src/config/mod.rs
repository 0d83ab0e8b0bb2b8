pub mod loader;

use std::collections::{HashMap, HashSet};

use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_with::{serde_as, DisplayFromStr};
use validator::{Validate, ValidationError};

use crate::config_error;
use crate::core::error::{HcResult, HttpcraftError};

/// Methods an endpoint may declare.
const ALLOWED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

// Pre-compiled patterns for structural validation
static BASE_URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://").expect("Invalid base URL regex"));
static STEP_CALL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^.]+\.[^.]+$").expect("Invalid step call regex"));

/// Free-form mapping used for headers, params, variables, and plugin configs.
pub type VariableMap = HashMap<String, JsonValue>;

/// A named flat set of primitive variables. The optional `description` key
/// is metadata and never merges into the variable space.
pub type Profile = HashMap<String, JsonValue>;

/// `config.defaultProfile` accepts a single name or an ordered list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultProfile {
    One(String),
    Many(Vec<String>),
}

impl DefaultProfile {
    pub fn names(&self) -> Vec<String> {
        match self {
            DefaultProfile::One(name) => vec![name.clone()],
            DefaultProfile::Many(names) => names.clone(),
        }
    }
}

/// Top-level `config:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub default_profile: Option<DefaultProfile>,
}

/// Top-level `secrets:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    pub provider: Option<String>,
}

/// One globally declared plugin.
///
/// Plugins resolve against the builtin registry by `name`; `path` and
/// `npmPackage` are accepted for configuration compatibility and validated
/// for mutual exclusivity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "PluginConfiguration::validate_source"))]
pub struct PluginConfiguration {
    #[validate(length(min = 1))]
    pub name: String,
    pub path: Option<String>,
    pub npm_package: Option<String>,
    #[serde(default)]
    pub config: VariableMap,
}

impl PluginConfiguration {
    fn validate_source(&self) -> Result<(), ValidationError> {
        if self.path.is_some() && self.npm_package.is_some() {
            return Err(ValidationError::new("path_and_npm_package_are_exclusive"));
        }
        Ok(())
    }
}

/// An API-level plugin override: only `name` and `config`, merged over the
/// matching global plugin's configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ApiPluginConfiguration {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub config: VariableMap,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDefinition {
    #[serde_as(as = "DisplayFromStr")]
    #[validate(custom(function = "validate_method"))]
    pub method: Method,

    #[validate(length(min = 1))]
    pub path: String,

    #[serde(default)]
    pub headers: VariableMap,
    #[serde(default)]
    pub params: VariableMap,
    #[serde(default)]
    pub body: Option<JsonValue>,
    #[serde(default)]
    pub variables: VariableMap,
    pub description: Option<String>,
}

fn validate_method(method: &Method) -> Result<(), ValidationError> {
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        let mut err = ValidationError::new("unsupported_http_method");
        err.add_param("method".into(), &method.as_str());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ApiDefinition {
    pub description: Option<String>,

    #[validate(custom(function = "validate_base_url"))]
    pub base_url: String,

    #[serde(default)]
    pub headers: VariableMap,
    #[serde(default)]
    pub params: VariableMap,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub plugins: Vec<ApiPluginConfiguration>,

    #[serde(default)]
    pub endpoints: HashMap<String, EndpointDefinition>,
}

fn validate_base_url(base_url: &str) -> Result<(), ValidationError> {
    if !BASE_URL_REGEX.is_match(base_url) {
        return Err(ValidationError::new("base_url_must_be_http_or_https"));
    }
    Ok(())
}

/// Per-step override object (`step.with`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOverrides {
    #[serde(default)]
    pub path_params: VariableMap,
    #[serde(default)]
    pub headers: VariableMap,
    #[serde(default)]
    pub params: VariableMap,
    pub body: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChainStep {
    #[validate(length(min = 1))]
    pub id: String,

    #[validate(custom(function = "validate_call"))]
    pub call: String,

    pub description: Option<String>,
    #[serde(default)]
    pub with: Option<StepOverrides>,
}

fn validate_call(call: &str) -> Result<(), ValidationError> {
    if !STEP_CALL_REGEX.is_match(call) {
        return Err(ValidationError::new("call_must_be_api_dot_endpoint"));
    }
    Ok(())
}

/// Split a validated `call` value into `(apiName, endpointName)`.
pub fn parse_call(call: &str) -> HcResult<(&str, &str)> {
    call.split_once('.')
        .filter(|(api, endpoint)| !api.is_empty() && !endpoint.is_empty())
        .ok_or_else(|| {
            config_error!("invalid step call '{call}': expected <apiName>.<endpointName>")
        })
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "ChainDefinition::validate_step_ids"))]
pub struct ChainDefinition {
    pub description: Option<String>,

    #[serde(default)]
    pub vars: VariableMap,

    #[validate(length(min = 1), nested)]
    pub steps: Vec<ChainStep>,
}

impl ChainDefinition {
    fn validate_step_ids(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                let mut err = ValidationError::new("duplicate_step_id");
                err.add_param("id".into(), &step.id);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Fully merged configuration after modular import expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub config: Option<Settings>,
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
    #[serde(default)]
    pub secrets: Option<SecretsConfig>,
    #[serde(default)]
    pub plugins: Vec<PluginConfiguration>,
    #[serde(default)]
    pub global_variables: VariableMap,
    #[serde(default)]
    pub apis: HashMap<String, ApiDefinition>,
    #[serde(default)]
    pub chains: HashMap<String, ChainDefinition>,
}

impl Config {
    /// Validate structure and cross-section invariants. `origin` names the
    /// configuration file in error messages.
    pub fn validate_all(&self, origin: &str) -> HcResult<()> {
        for (name, api) in &self.apis {
            api.validate().map_err(|e| {
                HttpcraftError::Config(format!("{origin}: api '{name}': {e}"))
            })?;
            if api.endpoints.is_empty() {
                return Err(HttpcraftError::Config(format!(
                    "{origin}: api '{name}': at least one endpoint is required"
                )));
            }
            for (ep_name, endpoint) in &api.endpoints {
                endpoint.validate().map_err(|e| {
                    HttpcraftError::Config(format!(
                        "{origin}: api '{name}', endpoint '{ep_name}': {e}"
                    ))
                })?;
            }
        }

        for (name, chain) in &self.chains {
            chain.validate().map_err(|e| {
                HttpcraftError::Config(format!("{origin}: chain '{name}': {e}"))
            })?;
        }

        let mut plugin_names = HashSet::new();
        for plugin in &self.plugins {
            plugin.validate().map_err(|e| {
                HttpcraftError::Config(format!("{origin}: plugin '{}': {e}", plugin.name))
            })?;
            if !plugin_names.insert(plugin.name.as_str()) {
                return Err(HttpcraftError::Config(format!(
                    "{origin}: duplicate plugin name '{}'",
                    plugin.name
                )));
            }
        }

        for (api_name, api) in &self.apis {
            for override_cfg in &api.plugins {
                override_cfg.validate().map_err(|e| {
                    HttpcraftError::Config(format!(
                        "{origin}: api '{api_name}', plugin '{}': {e}",
                        override_cfg.name
                    ))
                })?;
                if !plugin_names.contains(override_cfg.name.as_str()) {
                    return Err(HttpcraftError::Config(format!(
                        "{origin}: api '{api_name}' references plugin '{}' which is not declared globally",
                        override_cfg.name
                    )));
                }
            }
        }

        for (name, profile) in &self.profiles {
            for (key, value) in profile {
                if key == "description" {
                    continue;
                }
                if value.is_array() || value.is_object() {
                    return Err(HttpcraftError::Config(format!(
                        "{origin}: profile '{name}', key '{key}': profile values must be primitives"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Names from `config.defaultProfile`, in declared order.
    pub fn default_profile_names(&self) -> Vec<String> {
        self.config
            .as_ref()
            .and_then(|settings| settings.default_profile.as_ref())
            .map(|dp| dp.names())
            .unwrap_or_default()
    }

    /// Merge the named profiles in order; later profiles override individual
    /// keys. The `description` key never becomes a variable.
    pub fn merged_profile(&self, names: &[String]) -> HcResult<VariableMap> {
        let mut merged = VariableMap::new();
        for name in names {
            let profile = self.profiles.get(name).ok_or_else(|| {
                HttpcraftError::Config(format!("profile '{name}' is not defined"))
            })?;
            for (key, value) in profile {
                if key != "description" {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(merged)
    }

    pub fn get_api(&self, name: &str) -> HcResult<&ApiDefinition> {
        self.apis.get(name).ok_or_else(|| {
            HttpcraftError::Config(format!("api '{name}' is not defined"))
        })
    }

    pub fn get_endpoint<'a>(
        &'a self,
        api_name: &str,
        endpoint_name: &str,
    ) -> HcResult<(&'a ApiDefinition, &'a EndpointDefinition)> {
        let api = self.get_api(api_name)?;
        let endpoint = api.endpoints.get(endpoint_name).ok_or_else(|| {
            HttpcraftError::Config(format!(
                "endpoint '{endpoint_name}' is not defined on api '{api_name}'"
            ))
        })?;
        Ok((api, endpoint))
    }

    pub fn get_chain(&self, name: &str) -> HcResult<&ChainDefinition> {
        self.chains.get(name).ok_or_else(|| {
            HttpcraftError::Config(format!("chain '{name}' is not defined"))
        })
    }
}
