//! Read-only `list` and `describe` walks over the resolved configuration.

use serde_json::json;

use crate::config::loader::LoadedConfig;
use crate::core::error::{HcResult, HttpcraftError};

use super::{DescribeTarget, ListTarget};

pub fn list(loaded: &LoadedConfig, target: &ListTarget, json_mode: bool) -> HcResult<i32> {
    let config = &loaded.config;
    match target {
        ListTarget::Apis => {
            let mut names: Vec<&String> = config.apis.keys().collect();
            names.sort();
            if json_mode {
                let items: Vec<serde_json::Value> = names
                    .iter()
                    .map(|name| {
                        let api = &config.apis[*name];
                        json!({
                            "name": name,
                            "baseUrl": api.base_url,
                            "description": api.description,
                            "endpoints": api.endpoints.len(),
                        })
                    })
                    .collect();
                print_json(&json!(items));
            } else {
                for name in names {
                    let api = &config.apis[name];
                    match &api.description {
                        Some(desc) => println!("{name}  {}  {desc}", api.base_url),
                        None => println!("{name}  {}", api.base_url),
                    }
                }
            }
        }
        ListTarget::Endpoints => {
            let mut rows: Vec<(String, String, String)> = Vec::new();
            for (api_name, api) in &config.apis {
                for (ep_name, endpoint) in &api.endpoints {
                    rows.push((
                        format!("{api_name}.{ep_name}"),
                        endpoint.method.to_string(),
                        endpoint.path.clone(),
                    ));
                }
            }
            rows.sort();
            if json_mode {
                let items: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|(call, method, path)| {
                        json!({"call": call, "method": method, "path": path})
                    })
                    .collect();
                print_json(&json!(items));
            } else {
                for (call, method, path) in rows {
                    println!("{call}  {method} {path}");
                }
            }
        }
        ListTarget::Profiles => {
            let mut names: Vec<&String> = config.profiles.keys().collect();
            names.sort();
            if json_mode {
                let items: Vec<serde_json::Value> = names
                    .iter()
                    .map(|name| {
                        let profile = &config.profiles[*name];
                        let description = profile.get("description").and_then(|d| d.as_str());
                        let variables = profile.keys().filter(|k| *k != "description").count();
                        json!({"name": name, "description": description, "variables": variables})
                    })
                    .collect();
                print_json(&json!(items));
            } else {
                for name in names {
                    let profile = &config.profiles[name];
                    match profile.get("description").and_then(|d| d.as_str()) {
                        Some(desc) => println!("{name}  {desc}"),
                        None => println!("{name}"),
                    }
                }
            }
        }
        ListTarget::Variables => {
            if json_mode {
                print_json(&json!(config.global_variables));
            } else {
                let mut names: Vec<&String> = config.global_variables.keys().collect();
                names.sort();
                for name in names {
                    println!(
                        "{name} = {}",
                        crate::vars::value_to_string(&config.global_variables[name])
                    );
                }
            }
        }
    }
    Ok(0)
}

pub fn describe(loaded: &LoadedConfig, target: &DescribeTarget, json_mode: bool) -> HcResult<i32> {
    let config = &loaded.config;
    match target {
        DescribeTarget::Api { name } => {
            let api = config.get_api(name)?;
            if json_mode {
                print_json(&serde_json::to_value(api).unwrap_or_default());
            } else {
                print_yaml(api)?;
            }
        }
        DescribeTarget::Profile { name } => {
            let profile = config.profiles.get(name).ok_or_else(|| {
                HttpcraftError::Config(format!("profile '{name}' is not defined"))
            })?;
            if json_mode {
                print_json(&serde_json::to_value(profile).unwrap_or_default());
            } else {
                print_yaml(profile)?;
            }
        }
        DescribeTarget::Endpoint { api, endpoint } => {
            let (_, definition) = config.get_endpoint(api, endpoint)?;
            if json_mode {
                print_json(&serde_json::to_value(definition).unwrap_or_default());
            } else {
                print_yaml(definition)?;
            }
        }
    }
    Ok(0)
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_yaml<T: serde::Serialize>(value: &T) -> HcResult<()> {
    let rendered = serde_yaml::to_string(value)
        .map_err(|e| HttpcraftError::Internal(format!("unable to render YAML: {e}")))?;
    print!("{rendered}");
    Ok(())
}
