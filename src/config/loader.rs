//! Configuration loading and modular import expansion.
//!
//! A configuration file may replace its `apis`, `chains`, and `profiles`
//! sections with import lists. Every list element is either
//! `directory:<relpath>` (all `*.yaml`/`*.yml` files, non-recursive, loaded
//! in lexicographic order) or a single file path. Later files override
//! earlier files per top-level key, except profiles, which merge per inner
//! key so later loads override individual variables rather than the whole
//! profile.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::{
    ApiDefinition, ChainDefinition, Config, PluginConfiguration, Profile, SecretsConfig,
    Settings, VariableMap,
};
use crate::core::error::{ErrorContext, HcResult, HttpcraftError};

/// File names probed by [`load_default_config`], in order.
const LOCAL_CANDIDATES: [&str; 2] = [".httpcraft.yaml", ".httpcraft.yml"];

/// A loaded configuration together with its on-disk location. Relative
/// plugin paths, import specs, and variable files resolve against `dir`.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: PathBuf,
    pub dir: PathBuf,
}

/// A section that is either written inline or assembled from imports.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SectionSource<T> {
    Imports(Vec<String>),
    Inline(HashMap<String, T>),
}

/// On-disk shape of a configuration file before import expansion.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    config: Option<Settings>,
    #[serde(default)]
    profiles: Option<SectionSource<Profile>>,
    #[serde(default)]
    secrets: Option<SecretsConfig>,
    #[serde(default)]
    plugins: Vec<PluginConfiguration>,
    #[serde(default)]
    variables: Vec<String>,
    #[serde(default)]
    global_variables: VariableMap,
    #[serde(default)]
    apis: Option<SectionSource<ApiDefinition>>,
    #[serde(default)]
    chains: Option<SectionSource<ChainDefinition>>,
}

/// Read one YAML file, expand its modular imports, and validate the result.
pub fn load_config(path: impl AsRef<Path>) -> HcResult<LoadedConfig> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let text = std::fs::read_to_string(path)
        .config_context(&format!("unable to read config file {display}"))?;
    let raw: RawConfig =
        serde_yaml::from_str(&text).config_context(&format!("unable to parse {display}"))?;
    log::debug!("config file read from {display}");

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let apis = expand_last_writer_wins(raw.apis, &dir, "apis")?;
    let chains = expand_last_writer_wins(raw.chains, &dir, "chains")?;
    let profiles = expand_profiles(raw.profiles, &dir)?;
    let global_variables = merge_variable_files(&raw.variables, raw.global_variables, &dir)?;

    let config = Config {
        config: raw.config,
        profiles,
        secrets: raw.secrets,
        plugins: raw.plugins,
        global_variables,
        apis,
        chains,
    };
    config.validate_all(&display)?;

    Ok(LoadedConfig {
        config,
        path: path.to_path_buf(),
        dir,
    })
}

/// Search the default locations: `./.httpcraft.yaml`, `./.httpcraft.yml`,
/// then `$XDG_CONFIG_HOME|$HOME/.config/httpcraft/config.yaml`.
pub fn load_default_config() -> HcResult<Option<LoadedConfig>> {
    for candidate in LOCAL_CANDIDATES {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            let resolved = std::fs::canonicalize(&path).unwrap_or(path);
            return load_config(resolved).map(Some);
        }
    }

    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")));
    if let Some(config_home) = config_home {
        let path = config_home.join("httpcraft").join("config.yaml");
        if path.is_file() {
            return load_config(path).map(Some);
        }
    }

    Ok(None)
}

/// Load the mappings named by `specs` in order. Each returned map is one
/// file's root mapping; merge policy is the caller's.
fn collect_import_maps<T: DeserializeOwned>(
    specs: &[String],
    dir: &Path,
    section: &str,
) -> HcResult<Vec<HashMap<String, T>>> {
    let mut maps = Vec::new();
    for spec in specs {
        if let Some(sub) = spec.strip_prefix("directory:") {
            let import_dir = dir.join(sub);
            let mut files: Vec<PathBuf> = std::fs::read_dir(&import_dir)
                .map_err(|e| {
                    HttpcraftError::Config(format!(
                        "{section} import '{spec}': unable to read directory {}: {e}",
                        import_dir.display()
                    ))
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    matches!(
                        path.extension().and_then(|ext| ext.to_str()),
                        Some("yaml") | Some("yml")
                    )
                })
                .collect();
            files.sort();
            for file in files {
                maps.push(load_import_file(&file, section)?);
            }
        } else {
            maps.push(load_import_file(&dir.join(spec), section)?);
        }
    }
    Ok(maps)
}

fn load_import_file<T: DeserializeOwned>(
    path: &Path,
    section: &str,
) -> HcResult<HashMap<String, T>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        HttpcraftError::Config(format!(
            "{section} import: unable to read {}: {e}",
            path.display()
        ))
    })?;
    serde_yaml::from_str(&text).map_err(|e| {
        HttpcraftError::Config(format!(
            "{section} import: unable to parse {}: {e}",
            path.display()
        ))
    })
}

fn expand_last_writer_wins<T: DeserializeOwned>(
    source: Option<SectionSource<T>>,
    dir: &Path,
    section: &str,
) -> HcResult<HashMap<String, T>> {
    match source {
        None => Ok(HashMap::new()),
        Some(SectionSource::Inline(map)) => Ok(map),
        Some(SectionSource::Imports(specs)) => {
            let mut merged = HashMap::new();
            for map in collect_import_maps(&specs, dir, section)? {
                merged.extend(map);
            }
            Ok(merged)
        }
    }
}

fn expand_profiles(
    source: Option<SectionSource<Profile>>,
    dir: &Path,
) -> HcResult<HashMap<String, Profile>> {
    match source {
        None => Ok(HashMap::new()),
        Some(SectionSource::Inline(map)) => Ok(map),
        Some(SectionSource::Imports(specs)) => {
            let mut merged: HashMap<String, Profile> = HashMap::new();
            for map in collect_import_maps::<Profile>(&specs, dir, "profiles")? {
                for (name, profile) in map {
                    // Later loads override individual variables, not the
                    // whole profile.
                    merged.entry(name).or_default().extend(profile);
                }
            }
            Ok(merged)
        }
    }
}

/// Merge `variables:` files in listed order, then apply direct
/// `globalVariables` on top.
fn merge_variable_files(
    files: &[String],
    direct: VariableMap,
    dir: &Path,
) -> HcResult<VariableMap> {
    let mut merged = VariableMap::new();
    for file in files {
        let path = dir.join(file);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            HttpcraftError::Config(format!(
                "unable to read variables file {}: {e}",
                path.display()
            ))
        })?;
        let vars: HashMap<String, JsonValue> = serde_yaml::from_str(&text).map_err(|e| {
            HttpcraftError::Config(format!(
                "unable to parse variables file {}: {e}",
                path.display()
            ))
        })?;
        for (key, value) in vars {
            if value.is_array() || value.is_object() {
                return Err(HttpcraftError::Config(format!(
                    "variables file {}, key '{key}': values must be primitives",
                    path.display()
                )));
            }
            merged.insert(key, value);
        }
    }
    merged.extend(direct);
    Ok(merged)
}
