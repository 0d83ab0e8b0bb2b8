//! Command-line surface.
//!
//! `httpcraft <api> <endpoint>` executes a single request; subcommands cover
//! chains, read-only config inspection, cache management, and shell
//! completion. Hidden `--get-*-names` flags feed dynamic completion and
//! exit 0 with empty output on any error.

pub mod cache_cmd;
pub mod chain_cmd;
pub mod completion;
pub mod inspect;
pub mod request;

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value as JsonValue;

use crate::config::loader::{load_config, load_default_config, LoadedConfig};
use crate::config::VariableMap;
use crate::core::app::App;
use crate::core::error::{HcResult, HttpcraftError};
use crate::output::Diagnostics;

#[derive(Debug, Parser)]
#[command(
    name = "httpcraft",
    version,
    about = "Declarative YAML-driven HTTP client",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// API name for direct invocation: httpcraft <api> <endpoint>
    pub api: Option<String>,
    /// Endpoint name for direct invocation
    pub endpoint: Option<String>,

    #[command(flatten)]
    pub common: CommonFlags,

    #[arg(long = "get-api-names", hide = true)]
    pub get_api_names: bool,
    #[arg(long = "get-endpoint-names", hide = true, value_name = "API")]
    pub get_endpoint_names: Option<String>,
    #[arg(long = "get-chain-names", hide = true)]
    pub get_chain_names: bool,
    #[arg(long = "get-profile-names", hide = true)]
    pub get_profile_names: bool,
}

#[derive(Debug, Clone, Args)]
pub struct CommonFlags {
    /// Path to the configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Variable override, repeatable: --var key=value
    #[arg(long = "var", global = true, value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Profile to merge, repeatable and additive with defaults
    #[arg(long = "profile", global = true, value_name = "NAME")]
    pub profiles: Vec<String>,

    /// Ignore config.defaultProfile
    #[arg(long = "no-default-profile", global = true)]
    pub no_default_profile: bool,

    /// Verbose diagnostics on stderr
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Print the intended request instead of sending it
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,

    /// Exit 1 on matching HTTP errors: comma list of 4xx, 5xx, or codes
    #[arg(long = "exit-on-http-error", global = true, value_name = "PATTERNS")]
    pub exit_on_http_error: Option<String>,

    /// Structured JSON output on stdout
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a chain of requests
    Chain {
        name: String,
        #[arg(long = "chain-output", value_enum, default_value = "default")]
        output: ChainOutputMode,
    },
    /// List configured resources
    List {
        #[command(subcommand)]
        target: ListTarget,
    },
    /// Describe one configured resource
    Describe {
        #[command(subcommand)]
        target: DescribeTarget,
    },
    /// Inspect and manage the persistent cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Emit a shell completion script
    Completion {
        /// Target shell (zsh)
        shell: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChainOutputMode {
    /// Last successful step's response body
    Default,
    /// Structured JSON report of every step
    Full,
}

#[derive(Debug, Subcommand)]
pub enum ListTarget {
    /// Configured APIs
    Apis,
    /// Every endpoint across all APIs
    Endpoints,
    /// Named profiles
    Profiles,
    /// Global variables
    Variables,
}

#[derive(Debug, Subcommand)]
pub enum DescribeTarget {
    /// One API with its endpoints
    Api { name: String },
    /// One profile's variables
    Profile { name: String },
    /// One endpoint
    Endpoint { api: String, endpoint: String },
}

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Namespaces and their keys
    List,
    /// Read one cached value
    Get { namespace: String, key: String },
    /// Delete one cached entry
    Delete { namespace: String, key: String },
    /// Clear one namespace, or everything with no argument
    Clear { namespace: Option<String> },
    /// Entry counts per namespace
    Stats,
}

/// Parse repeated `--var key=value` flags.
pub fn parse_cli_vars(vars: &[String]) -> HcResult<VariableMap> {
    let mut parsed = HashMap::new();
    for var in vars {
        let Some((key, value)) = var.split_once('=') else {
            return Err(HttpcraftError::Config(format!(
                "invalid --var '{var}': expected key=value"
            )));
        };
        if key.is_empty() {
            return Err(HttpcraftError::Config(format!(
                "invalid --var '{var}': empty key"
            )));
        }
        parsed.insert(key.to_string(), JsonValue::String(value.to_string()));
    }
    Ok(parsed)
}

/// Default profiles (unless suppressed) followed by explicit `--profile`
/// flags, in order.
pub fn effective_profile_names(loaded: &LoadedConfig, flags: &CommonFlags) -> Vec<String> {
    let mut names = if flags.no_default_profile {
        Vec::new()
    } else {
        loaded.config.default_profile_names()
    };
    names.extend(flags.profiles.iter().cloned());
    names
}

fn load_for(flags: &CommonFlags) -> HcResult<LoadedConfig> {
    match &flags.config {
        Some(path) => load_config(path),
        None => load_default_config()?.ok_or_else(|| {
            HttpcraftError::Config(
                "no configuration file found (.httpcraft.yaml, .httpcraft.yml, or \
                 ~/.config/httpcraft/config.yaml); use --config"
                    .to_string(),
            )
        }),
    }
}

/// Top-level dispatch. Returns the process exit code.
pub async fn run(cli: Cli, app: &App) -> HcResult<i32> {
    // Completion name helpers must never fail the shell: any error is an
    // empty listing with exit 0.
    if cli.get_api_names || cli.get_endpoint_names.is_some() || cli.get_chain_names
        || cli.get_profile_names
    {
        if let Ok(loaded) = load_for(&cli.common) {
            completion::print_names(&cli, &loaded);
        }
        return Ok(0);
    }

    if let Some(Commands::Completion { shell }) = &cli.command {
        return completion::emit_script(shell);
    }

    let loaded = load_for(&cli.common)?;
    let cli_vars = parse_cli_vars(&cli.common.vars)?;
    let profile_names = effective_profile_names(&loaded, &cli.common);
    let profile = loaded.config.merged_profile(&profile_names)?;
    let diag = Diagnostics::new(cli.common.verbose, app.mask.clone());

    diag.verbose(&format!("config loaded from {}", loaded.path.display()));
    if !profile_names.is_empty() {
        diag.verbose(&format!("profiles in effect: {}", profile_names.join(", ")));
    }

    match cli.command {
        None => {
            let (Some(api), Some(endpoint)) = (cli.api.as_deref(), cli.endpoint.as_deref())
            else {
                return Err(HttpcraftError::Config(
                    "expected <api> <endpoint> or a subcommand; see --help".to_string(),
                ));
            };
            request::run(
                app, &loaded, cli_vars, profile, diag, &cli.common, api, endpoint,
            )
            .await
        }
        Some(Commands::Chain { name, output }) => {
            chain_cmd::run(
                app, &loaded, cli_vars, profile, diag, &cli.common, &name, output,
            )
            .await
        }
        Some(Commands::List { target }) => inspect::list(&loaded, &target, cli.common.json),
        Some(Commands::Describe { target }) => {
            inspect::describe(&loaded, &target, cli.common.json)
        }
        Some(Commands::Cache { action }) => cache_cmd::run(app, &action, cli.common.json).await,
        Some(Commands::Completion { .. }) => unreachable!("handled above"),
    }
}
