//! Shell completion support.
//!
//! `completion zsh` emits the static script; the hidden `--get-*-names`
//! flags supply dynamic API/endpoint/chain/profile names to it.

use clap::CommandFactory;
use clap_complete::{generate, shells::Zsh};

use crate::config::loader::LoadedConfig;
use crate::core::error::{HcResult, HttpcraftError};

use super::Cli;

pub fn emit_script(shell: &str) -> HcResult<i32> {
    match shell {
        "zsh" => {
            let mut command = Cli::command();
            generate(Zsh, &mut command, "httpcraft", &mut std::io::stdout());
            Ok(0)
        }
        other => Err(HttpcraftError::Config(format!(
            "unsupported completion shell '{other}' (only zsh is supported)"
        ))),
    }
}

/// Newline-separated names for the hidden completion helpers.
pub fn print_names(cli: &Cli, loaded: &LoadedConfig) {
    let config = &loaded.config;
    let mut names: Vec<String> = if cli.get_api_names {
        config.apis.keys().cloned().collect()
    } else if let Some(api) = &cli.get_endpoint_names {
        config
            .apis
            .get(api)
            .map(|api| api.endpoints.keys().cloned().collect())
            .unwrap_or_default()
    } else if cli.get_chain_names {
        config.chains.keys().cloned().collect()
    } else if cli.get_profile_names {
        config.profiles.keys().cloned().collect()
    } else {
        Vec::new()
    };
    names.sort();
    for name in names {
        println!("{name}");
    }
}
