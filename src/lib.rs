//! httpcraft — a declarative HTTP client driven by YAML configuration.
//!
//! Users describe APIs, endpoints, chains of requests, profiles, secrets,
//! and plugins; the tool resolves `{{…}}` variables at invocation time,
//! executes one or more requests, and writes the response body to stdout
//! with diagnostics on stderr.

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod executor;
pub mod output;
pub mod plugin;
pub mod utils;
pub mod vars;
