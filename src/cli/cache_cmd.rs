//! Cache introspection commands: `httpcraft cache …`.

use serde_json::json;

use crate::core::app::App;
use crate::core::error::{HcResult, HttpcraftError};

use super::CacheAction;

pub async fn run(app: &App, action: &CacheAction, json_mode: bool) -> HcResult<i32> {
    match action {
        CacheAction::List => {
            let namespaces = app.cache.namespaces().await;
            if json_mode {
                let mut items = Vec::new();
                for namespace in &namespaces {
                    items.push(json!({
                        "namespace": namespace,
                        "keys": app.cache.keys(namespace).await,
                    }));
                }
                print_json(&json!(items));
            } else {
                for namespace in &namespaces {
                    println!("{namespace}");
                    for key in app.cache.keys(namespace).await {
                        println!("  {key}");
                    }
                }
            }
            Ok(0)
        }
        CacheAction::Get { namespace, key } => match app.cache.get(namespace, key).await {
            Some(value) => {
                print_json(&value);
                Ok(0)
            }
            None => Err(HttpcraftError::Cache(format!(
                "no entry '{key}' in namespace '{namespace}'"
            ))),
        },
        CacheAction::Delete { namespace, key } => {
            if app.cache.delete(namespace, key).await {
                Ok(0)
            } else {
                Err(HttpcraftError::Cache(format!(
                    "no entry '{key}' in namespace '{namespace}'"
                )))
            }
        }
        CacheAction::Clear { namespace } => {
            match namespace {
                Some(namespace) => app.cache.clear(namespace).await,
                None => app.cache.clear_all().await,
            }
            Ok(0)
        }
        CacheAction::Stats => {
            let stats = app.cache.stats().await;
            if json_mode {
                print_json(&serde_json::to_value(&stats).unwrap_or_default());
            } else {
                println!("total entries: {}", stats.total_entries);
                for namespace in &stats.namespaces {
                    println!("{}: {} entries", namespace.name, namespace.entries);
                }
            }
            Ok(0)
        }
    }
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}
