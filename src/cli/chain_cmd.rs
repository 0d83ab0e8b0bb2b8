//! Chain command: `httpcraft chain <name>`.

use serde_json::json;

use crate::client::ResponseBody;
use crate::config::loader::LoadedConfig;
use crate::config::VariableMap;
use crate::core::app::App;
use crate::core::error::HcResult;
use crate::executor::{execute_chain, ChainResult, Invocation};
use crate::output::{emit_body, json_output, Diagnostics};

use super::{ChainOutputMode, CommonFlags};

#[allow(clippy::too_many_arguments)]
pub async fn run(
    app: &App,
    loaded: &LoadedConfig,
    cli_vars: VariableMap,
    profile: VariableMap,
    diag: Diagnostics,
    flags: &CommonFlags,
    name: &str,
    output: ChainOutputMode,
) -> HcResult<i32> {
    let inv = Invocation {
        app,
        loaded,
        cli_vars,
        profile,
        diag: diag.clone(),
        dry_run: flags.dry_run,
    };

    let result = execute_chain(&inv, name).await?;

    if output == ChainOutputMode::Full {
        println!(
            "{}",
            serde_json::to_string_pretty(&full_report(&result))
                .unwrap_or_else(|_| "{}".to_string())
        );
        return Ok(if result.success() { 0 } else { 1 });
    }

    if result.success() {
        if let Some(response) = result.final_response() {
            if flags.json {
                let timing = result
                    .steps
                    .iter()
                    .rev()
                    .find(|s| s.success)
                    .and_then(|s| s.timing)
                    .unwrap_or(crate::output::Timing {
                        start_time: 0,
                        end_time: 0,
                    });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json_output(response, timing))
                        .unwrap_or_else(|_| "{}".to_string())
                );
            } else {
                emit_body(response);
            }
        }
        Ok(0)
    } else {
        // Diagnostics only on failure; the failing step carries the error.
        for step in &result.steps {
            if let Some(error) = &step.error {
                diag.error(&format!("[STEP {}]", step.step_id), error);
            }
        }
        Ok(1)
    }
}

/// The `--chain-output full` report: every step with request and response.
fn full_report(result: &ChainResult) -> serde_json::Value {
    let steps: Vec<serde_json::Value> = result
        .steps
        .iter()
        .map(|step| {
            let request = step.request.as_ref().map(|req| {
                json!({
                    "method": req.method.as_str(),
                    "url": req.url,
                    "headers": req.headers,
                    "body": req.body,
                })
            });
            let response = step.response.as_ref().map(|resp| {
                let body = match &resp.body {
                    ResponseBody::Text(text) => json!(text),
                    ResponseBody::Bytes(bytes) => {
                        json!(format!("<binary data: {} bytes>", bytes.len()))
                    }
                };
                json!({
                    "status": resp.status,
                    "statusText": resp.status_text,
                    "headers": resp.headers,
                    "body": body,
                })
            });
            json!({
                "stepId": step.step_id,
                "success": step.success,
                "error": step.error,
                "durationMs": step.timing.map(|t| t.duration_ms()),
                "request": request,
                "response": response,
            })
        })
        .collect();

    json!({
        "chainName": result.chain_name,
        "success": result.success(),
        "steps": steps,
    })
}
