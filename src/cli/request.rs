//! Single-request command: `httpcraft <api> <endpoint>`.

use crate::config::loader::LoadedConfig;
use crate::config::VariableMap;
use crate::core::app::App;
use crate::core::error::HcResult;
use crate::executor::{execute_request, Invocation};
use crate::output::{emit_body, json_output, Diagnostics};

use super::CommonFlags;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    app: &App,
    loaded: &LoadedConfig,
    cli_vars: VariableMap,
    profile: VariableMap,
    diag: Diagnostics,
    flags: &CommonFlags,
    api: &str,
    endpoint: &str,
) -> HcResult<i32> {
    let inv = Invocation {
        app,
        loaded,
        cli_vars,
        profile,
        diag: diag.clone(),
        dry_run: flags.dry_run,
    };

    let (_request, response, timing) = execute_request(&inv, api, endpoint).await?;

    if flags.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json_output(&response, timing))
                .unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        emit_body(&response);
    }

    // HTTP error statuses are data unless the caller opted into failing.
    if response.status >= 400 {
        if let Some(patterns) = &flags.exit_on_http_error {
            if status_matches(patterns, response.status) {
                diag.error(
                    "Error:",
                    &format!(
                        "HTTP {} {} matched --exit-on-http-error '{patterns}'",
                        response.status, response.status_text
                    ),
                );
                return Ok(1);
            }
        }
    }

    Ok(0)
}

/// Match a status against comma-separated patterns: `4xx`, `5xx`, or exact
/// codes. Overlapping patterns are fine; any match triggers.
pub fn status_matches(patterns: &str, status: u16) -> bool {
    patterns.split(',').map(str::trim).any(|pattern| {
        match pattern.to_lowercase().as_str() {
            "4xx" => (400..=499).contains(&status),
            "5xx" => (500..=599).contains(&status),
            exact => exact.parse::<u16>() == Ok(status),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_patterns_match_their_range() {
        assert!(status_matches("4xx", 404));
        assert!(status_matches("4xx", 499));
        assert!(!status_matches("4xx", 500));
        assert!(status_matches("5xx", 503));
    }

    #[test]
    fn exact_codes_and_overlaps_are_accepted() {
        assert!(status_matches("404", 404));
        assert!(!status_matches("404", 405));
        assert!(status_matches("4xx,404", 404));
        assert!(status_matches("500, 404", 404));
        assert!(!status_matches("500,501", 404));
    }

    #[test]
    fn garbage_patterns_never_match() {
        assert!(!status_matches("abc", 404));
        assert!(!status_matches("", 404));
    }
}
