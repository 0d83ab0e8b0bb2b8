//! Output streams.
//!
//! stdout carries response bodies (or the structured `--json` object);
//! stderr carries diagnostics under fixed prefixes. Every diagnostic line
//! passes through the secret mask before it is written.

use std::io::Write;
use std::sync::Arc;

use serde_json::json;

use crate::client::{HttpRequest, HttpResponse, ResponseBody};
use crate::vars::mask::SecretMask;

/// Timing for the structured output object, all in Unix milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub start_time: u64,
    pub end_time: u64,
}

impl Timing {
    pub fn duration_ms(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// Masked stderr diagnostics with the documented prefixes.
#[derive(Clone)]
pub struct Diagnostics {
    verbose: bool,
    mask: Arc<SecretMask>,
}

impl Diagnostics {
    pub fn new(verbose: bool, mask: Arc<SecretMask>) -> Self {
        Self { verbose, mask }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    fn emit(&self, prefix: &str, message: &str) {
        eprintln!("{prefix} {}", self.mask.mask(message));
    }

    pub fn verbose(&self, message: &str) {
        if self.verbose {
            self.emit("[VERBOSE]", message);
        }
    }

    pub fn chain(&self, message: &str) {
        if self.verbose {
            self.emit("[CHAIN]", message);
        }
    }

    pub fn step(&self, step_id: &str, message: &str) {
        if self.verbose {
            self.emit(&format!("[STEP {step_id}]"), message);
        }
    }

    /// Dry-run lines always print; they are the whole point of the mode.
    pub fn dry_run(&self, message: &str) {
        self.emit("[DRY RUN]", message);
    }

    pub fn request(&self, request: &HttpRequest) {
        if !self.verbose {
            return;
        }
        self.emit("[REQUEST]", &format!("{} {}", request.method, request.url));
        let mut names: Vec<&String> = request.headers.keys().collect();
        names.sort();
        for name in names {
            self.emit("[REQUEST]", &format!("{name}: {}", request.headers[name]));
        }
        if let Some(body) = request.body_text() {
            self.emit("[REQUEST]", &format!("body: {body}"));
        }
    }

    pub fn response(&self, response: &HttpResponse) {
        if !self.verbose {
            return;
        }
        self.emit(
            "[RESPONSE]",
            &format!("{} {}", response.status, response.status_text),
        );
        let mut names: Vec<&String> = response.headers.keys().collect();
        names.sort();
        for name in names {
            self.emit("[RESPONSE]", &format!("{name}: {}", response.headers[name]));
        }
        match &response.body {
            ResponseBody::Text(text) => self.emit("[RESPONSE]", &format!("body: {text}")),
            ResponseBody::Bytes(bytes) => {
                self.emit("[RESPONSE]", &format!("body: <binary data: {} bytes>", bytes.len()))
            }
        }
    }

    /// Error line with the category prefix, masked.
    pub fn error(&self, prefix: &str, message: &str) {
        self.emit(prefix, message);
    }
}

/// Emit the response body to stdout: text as-is, raw bytes for binary.
pub fn emit_body(response: &HttpResponse) {
    match &response.body {
        ResponseBody::Text(text) => {
            if !text.is_empty() {
                println!("{text}");
            }
        }
        ResponseBody::Bytes(bytes) => {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(bytes);
            let _ = stdout.flush();
        }
    }
}

/// The `--json` output object.
pub fn json_output(response: &HttpResponse, timing: Timing) -> serde_json::Value {
    let data = match &response.body {
        ResponseBody::Text(text) => {
            // JSON bodies come through structured; other text verbatim.
            serde_json::from_str::<serde_json::Value>(text)
                .unwrap_or_else(|_| serde_json::Value::String(text.clone()))
        }
        ResponseBody::Bytes(bytes) => {
            serde_json::Value::String(format!("<binary data: {} bytes>", bytes.len()))
        }
    };

    json!({
        "status": response.status,
        "statusText": response.status_text,
        "headers": response.headers,
        "timing": {
            "duration": timing.duration_ms(),
            "startTime": timing.start_time,
            "endTime": timing.end_time,
        },
        "data": data,
        "isBinary": response.is_binary(),
        "contentType": response.content_type,
        "contentLength": response.content_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn text_response(body: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: ResponseBody::Text(body.to_string()),
            content_type: Some("application/json".to_string()),
            content_length: Some(body.len() as u64),
        }
    }

    #[test]
    fn json_output_parses_json_bodies() {
        let out = json_output(
            &text_response(r#"{"id": 7}"#),
            Timing {
                start_time: 1000,
                end_time: 1350,
            },
        );
        assert_eq!(out["data"]["id"], 7);
        assert_eq!(out["timing"]["duration"], 350);
        assert_eq!(out["isBinary"], false);
        assert_eq!(out["status"], 200);
    }

    #[test]
    fn json_output_uses_placeholder_for_binary() {
        let response = HttpResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            body: ResponseBody::Bytes(vec![0u8; 16]),
            content_type: Some("application/pdf".to_string()),
            content_length: Some(16),
        };
        let out = json_output(
            &response,
            Timing {
                start_time: 0,
                end_time: 0,
            },
        );
        assert_eq!(out["data"], "<binary data: 16 bytes>");
        assert_eq!(out["isBinary"], true);
    }

    #[test]
    fn non_json_text_is_passed_through_as_string() {
        let out = json_output(
            &text_response("plain text"),
            Timing {
                start_time: 0,
                end_time: 0,
            },
        );
        assert_eq!(out["data"], "plain text");
    }
}
