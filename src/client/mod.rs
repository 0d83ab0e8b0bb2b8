//! HTTP transport.
//!
//! Wraps `reqwest` behind a request/response model the rest of the tool
//! owns: requests carry resolved headers and a JSON body tree, responses
//! carry either decoded text or raw bytes. HTTP error statuses are data,
//! not errors; only network-level failures raise, classified so callers can
//! distinguish DNS failures, refused connections, and timeouts.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::time::Duration;

use http::Method;
use serde_json::Value as JsonValue;

use crate::core::error::{HcResult, HttpcraftError, TransportKind};
use crate::plugin::PluginSnapshot;

/// Media types treated as binary regardless of payload content.
const BINARY_MEDIA_TYPES: [&str; 6] = [
    "application/zip",
    "application/pdf",
    "application/octet-stream",
    "application/msword",
    "application/gzip",
    "application/x-rar-compressed",
];

/// OOXML office documents (docx, xlsx, pptx, …).
const OOXML_PREFIX: &str = "application/vnd.openxmlformats-officedocument";

/// A fully resolved request, mutable by pre-request hooks until transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Final URL including query string
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<JsonValue>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body rendered for display and step recording: strings verbatim,
    /// other values as JSON.
    pub fn body_text(&self) -> Option<String> {
        self.body.as_ref().map(|body| match body {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Response payload: decoded text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Text(String),
    Bytes(Vec<u8>),
}

impl ResponseBody {
    pub fn is_binary(&self) -> bool {
        matches!(self, ResponseBody::Bytes(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(text) => Some(text),
            ResponseBody::Bytes(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResponseBody::Text(text) => text.len(),
            ResponseBody::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A received response, mutable by post-response hooks.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

impl HttpResponse {
    pub fn is_binary(&self) -> bool {
        self.body.is_binary()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Run every pre-request hook in registration order. The first failure
/// aborts.
pub async fn run_pre_request_hooks(
    mut request: HttpRequest,
    snapshot: &PluginSnapshot,
) -> HcResult<HttpRequest> {
    for hook in &snapshot.pre_request_hooks {
        request = hook(request).await?;
    }
    Ok(request)
}

/// Run every post-response hook in registration order.
pub async fn run_post_response_hooks(
    mut response: HttpResponse,
    snapshot: &PluginSnapshot,
) -> HcResult<HttpResponse> {
    for hook in &snapshot.post_response_hooks {
        response = hook(response).await?;
    }
    Ok(response)
}

/// Transport client shared for the lifetime of one invocation.
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> HcResult<Self> {
        let inner = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| HttpcraftError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { inner })
    }

    /// Send one resolved request. Does not raise on HTTP error status.
    pub async fn execute(&self, request: &HttpRequest) -> HcResult<HttpResponse> {
        let mut builder = self.inner.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        match &request.body {
            Some(JsonValue::String(text)) => builder = builder.body(text.clone()),
            Some(value) => builder = builder.json(value),
            None => {}
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        log::debug!("sending {} {}", request.method, request.url);
        let response = builder.send().await.map_err(transport_error)?;

        let status = response.status().as_u16();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let content_length = response.content_length();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            );
        }
        let content_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone());
        let content_disposition = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-disposition"))
            .map(|(_, v)| v.clone());

        let bytes = response.bytes().await.map_err(transport_error)?;
        let body = decode_body(
            &bytes,
            content_type.as_deref(),
            content_disposition.as_deref(),
        );

        Ok(HttpResponse {
            status,
            status_text,
            headers,
            body,
            content_type,
            content_length,
        })
    }

    /// Pre-request hooks, transport, post-response hooks, in that order.
    /// The caller's request reflects any hook rewrites afterwards.
    pub async fn execute_with_hooks(
        &self,
        request: &mut HttpRequest,
        snapshot: &PluginSnapshot,
    ) -> HcResult<HttpResponse> {
        *request = run_pre_request_hooks(request.clone(), snapshot).await?;
        let response = self.execute(request).await?;
        run_post_response_hooks(response, snapshot).await
    }
}

fn transport_error(err: reqwest::Error) -> HttpcraftError {
    let kind = classify_transport_error(&err);
    HttpcraftError::Transport {
        kind,
        message: err.to_string(),
    }
}

fn classify_transport_error(err: &reqwest::Error) -> TransportKind {
    if err.is_timeout() {
        return TransportKind::Timeout;
    }

    // Walk the source chain: hyper wraps the io error, which carries the
    // DNS / connection-refused detail.
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return TransportKind::ConnectionRefused;
            }
        }
        let text = cause.to_string().to_lowercase();
        if text.contains("dns") || text.contains("failed to lookup") {
            return TransportKind::Dns;
        }
        if text.contains("connection refused") {
            return TransportKind::ConnectionRefused;
        }
        source = cause.source();
    }

    TransportKind::Other
}

/// Decide binary vs text and decode accordingly.
///
/// Binary when the media type is a known binary family, when the server
/// marks the payload as an attachment, or when an untyped payload is not
/// valid UTF-8. Text decoding honors the `charset` parameter for `utf-8`
/// (default) and `iso-8859-1`/`latin1`.
pub fn decode_body(
    bytes: &[u8],
    content_type: Option<&str>,
    content_disposition: Option<&str>,
) -> ResponseBody {
    if let Some(disposition) = content_disposition {
        if disposition.to_lowercase().contains("attachment") {
            return ResponseBody::Bytes(bytes.to_vec());
        }
    }

    let media_type = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_lowercase())
        .unwrap_or_default();

    if is_binary_media_type(&media_type) {
        return ResponseBody::Bytes(bytes.to_vec());
    }

    if is_text_media_type(&media_type) {
        return ResponseBody::Text(decode_text(bytes, content_type));
    }

    // Untyped payload: text only if it decodes cleanly.
    match std::str::from_utf8(bytes) {
        Ok(text) => ResponseBody::Text(text.to_string()),
        Err(_) => ResponseBody::Bytes(bytes.to_vec()),
    }
}

fn is_binary_media_type(media_type: &str) -> bool {
    if media_type.starts_with("image/")
        || media_type.starts_with("audio/")
        || media_type.starts_with("video/")
        || media_type.starts_with(OOXML_PREFIX)
    {
        return true;
    }
    BINARY_MEDIA_TYPES.contains(&media_type)
}

fn is_text_media_type(media_type: &str) -> bool {
    media_type.starts_with("text/")
        || media_type.contains("json")
        || media_type.contains("xml")
        || media_type.contains("javascript")
        || media_type.contains("x-www-form-urlencoded")
}

fn decode_text(bytes: &[u8], content_type: Option<&str>) -> String {
    let charset = content_type
        .and_then(|ct| {
            ct.to_lowercase()
                .split(';')
                .find_map(|part| part.trim().strip_prefix("charset=").map(str::to_string))
        })
        .unwrap_or_else(|| "utf-8".to_string());

    match charset.trim_matches('"') {
        "iso-8859-1" | "latin1" => bytes.iter().map(|&b| b as char).collect(),
        _ => String::from_utf8_lossy(bytes).to_string(),
    }
}
