//! Interactive authorization-code flow plumbing.
//!
//! PKCE pair generation, the loopback callback listener, and authorization
//! URL construction. The listener binds the first free port in a 100-port
//! window, serves a human-readable result page, and is hard-terminated
//! after the flow timeout.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;
use uuid::Uuid;

use crate::core::error::{HcResult, HttpcraftError};

/// Ports probed above the configured (or default 8080) starting port.
const PORT_SCAN_RANGE: u16 = 100;

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>httpcraft</title></head>\
<body><h1>Authentication complete</h1>\
<p>You can close this window and return to the terminal.</p></body></html>";

const ERROR_PAGE: &str = "<!DOCTYPE html><html><head><title>httpcraft</title></head>\
<body><h1>Authentication failed</h1>\
<p>Check the terminal for details.</p></body></html>";

const NOT_FOUND_PAGE: &str = "<!DOCTYPE html><html><body>Not found</body></html>";

/// A PKCE verifier/challenge pair (S256).
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// 32 random bytes, base64url without padding; the challenge is the
/// base64url SHA-256 of the verifier text.
pub fn generate_pkce() -> PkcePair {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    PkcePair {
        verifier,
        challenge,
    }
}

/// Random state parameter for CSRF protection of the callback.
pub fn generate_state() -> String {
    Uuid::new_v4().to_string()
}

/// Environment indicators that rule out an interactive browser flow.
const CI_INDICATORS: [&str; 7] = [
    "CI",
    "CONTINUOUS_INTEGRATION",
    "BUILD_NUMBER",
    "GITHUB_ACTIONS",
    "TRAVIS",
    "CIRCLECI",
    "GITLAB_CI",
];

pub fn is_ci_environment() -> bool {
    CI_INDICATORS
        .iter()
        .any(|name| std::env::var_os(name).is_some())
}

pub fn stdout_is_tty() -> bool {
    atty::is(atty::Stream::Stdout)
}

/// Inputs for the authorization URL.
pub struct AuthorizationRequest<'a> {
    pub authorization_url: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub state: &'a str,
    pub scope: Option<&'a str>,
    pub audience: Option<&'a str>,
    pub additional_params: &'a HashMap<String, String>,
    pub pkce: Option<&'a PkcePair>,
    pub code_challenge_method: &'a str,
}

pub fn build_authorization_url(request: &AuthorizationRequest<'_>) -> HcResult<String> {
    let mut url = Url::parse(request.authorization_url).map_err(|e| {
        HttpcraftError::Auth(format!(
            "invalid authorizationUrl '{}': {e}",
            request.authorization_url
        ))
    })?;

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("response_type", "code");
        pairs.append_pair("client_id", request.client_id);
        pairs.append_pair("redirect_uri", request.redirect_uri);
        pairs.append_pair("state", request.state);
        if let Some(pkce) = request.pkce {
            pairs.append_pair("code_challenge", &pkce.challenge);
            pairs.append_pair("code_challenge_method", request.code_challenge_method);
        }
        if let Some(scope) = request.scope {
            pairs.append_pair("scope", scope);
        }
        if let Some(audience) = request.audience {
            pairs.append_pair("audience", audience);
        }
        for (key, value) in request.additional_params {
            pairs.append_pair(key, value);
        }
    }

    Ok(url.to_string())
}

/// Loopback listener for the authorization redirect.
pub struct CallbackServer {
    listener: TcpListener,
    pub port: u16,
    path: String,
}

impl CallbackServer {
    /// Bind `127.0.0.1` on the first free port in
    /// `[start_port, start_port + 100)`.
    pub async fn bind(start_port: u16, callback_path: &str) -> HcResult<Self> {
        for offset in 0..PORT_SCAN_RANGE {
            let port = start_port.saturating_add(offset);
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    log::debug!("OAuth2 callback server bound to port {port}");
                    return Ok(Self {
                        listener,
                        port,
                        path: callback_path.to_string(),
                    });
                }
                Err(_) => continue,
            }
        }
        Err(HttpcraftError::Auth(format!(
            "no free callback port in [{start_port}, {})",
            start_port as u32 + PORT_SCAN_RANGE as u32
        )))
    }

    /// The redirect URI advertised to the authorization server.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{}", self.port, self.path)
    }

    /// Wait for the redirect carrying `code`, validating `state`.
    ///
    /// Requests for other paths (favicons and the like) get a 404 and the
    /// wait continues. The whole wait is bounded by `timeout`.
    pub async fn wait_for_code(self, expected_state: &str, timeout: Duration) -> HcResult<String> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let accepted = tokio::time::timeout_at(deadline, self.listener.accept())
                .await
                .map_err(|_| {
                    HttpcraftError::Auth(
                        "timed out waiting for the authorization callback".to_string(),
                    )
                })?;
            let (mut stream, _) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    log::debug!("callback accept failed: {e}");
                    continue;
                }
            };

            let Some(target) = read_request_target(&mut stream).await else {
                continue;
            };
            let parsed = match Url::parse(&format!("http://localhost{target}")) {
                Ok(parsed) => parsed,
                Err(_) => {
                    respond(&mut stream, 404, NOT_FOUND_PAGE).await;
                    continue;
                }
            };

            if parsed.path() != self.path {
                respond(&mut stream, 404, NOT_FOUND_PAGE).await;
                continue;
            }

            let query: HashMap<String, String> = parsed
                .query_pairs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();

            if let Some(error) = query.get("error") {
                respond(&mut stream, 400, ERROR_PAGE).await;
                let description = query
                    .get("error_description")
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default();
                return Err(HttpcraftError::Auth(format!(
                    "authorization server returned '{error}'{description}"
                )));
            }

            match query.get("state") {
                Some(state) if state == expected_state => {}
                _ => {
                    respond(&mut stream, 400, ERROR_PAGE).await;
                    return Err(HttpcraftError::Auth(
                        "state mismatch on authorization callback".to_string(),
                    ));
                }
            }

            let Some(code) = query.get("code").filter(|c| !c.is_empty()) else {
                respond(&mut stream, 400, ERROR_PAGE).await;
                return Err(HttpcraftError::Auth(
                    "authorization callback carried no code".to_string(),
                ));
            };

            respond(&mut stream, 200, SUCCESS_PAGE).await;
            return Ok(code.clone());
        }
    }
}

/// Read the request head and return the request target of the first line.
async fn read_request_target(stream: &mut TcpStream) -> Option<String> {
    let mut buffer = vec![0u8; 4096];
    let mut filled = 0;
    loop {
        let n = stream.read(&mut buffer[filled..]).await.ok()?;
        if n == 0 {
            break;
        }
        filled += n;
        if buffer[..filled].windows(4).any(|w| w == b"\r\n\r\n") || filled == buffer.len() {
            break;
        }
    }
    let head = String::from_utf8_lossy(&buffer[..filled]);
    let first_line = head.lines().next()?;
    // e.g. "GET /callback?code=… HTTP/1.1"
    let mut parts = first_line.split_whitespace();
    let _method = parts.next()?;
    parts.next().map(str::to_string)
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        _ => "Not Found",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_pair_is_base64url_s256() {
        let pkce = generate_pkce();
        // 32 bytes → 43 base64url chars, no padding
        assert_eq!(pkce.verifier.len(), 43);
        assert!(!pkce.verifier.contains('='));
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
    }

    #[test]
    fn state_is_a_uuid() {
        let state = generate_state();
        assert_eq!(state.len(), 36);
        assert_ne!(state, generate_state());
    }

    #[test]
    fn authorization_url_carries_the_flow_parameters() {
        let pkce = generate_pkce();
        let extra = HashMap::from([("prompt".to_string(), "consent".to_string())]);
        let url = build_authorization_url(&AuthorizationRequest {
            authorization_url: "https://auth.example.test/authorize",
            client_id: "client-1",
            redirect_uri: "http://localhost:8080/callback",
            state: "state-123",
            scope: Some("openid profile"),
            audience: Some("https://api.example.test"),
            additional_params: &extra,
            pkce: Some(&pkce),
            code_challenge_method: "S256",
        })
        .unwrap();

        assert!(url.starts_with("https://auth.example.test/authorize?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=client-1"));
        assert!(url.contains("state=state-123"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("code_challenge={}", pkce.challenge)));
        assert!(url.contains("scope=openid+profile"));
        assert!(url.contains("prompt=consent"));
    }

    #[test]
    fn pkce_can_be_disabled() {
        let url = build_authorization_url(&AuthorizationRequest {
            authorization_url: "https://auth.example.test/authorize",
            client_id: "client-1",
            redirect_uri: "http://localhost:8080/callback",
            state: "s",
            scope: None,
            audience: None,
            additional_params: &HashMap::new(),
            pkce: None,
            code_challenge_method: "S256",
        })
        .unwrap();
        assert!(!url.contains("code_challenge"));
    }

    async fn send_callback(port: u16, path_and_query: &str) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!("GET {path_and_query} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
    }

    #[tokio::test]
    async fn callback_with_matching_state_yields_code() {
        let server = CallbackServer::bind(18080, "/callback").await.unwrap();
        let port = server.port;
        assert!((18080..18180).contains(&port));
        assert_eq!(server.redirect_uri(), format!("http://localhost:{port}/callback"));

        let client = tokio::spawn(async move {
            send_callback(port, "/callback?code=auth-code-1&state=expected").await;
        });
        let code = server
            .wait_for_code("expected", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, "auth-code-1");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn state_mismatch_fails_the_flow() {
        let server = CallbackServer::bind(18280, "/callback").await.unwrap();
        let port = server.port;
        let client = tokio::spawn(async move {
            send_callback(port, "/callback?code=auth-code-1&state=tampered").await;
        });
        let err = server
            .wait_for_code("expected", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("state mismatch"));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn provider_error_is_reported() {
        let server = CallbackServer::bind(18380, "/callback").await.unwrap();
        let port = server.port;
        let client = tokio::spawn(async move {
            send_callback(
                port,
                "/callback?error=access_denied&error_description=user+cancelled&state=s",
            )
            .await;
        });
        let err = server
            .wait_for_code("s", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("access_denied"));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn unrelated_paths_do_not_consume_the_wait() {
        let server = CallbackServer::bind(18480, "/callback").await.unwrap();
        let port = server.port;
        let client = tokio::spawn(async move {
            send_callback(port, "/favicon.ico").await;
            send_callback(port, "/callback?code=late-code&state=s").await;
        });
        let code = server
            .wait_for_code("s", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, "late-code");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn occupied_ports_are_skipped() {
        let first = CallbackServer::bind(18580, "/cb").await.unwrap();
        let second = CallbackServer::bind(18580, "/cb").await.unwrap();
        assert_ne!(first.port, second.port);
        assert!(second.port > first.port);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let server = CallbackServer::bind(18680, "/callback").await.unwrap();
        let err = server
            .wait_for_code("s", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
