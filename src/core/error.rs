//! Unified error handling for httpcraft
//!
//! This module provides a centralized error type so that subsystems do not
//! need to depend on each other for error handling. The variants mirror the
//! failure categories surfaced to the user: configuration, variable
//! resolution, plugins, transport, HTTP status, cache, and authentication.

use std::fmt;

/// How a transport failure should be classified.
///
/// Higher layers use this to distinguish retry policy; nothing is retried
/// internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// DNS resolution failed
    Dns,
    /// TCP connection refused
    ConnectionRefused,
    /// Request timed out
    Timeout,
    /// Any other network failure
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Dns => write!(f, "DNS resolution failed"),
            TransportKind::ConnectionRefused => write!(f, "connection refused"),
            TransportKind::Timeout => write!(f, "request timed out"),
            TransportKind::Other => write!(f, "network error"),
        }
    }
}

/// Unified error type for the whole tool
#[derive(Debug)]
pub enum HttpcraftError {
    /// Invalid YAML, missing required keys, bad import specs
    Config(String),

    /// A `{{…}}` placeholder could not be resolved. Never carries the
    /// resolved value of a secret.
    VariableResolution { name: String, reason: String },

    /// Plugin load failure, unknown plugin name, or a hook/source raised
    Plugin(String),

    /// Network-level failure while talking to a server
    Transport { kind: TransportKind, message: String },

    /// HTTP response with status >= 400, where the caller treats it as fatal
    HttpStatus { status: u16, message: String },

    /// Cache subsystem failure. Callers degrade to an empty cache view.
    Cache(String),

    /// OAuth2 token acquisition failure, callback timeout, state mismatch
    Auth(String),

    /// Filesystem and other I/O errors
    Io(std::io::Error),

    /// Internal invariant violations
    Internal(String),
}

impl fmt::Display for HttpcraftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpcraftError::Config(msg) => write!(f, "{msg}"),
            HttpcraftError::VariableResolution { name, reason } => {
                write!(f, "could not resolve '{name}': {reason}")
            }
            HttpcraftError::Plugin(msg) => write!(f, "plugin error: {msg}"),
            HttpcraftError::Transport { kind, message } => write!(f, "{kind}: {message}"),
            HttpcraftError::HttpStatus { status, message } => {
                write!(f, "HTTP {status}: {message}")
            }
            HttpcraftError::Cache(msg) => write!(f, "cache error: {msg}"),
            HttpcraftError::Auth(msg) => write!(f, "authentication failed: {msg}"),
            HttpcraftError::Io(err) => write!(f, "I/O error: {err}"),
            HttpcraftError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for HttpcraftError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HttpcraftError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HttpcraftError {
    fn from(err: std::io::Error) -> Self {
        HttpcraftError::Io(err)
    }
}

impl HttpcraftError {
    /// Shorthand for a variable resolution failure.
    pub fn variable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        HttpcraftError::VariableResolution {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// The stderr prefix the top-level handler prints for this category.
    pub fn prefix(&self) -> &'static str {
        match self {
            HttpcraftError::Config(_) => "Configuration Error:",
            HttpcraftError::VariableResolution { .. } => "Variable Error:",
            _ => "Error:",
        }
    }
}

/// Result type alias for httpcraft operations
pub type HcResult<T> = std::result::Result<T, HttpcraftError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn config_context(self, context: &str) -> HcResult<T>;
    fn with_context(self, context: &str) -> HcResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn config_context(self, context: &str) -> HcResult<T> {
        self.map_err(|e| HttpcraftError::Config(format!("{context}: {e}")))
    }

    fn with_context(self, context: &str) -> HcResult<T> {
        self.map_err(|e| HttpcraftError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::HttpcraftError::Config(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! plugin_error {
    ($($arg:tt)*) => {
        $crate::core::error::HttpcraftError::Plugin(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matches_error_category() {
        assert_eq!(
            HttpcraftError::Config("bad yaml".into()).prefix(),
            "Configuration Error:"
        );
        assert_eq!(
            HttpcraftError::variable("secret.KEY", "no resolver").prefix(),
            "Variable Error:"
        );
        assert_eq!(
            HttpcraftError::Plugin("missing setup".into()).prefix(),
            "Error:"
        );
    }

    #[test]
    fn variable_errors_name_the_placeholder() {
        let err = HttpcraftError::variable("secret.API_KEY", "no resolver produced a value");
        let text = err.to_string();
        assert!(text.contains("secret.API_KEY"));
        assert!(text.contains("no resolver"));
    }
}
