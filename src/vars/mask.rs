//! Tracked masking of resolved secret values.
//!
//! Every value that reaches the request pipeline through a `secret.*`
//! placeholder is recorded here, and all diagnostic output passes through
//! [`SecretMask::mask`] before it is written anywhere.

use std::sync::Mutex;

/// Upper bound on tracked values. Old entries are never evicted below the
/// bound; once full, new values are dropped rather than growing unbounded.
const MAX_TRACKED: usize = 1024;

/// Replacement text for every tracked secret occurrence.
pub const MASK: &str = "[SECRET]";

/// Process-wide set of resolved secret values, owned by the top-level `App`
/// and shared by reference with the resolver and the output layer.
#[derive(Default)]
pub struct SecretMask {
    values: Mutex<Vec<String>>,
}

impl SecretMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolved secret value for masking. Deduplicated; empty
    /// values are ignored since replacing them would corrupt output.
    pub fn track(&self, value: &str) {
        if value.is_empty() {
            return;
        }
        let mut values = self.values.lock().unwrap();
        if values.len() >= MAX_TRACKED {
            return;
        }
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
    }

    /// Replace every occurrence of any tracked value with [`MASK`].
    ///
    /// Longer values are replaced first so that a secret which is a
    /// substring of another cannot leave a partial value behind.
    pub fn mask(&self, text: &str) -> String {
        let mut values = self.values.lock().unwrap().clone();
        if values.is_empty() {
            return text.to_string();
        }
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        let mut masked = text.to_string();
        for value in &values {
            if masked.contains(value.as_str()) {
                masked = masked.replace(value.as_str(), MASK);
            }
        }
        masked
    }

    pub fn tracked_count(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    /// Drop all tracked values. Intended for tests.
    pub fn reset(&self) {
        self.values.lock().unwrap().clear();
    }
}
