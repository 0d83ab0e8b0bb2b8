//! URL construction and header/parameter merging.
//!
//! The scheme and authority always come from the API's `baseUrl`; endpoint
//! paths are joined with exactly one `/` between them. Query parameters are
//! appended with standard form encoding.

use std::collections::HashMap;

use url::form_urlencoded;
use url::Url;

/// Join `base_url` and `path` with exactly one `/` between them. One
/// trailing slash on the base is trimmed; a missing leading slash on the
/// path is supplied.
pub fn build_url(base_url: &str, path: &str) -> String {
    let base = base_url.strip_suffix('/').unwrap_or(base_url);
    if path.is_empty() {
        return base.to_string();
    }
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Append `params` to `url` as form-encoded query parameters. Keys are
/// appended in sorted order so the result is deterministic.
pub fn append_query(url: &str, params: &HashMap<String, String>) -> String {
    if params.is_empty() {
        return url.to_string();
    }

    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();

    match Url::parse(url) {
        Ok(mut parsed) => {
            {
                let mut pairs = parsed.query_pairs_mut();
                for key in keys {
                    pairs.append_pair(key, &params[key]);
                }
            }
            parsed.to_string()
        }
        Err(_) => {
            // Fall back to manual encoding for URLs the parser rejects.
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for key in keys {
                serializer.append_pair(key, &params[key]);
            }
            let query = serializer.finish();
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}{query}")
        }
    }
}

/// Shallow merge of header/parameter layers; later layers win on collision.
///
/// Entries elided by optional-placeholder handling never reach these maps,
/// so a key excluded at its defining layer is simply absent here.
pub fn merge_string_maps(layers: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for layer in layers {
        for (key, value) in *layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn joins_with_exactly_one_slash() {
        assert_eq!(
            build_url("https://example.test", "/v1/items"),
            "https://example.test/v1/items"
        );
        assert_eq!(
            build_url("https://example.test/", "/v1/items"),
            "https://example.test/v1/items"
        );
        assert_eq!(
            build_url("https://example.test/", "v1/items"),
            "https://example.test/v1/items"
        );
        assert_eq!(build_url("https://example.test/", ""), "https://example.test");
    }

    #[test]
    fn appends_form_encoded_query() {
        let url = append_query(
            "https://example.test/search",
            &map(&[("q", "a b"), ("page", "2")]),
        );
        assert_eq!(url, "https://example.test/search?page=2&q=a+b");
    }

    #[test]
    fn preserves_existing_query() {
        let url = append_query("https://example.test/x?fixed=1", &map(&[("k", "v")]));
        assert_eq!(url, "https://example.test/x?fixed=1&k=v");
    }

    #[test]
    fn empty_params_leave_url_untouched() {
        assert_eq!(
            append_query("https://example.test/x", &HashMap::new()),
            "https://example.test/x"
        );
    }

    #[test]
    fn later_layers_win_on_merge() {
        let api = map(&[("X-A", "api"), ("X-Shared", "api")]);
        let endpoint = map(&[("X-B", "ep"), ("X-Shared", "ep")]);
        let step = map(&[("X-Shared", "step")]);
        let merged = merge_string_maps(&[&api, &endpoint, &step]);
        assert_eq!(merged.get("X-A").unwrap(), "api");
        assert_eq!(merged.get("X-B").unwrap(), "ep");
        assert_eq!(merged.get("X-Shared").unwrap(), "step");
    }
}
