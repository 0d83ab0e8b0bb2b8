//! Restricted JSONPath evaluation over step bodies.
//!
//! Only dot paths (`a.b.c`) and bracketed non-negative integer indexes
//! (`a[0].b`) are supported. Wildcards, filters, slices, and quoted bracket
//! keys are rejected at parse time. A path addresses exactly one node;
//! a missing key or out-of-range index is a zero-match failure.

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    // An optional leading `$.` / `$` root marker is tolerated.
    let path = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    if path.is_empty() {
        return Err("empty JSONPath expression".to_string());
    }

    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut current = String::new();

    let flush = |current: &mut String, segments: &mut Vec<Segment>| -> Result<(), String> {
        if !current.is_empty() {
            if current.contains('*') {
                return Err(format!("wildcard segment '{current}' is not supported"));
            }
            segments.push(Segment::Key(std::mem::take(current)));
        }
        Ok(())
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && segments.is_empty() {
                    return Err("JSONPath may not start with '.'".to_string());
                }
                flush(&mut current, &mut segments)?;
            }
            '[' => {
                flush(&mut current, &mut segments)?;
                let mut index = String::new();
                for ic in chars.by_ref() {
                    if ic == ']' {
                        break;
                    }
                    index.push(ic);
                }
                let index = index.trim();
                if index == "*" {
                    return Err("wildcard index '[*]' is not supported".to_string());
                }
                let parsed: usize = index
                    .parse()
                    .map_err(|_| format!("bracket index '[{index}]' is not a non-negative integer"))?;
                segments.push(Segment::Index(parsed));
            }
            ']' => return Err("unmatched ']' in JSONPath".to_string()),
            _ => current.push(c),
        }
    }
    flush(&mut current, &mut segments)?;

    if segments.is_empty() {
        return Err("empty JSONPath expression".to_string());
    }
    Ok(segments)
}

/// Evaluate `path` against `value`, returning the single addressed node.
pub fn query<'a>(value: &'a JsonValue, path: &str) -> Result<&'a JsonValue, String> {
    let segments = parse_path(path)?;
    let mut current = value;
    for segment in &segments {
        current = match segment {
            Segment::Key(key) => current
                .as_object()
                .and_then(|obj| obj.get(key))
                .ok_or_else(|| format!("no value at key '{key}' in path '{path}'"))?,
            Segment::Index(idx) => current
                .as_array()
                .and_then(|arr| arr.get(*idx))
                .ok_or_else(|| format!("no value at index [{idx}] in path '{path}'"))?,
        };
    }
    Ok(current)
}

/// Evaluate `path` and render the result as a plain string: string nodes
/// unquoted, other nodes in their JSON form.
pub fn query_as_string(value: &JsonValue, path: &str) -> Result<String, String> {
    let node = query(value, path)?;
    Ok(match node {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    })
}
