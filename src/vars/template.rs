//! `{{…}}` template scanning and the parameterized-call grammar.
//!
//! Placeholders are extracted with a balanced scanner rather than a regex:
//! parameterized plugin calls may carry nested `{{…}}` templates as
//! arguments (`{{plugins.p.f({{userId}}, "x")}}`), which a flat pattern
//! cannot delimit correctly.

/// A single `{{…}}` occurrence inside a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Byte offset of the opening `{{`
    pub start: usize,
    /// Byte offset just past the closing `}}`
    pub end: usize,
    /// Trimmed placeholder content with the optional `?` marker stripped
    pub name: String,
    /// Whether the occurrence carried the trailing `?` marker
    pub optional: bool,
}

/// Scan `template` for top-level `{{…}}` occurrences, honoring one level of
/// nesting inside each occurrence. Unterminated openings are left as
/// literal text.
pub fn find_placeholders(template: &str) -> Vec<Placeholder> {
    let bytes = template.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if &bytes[i..i + 2] != b"{{" {
            i += 1;
            continue;
        }
        match find_closing(bytes, i) {
            Some(end) => {
                let inner = template[i + 2..end - 2].trim();
                let (name, optional) = match inner.strip_suffix('?') {
                    Some(stripped) => (stripped.trim_end(), true),
                    None => (inner, false),
                };
                found.push(Placeholder {
                    start: i,
                    end,
                    name: name.to_string(),
                    optional,
                });
                i = end;
            }
            None => break,
        }
    }
    found
}

/// Find the offset just past the `}}` matching the `{{` at `open`.
fn find_closing(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut j = open;
    while j + 1 < bytes.len() {
        if &bytes[j..j + 2] == b"{{" {
            depth += 1;
            j += 2;
        } else if &bytes[j..j + 2] == b"}}" {
            depth -= 1;
            j += 2;
            if depth == 0 {
                return Some(j);
            }
        } else {
            j += 1;
        }
    }
    None
}

/// If the whole of `value` (modulo surrounding whitespace) is one single
/// placeholder, return it. Used for optional header/param elision and for
/// preserving non-string values under substitution.
pub fn single_placeholder(value: &str) -> Option<Placeholder> {
    let placeholders = find_placeholders(value);
    if placeholders.len() != 1 {
        return None;
    }
    let ph = placeholders.into_iter().next().unwrap();
    if value[..ph.start].trim().is_empty() && value[ph.end..].trim().is_empty() {
        Some(ph)
    } else {
        None
    }
}

/// One argument of a parameterized plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    /// A double-quoted string with `\"` and `\\` escapes applied
    Literal(String),
    /// An unquoted `{{…}}` template, resolved in the calling context
    Template(String),
}

/// A parsed `plugins.<plugin>.<func>(args…)` call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub plugin: String,
    pub func: String,
    pub args: Vec<CallArg>,
}

/// Parse a placeholder name as a parameterized call.
///
/// Returns `None` when the name does not look like a call at all (no
/// `plugins.` prefix or no parenthesis), so the caller can fall back to
/// plain variable lookup. A name that looks like a call but violates the
/// grammar is a hard error naming the defect.
pub fn parse_function_call(name: &str) -> Option<Result<FunctionCall, String>> {
    if !name.starts_with("plugins.") || !name.contains('(') {
        return None;
    }
    Some(parse_call_inner(name))
}

fn parse_call_inner(name: &str) -> Result<FunctionCall, String> {
    let open = name.find('(').unwrap();
    let head = &name[..open];
    let tail = name[open..].trim();
    if !tail.ends_with(')') {
        return Err("missing closing ')'".to_string());
    }
    let args_src = &tail[1..tail.len() - 1];

    let parts: Vec<&str> = head.split('.').collect();
    let [_, plugin, func] = parts.as_slice() else {
        return Err(format!("expected plugins.<plugin>.<function>, got '{head}'"));
    };
    if plugin.is_empty() || func.is_empty() {
        return Err(format!("expected plugins.<plugin>.<function>, got '{head}'"));
    }

    let args = parse_args(args_src)?;
    Ok(FunctionCall {
        plugin: plugin.to_string(),
        func: func.to_string(),
        args,
    })
}

fn parse_args(src: &str) -> Result<Vec<CallArg>, String> {
    let mut args = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        match bytes[i] {
            b'"' => {
                let (literal, next) = parse_quoted(src, i)?;
                args.push(CallArg::Literal(literal));
                i = next;
            }
            b'{' if i + 1 < bytes.len() && bytes[i + 1] == b'{' => {
                let end = find_closing(bytes, i)
                    .ok_or_else(|| "unterminated {{…}} argument".to_string())?;
                args.push(CallArg::Template(src[i..end].to_string()));
                i = end;
            }
            other => {
                return Err(format!(
                    "unexpected character '{}' in argument list; arguments are quoted strings or {{{{…}}}} templates",
                    other as char
                ));
            }
        }

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        if bytes[i] != b',' {
            return Err(format!("expected ',' between arguments, got '{}'", bytes[i] as char));
        }
        i += 1;
    }

    Ok(args)
}

/// Parse a double-quoted string starting at `open`; commas inside the quotes
/// are literal. Returns the unescaped content and the offset past the
/// closing quote.
fn parse_quoted(src: &str, open: usize) -> Result<(String, usize), String> {
    let bytes = src.as_bytes();
    let mut out = String::new();
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() && (bytes[i + 1] == b'"' || bytes[i + 1] == b'\\') => {
                out.push(bytes[i + 1] as char);
                i += 2;
            }
            b'"' => return Ok((out, i + 1)),
            _ => {
                // Multi-byte characters are copied verbatim.
                let ch = src[i..].chars().next().unwrap();
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    Err("unterminated string literal".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_plain_and_optional_placeholders() {
        let found = find_placeholders("/v/{{id}}/items?page={{ pageKey? }}");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "id");
        assert!(!found[0].optional);
        assert_eq!(found[1].name, "pageKey");
        assert!(found[1].optional);
    }

    #[test]
    fn nested_call_is_one_placeholder() {
        let found = find_placeholders(r#"x={{plugins.p.f({{userId}}, "a,b")}}"#);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, r#"plugins.p.f({{userId}}, "a,b")"#);
    }

    #[test]
    fn single_placeholder_requires_nothing_else() {
        assert!(single_placeholder("{{pageKey?}}").is_some());
        assert!(single_placeholder("  {{ pageKey? }}  ").is_some());
        assert!(single_placeholder("x{{pageKey?}}").is_none());
        assert!(single_placeholder("{{a}}{{b}}").is_none());
    }

    #[test]
    fn parses_call_with_mixed_args() {
        let call = parse_function_call(r#"plugins.vault.read("kv/data/app", {{env}})"#)
            .unwrap()
            .unwrap();
        assert_eq!(call.plugin, "vault");
        assert_eq!(call.func, "read");
        assert_eq!(
            call.args,
            vec![
                CallArg::Literal("kv/data/app".to_string()),
                CallArg::Template("{{env}}".to_string()),
            ]
        );
    }

    #[test]
    fn quoted_commas_and_escapes_are_literal() {
        let call = parse_function_call(r#"plugins.p.f("a,b", "say \"hi\" \\ done")"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            call.args,
            vec![
                CallArg::Literal("a,b".to_string()),
                CallArg::Literal(r#"say "hi" \ done"#.to_string()),
            ]
        );
    }

    #[test]
    fn empty_argument_list_is_valid() {
        let call = parse_function_call("plugins.p.now()").unwrap().unwrap();
        assert!(call.args.is_empty());
    }

    #[test]
    fn non_call_names_fall_through() {
        assert!(parse_function_call("plugins.p.value").is_none());
        assert!(parse_function_call("profile.key").is_none());
    }

    #[test]
    fn malformed_calls_are_hard_errors() {
        assert!(parse_function_call("plugins.p.f(").unwrap().is_err());
        assert!(parse_function_call("plugins.p.f(bare)").unwrap().is_err());
        assert!(parse_function_call(r#"plugins.p.f("x" "y")"#).unwrap().is_err());
        assert!(parse_function_call(r#"plugins.p(42)"#).unwrap().is_err());
    }
}
