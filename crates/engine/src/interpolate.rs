//! Context interpolation for step and rollback arguments.
//!
//! String values may contain `${a.b.c}` placeholders, resolved against the
//! execution's scope by dot-path.  A string that is exactly one placeholder is
//! replaced by the resolved JSON value itself; placeholders embedded in longer
//! text are replaced by the value's text form.  Unresolvable placeholders are
//! left as the literal token.

use serde_json::{Map, Value};

/// Interpolate every string in `template` against `scope`, recursively.
pub fn interpolate(template: &Value, scope: &Value) -> Value {
    match template {
        Value::String(s) => interpolate_str(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, scope)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), interpolate(v, scope)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Look up a dot-separated path; numeric segments index into arrays.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn interpolate_str(s: &str, scope: &Value) -> Value {
    if let Some(path) = whole_placeholder(s) {
        return match lookup(scope, path) {
            Some(value) => value.clone(),
            None => Value::String(s.to_owned()),
        };
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let path = &rest[start + 2..start + 2 + len];
        let token = &rest[start..start + 3 + len];

        out.push_str(&rest[..start]);
        match lookup(scope, path.trim()) {
            Some(value) => out.push_str(&as_text(value)),
            None => out.push_str(token),
        }
        rest = &rest[start + 3 + len..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// `Some(path)` when `s` is a single `${path}` token and nothing else.
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains('}') && !inner.contains("${")).then(|| inner.trim())
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
