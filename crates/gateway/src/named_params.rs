//! Rewrites `:name` placeholders into Postgres positional parameters.
//!
//! Every occurrence gets its own `$n`, numbered in textual order, so the bound
//! values line up with the references one to one. Quoted literals, quoted
//! identifiers, dollar-quoted bodies, comments and `::` casts pass through
//! untouched.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct NamedStatement {
    pub sql: String,
    /// Parameter name behind each positional bind, in bind order.
    pub names: Vec<String>,
    pub binds: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedParamError {
    pub message: String,
}

impl std::fmt::Display for NamedParamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NamedParamError {}

pub fn expand(sql: &str, params: &Map<String, Value>) -> Result<NamedStatement, NamedParamError> {
    let mut out = NamedStatement {
        sql: String::with_capacity(sql.len() + 8),
        names: Vec::new(),
        binds: Vec::new(),
    };

    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let end = skip_quoted(bytes, i);
                out.sql.push_str(&sql[i..end]);
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..].find('\n').map(|n| i + n).unwrap_or(bytes.len());
                out.sql.push_str(&sql[i..end]);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..]
                    .find("*/")
                    .map(|n| i + 2 + n + 2)
                    .unwrap_or(bytes.len());
                out.sql.push_str(&sql[i..end]);
                i = end;
            }
            b'$' => {
                let end = skip_dollar_quoted(sql, i).unwrap_or(i + 1);
                out.sql.push_str(&sql[i..end]);
                i = end;
            }
            b':' if bytes.get(i + 1) == Some(&b':') => {
                out.sql.push_str("::");
                i += 2;
            }
            b':' => {
                let Some((name, end)) = placeholder_at(sql, i) else {
                    out.sql.push(':');
                    i += 1;
                    continue;
                };
                let value = params.get(name).ok_or_else(|| NamedParamError {
                    message: format!("no value supplied for SQL parameter `:{}`", name),
                })?;
                push_value(&mut out, name, value)?;
                i = end;
            }
            _ => {
                let ch_len = utf8_len(bytes[i]);
                out.sql.push_str(&sql[i..i + ch_len]);
                i += ch_len;
            }
        }
    }

    Ok(out)
}

fn push_value(out: &mut NamedStatement, name: &str, value: &Value) -> Result<(), NamedParamError> {
    match value {
        Value::Array(items) if items.is_empty() => out.sql.push_str("NULL"),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.sql.push_str(", ");
                }
                match item {
                    Value::Array(tuple) if tuple.is_empty() => {
                        return Err(NamedParamError {
                            message: format!("SQL parameter `:{}` contains an empty tuple", name),
                        });
                    }
                    Value::Array(tuple) => {
                        out.sql.push('(');
                        for (t_idx, member) in tuple.iter().enumerate() {
                            if t_idx > 0 {
                                out.sql.push_str(", ");
                            }
                            push_bind(out, name, member.clone());
                        }
                        out.sql.push(')');
                    }
                    other => push_bind(out, name, other.clone()),
                }
            }
        }
        other => push_bind(out, name, other.clone()),
    }
    Ok(())
}

fn push_bind(out: &mut NamedStatement, name: &str, value: Value) {
    out.binds.push(value);
    out.names.push(name.to_string());
    out.sql.push('$');
    out.sql.push_str(&out.binds.len().to_string());
}

// `:name` or `:{name}`; names are runs of letters, digits, `_` and `.`.
fn placeholder_at(sql: &str, colon: usize) -> Option<(&str, usize)> {
    let rest = &sql[colon + 1..];
    if let Some(braced) = rest.strip_prefix('{') {
        let close = braced.find('}')?;
        let name = &braced[..close];
        if name.is_empty() || !name.bytes().all(is_name_byte) {
            return None;
        }
        return Some((name, colon + 1 + 1 + close + 1));
    }

    let len = rest.bytes().take_while(|b| is_name_byte(*b)).count();
    let name = rest[..len].trim_end_matches('.');
    if name.is_empty() {
        return None;
    }
    Some((name, colon + 1 + name.len()))
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

// `$tag$ ... $tag$` with an optional identifier tag. `$1` is not a quote.
fn skip_dollar_quoted(sql: &str, start: usize) -> Option<usize> {
    let rest = &sql[start + 1..];
    let tag_len = rest
        .bytes()
        .enumerate()
        .take_while(|(idx, b)| {
            if *idx == 0 {
                b.is_ascii_alphabetic() || *b == b'_'
            } else {
                b.is_ascii_alphanumeric() || *b == b'_'
            }
        })
        .count();
    if rest.as_bytes().get(tag_len) != Some(&b'$') {
        return None;
    }

    let delimiter = &sql[start..start + tag_len + 2];
    let body_start = start + delimiter.len();
    let close = sql[body_start..]
        .find(delimiter)
        .map(|n| body_start + n + delimiter.len())
        .unwrap_or(sql.len());
    Some(close)
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}
