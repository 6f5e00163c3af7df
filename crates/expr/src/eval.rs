use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::parser::{BinaryOp, Expr};
use crate::{ERR_EXPR_TYPE, ERR_EXPR_UNRESOLVED, ExpressionError, stringify};

struct Scope<'a> {
    root: &'a Value,
    this: &'a Value,
}

pub(crate) fn evaluate(expr: &Expr, root: &Value) -> Result<Value, ExpressionError> {
    eval(expr, &Scope { root, this: root })
}

fn eval(expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Root => Ok(scope.root.clone()),
        Expr::This => Ok(scope.this.clone()),
        Expr::Ident(name) => property(scope.this, name, false),
        Expr::Property { target, name, safe } => {
            let target = eval(target, scope)?;
            property(&target, name, *safe)
        }
        Expr::Index { target, index } => {
            let target = eval(target, scope)?;
            let index = eval(index, scope)?;
            index_value(&target, &index)
        }
        Expr::Method {
            target,
            name,
            args,
            safe,
        } => {
            let target = eval(target, scope)?;
            if target.is_null() && *safe {
                return Ok(Value::Null);
            }
            let args = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call_method(&target, name, &args)
        }
        Expr::Static {
            type_name,
            method,
            args,
        } => {
            let args = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call_static(type_name, method, &args)
        }
        Expr::Projection { target, expr } => {
            let target = eval(target, scope)?;
            let items = iteration_items(&target, "projection")?;
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(eval(
                    expr,
                    &Scope {
                        root: scope.root,
                        this: item,
                    },
                )?);
            }
            Ok(Value::Array(out))
        }
        Expr::Selection { target, predicate } => {
            let target = eval(target, scope)?;
            match &target {
                Value::Object(map) => {
                    let mut out = Map::new();
                    for (k, v) in map {
                        let entry = entry_value(k, v);
                        let keep = eval(
                            predicate,
                            &Scope {
                                root: scope.root,
                                this: &entry,
                            },
                        )?;
                        if truthy(&keep)? {
                            out.insert(k.clone(), v.clone());
                        }
                    }
                    Ok(Value::Object(out))
                }
                _ => {
                    let items = iteration_items(&target, "selection")?;
                    let mut out = Vec::new();
                    for item in items {
                        let keep = eval(
                            predicate,
                            &Scope {
                                root: scope.root,
                                this: &item,
                            },
                        )?;
                        if truthy(&keep)? {
                            out.push(item);
                        }
                    }
                    Ok(Value::Array(out))
                }
            }
        }
        Expr::List(items) => Ok(Value::Array(
            items
                .iter()
                .map(|i| eval(i, scope))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Expr::Map(entries) => {
            let mut out = Map::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k.clone(), eval(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        Expr::Not(inner) => {
            let value = eval(inner, scope)?;
            Ok(Value::Bool(!truthy(&value)?))
        }
        Expr::Neg(inner) => match eval(inner, scope)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i.checked_neg()
                        .map(Value::from)
                        .ok_or_else(|| type_error("integer overflow".to_string()))
                } else {
                    Ok(float(-n.as_f64().unwrap_or(0.0)))
                }
            }
            other => Err(type_error(format!(
                "cannot negate {}",
                type_name_of(&other)
            ))),
        },
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                let left = eval(left, scope)?;
                if !truthy(&left)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&eval(right, scope)?)?))
            }
            BinaryOp::Or => {
                let left = eval(left, scope)?;
                if truthy(&left)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&eval(right, scope)?)?))
            }
            _ => {
                let left = eval(left, scope)?;
                let right = eval(right, scope)?;
                binary(*op, &left, &right)
            }
        },
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if truthy(&eval(cond, scope)?)? {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Expr::Elvis { value, fallback } => {
            let value = eval(value, scope)?;
            let empty = match &value {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                _ => false,
            };
            if empty { eval(fallback, scope) } else { Ok(value) }
        }
    }
}

// Map keys that are absent resolve to null; only non-container values fail.
fn property(target: &Value, name: &str, safe: bool) -> Result<Value, ExpressionError> {
    match target {
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Null if safe => Ok(Value::Null),
        Value::Null => Err(unresolved(format!(
            "cannot read property `{}` of null",
            name
        ))),
        other => Err(unresolved(format!(
            "property `{}` cannot be found on {}",
            name,
            type_name_of(other)
        ))),
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, ExpressionError> {
    match (target, index) {
        (Value::Object(map), key) => Ok(map.get(&stringify(key)).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), Value::Number(n)) => {
            let idx = n
                .as_u64()
                .ok_or_else(|| type_error(format!("invalid list index {}", n)))?;
            items.get(idx as usize).cloned().ok_or_else(|| {
                unresolved(format!(
                    "index {} out of bounds for list of size {}",
                    idx,
                    items.len()
                ))
            })
        }
        (Value::String(s), Value::Number(n)) => {
            let idx = n
                .as_u64()
                .ok_or_else(|| type_error(format!("invalid string index {}", n)))?;
            s.chars()
                .nth(idx as usize)
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| unresolved(format!("index {} out of bounds for string", idx)))
        }
        (Value::Null, _) => Err(unresolved("cannot index into null".to_string())),
        (other, index) => Err(type_error(format!(
            "cannot index {} with {}",
            type_name_of(other),
            type_name_of(index)
        ))),
    }
}

fn entry_value(key: &str, value: &Value) -> Value {
    let mut entry = Map::with_capacity(2);
    entry.insert("key".to_string(), Value::String(key.to_string()));
    entry.insert("value".to_string(), value.clone());
    Value::Object(entry)
}

fn iteration_items(target: &Value, what: &str) -> Result<Vec<Value>, ExpressionError> {
    match target {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map.iter().map(|(k, v)| entry_value(k, v)).collect()),
        Value::Null => Err(unresolved(format!("{} target is null", what))),
        other => Err(type_error(format!(
            "{} requires a list or map, got {}",
            what,
            type_name_of(other)
        ))),
    }
}

pub(crate) fn truthy(value: &Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(type_error(format!(
            "cannot convert {} to boolean",
            type_name_of(other)
        ))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(left, right)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b),
            (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                "{}{}",
                stringify(left),
                stringify(right)
            ))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => Err(type_error(format!(
                "cannot add {} and {}",
                type_name_of(left),
                type_name_of(right)
            ))),
        },
        _ => match (left, right) {
            (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b),
            _ => Err(type_error(format!(
                "arithmetic requires numbers, got {} and {}",
                type_name_of(left),
                type_name_of(right)
            ))),
        },
    }
}

fn arithmetic(op: BinaryOp, a: &Number, b: &Number) -> Result<Value, ExpressionError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div | BinaryOp::Rem if y == 0 => {
                return Err(type_error("division by zero".to_string()));
            }
            BinaryOp::Div => x.checked_div(y),
            BinaryOp::Rem => x.checked_rem(y),
            _ => None,
        };
        return result
            .map(Value::from)
            .ok_or_else(|| type_error("integer overflow".to_string()));
    }

    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        BinaryOp::Rem => x % y,
        _ => f64::NAN,
    };
    if !result.is_finite() {
        return Err(type_error("non-finite arithmetic result".to_string()));
    }
    Ok(float(result))
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, ExpressionError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                return Ok(x.cmp(&y));
            }
            a.as_f64()
                .zip(b.as_f64())
                .and_then(|(x, y)| x.partial_cmp(&y))
                .ok_or_else(|| type_error("cannot compare numbers".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        _ => Err(type_error(format!(
            "cannot compare {} with {}",
            type_name_of(left),
            type_name_of(right)
        ))),
    }
}

fn call_method(target: &Value, name: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match (target, name, args) {
        (_, "toString", []) => Ok(Value::String(stringify(target))),
        (Value::String(s), "length", []) | (Value::String(s), "size", []) => {
            Ok(Value::from(s.chars().count() as u64))
        }
        (Value::String(s), "isEmpty", []) => Ok(Value::Bool(s.is_empty())),
        (Value::String(s), "trim", []) => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "toUpperCase", []) => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "toLowerCase", []) => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "substring", [start]) => {
            let start = usize_arg(start, "substring")?;
            substring(s, start, None)
        }
        (Value::String(s), "substring", [start, end]) => {
            let start = usize_arg(start, "substring")?;
            let end = usize_arg(end, "substring")?;
            substring(s, start, Some(end))
        }
        (Value::String(s), "indexOf", [needle]) => {
            let needle = stringify(needle);
            Ok(match s.find(needle.as_str()) {
                Some(byte_idx) => Value::from(s[..byte_idx].chars().count() as i64),
                None => Value::from(-1),
            })
        }
        (Value::String(s), "contains", [needle]) => {
            Ok(Value::Bool(s.contains(stringify(needle).as_str())))
        }
        (Value::String(s), "startsWith", [prefix]) => {
            Ok(Value::Bool(s.starts_with(stringify(prefix).as_str())))
        }
        (Value::String(s), "endsWith", [suffix]) => {
            Ok(Value::Bool(s.ends_with(stringify(suffix).as_str())))
        }
        (Value::String(s), "replace", [from, to]) => Ok(Value::String(
            s.replace(stringify(from).as_str(), stringify(to).as_str()),
        )),
        (Value::String(s), "split", [sep]) => {
            let sep = stringify(sep);
            if sep.is_empty() {
                return Ok(Value::Array(
                    s.chars().map(|c| Value::String(c.to_string())).collect(),
                ));
            }
            Ok(Value::Array(
                s.split(sep.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        (Value::Array(items), "size", []) => Ok(Value::from(items.len() as u64)),
        (Value::Array(items), "isEmpty", []) => Ok(Value::Bool(items.is_empty())),
        (Value::Array(items), "contains", [needle]) => {
            Ok(Value::Bool(items.iter().any(|i| loose_eq(i, needle))))
        }
        (Value::Array(items), "get", [idx]) => index_value(&Value::Array(items.clone()), idx),
        (Value::Object(map), "size", []) => Ok(Value::from(map.len() as u64)),
        (Value::Object(map), "isEmpty", []) => Ok(Value::Bool(map.is_empty())),
        (Value::Object(map), "containsKey", [key]) => {
            Ok(Value::Bool(map.contains_key(&stringify(key))))
        }
        (Value::Object(map), "get", [key]) => {
            Ok(map.get(&stringify(key)).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), "keySet", []) => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        (Value::Object(map), "values", []) => Ok(Value::Array(map.values().cloned().collect())),
        (Value::Null, _, _) => Err(unresolved(format!(
            "cannot call method `{}` on null",
            name
        ))),
        _ => Err(unresolved(format!(
            "method `{}` with {} argument(s) cannot be found on {}",
            name,
            args.len(),
            type_name_of(target)
        ))),
    }
}

fn call_static(type_name: &str, method: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match (type_name, method, args) {
        ("String", "join", [sep, items]) => {
            let sep = stringify(sep);
            let parts = match items {
                Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>(),
                Value::Null => Vec::new(),
                other => vec![stringify(other)],
            };
            Ok(Value::String(parts.join(sep.as_str())))
        }
        ("String", "valueOf", [v]) => Ok(Value::String(stringify(v))),
        ("Integer", "parseInt", [v]) | ("Long", "parseLong", [v]) => stringify(v)
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| type_error(format!("cannot parse `{}` as an integer", stringify(v)))),
        ("Double", "parseDouble", [v]) => stringify(v)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(float)
            .ok_or_else(|| type_error(format!("cannot parse `{}` as a number", stringify(v)))),
        ("Boolean", "parseBoolean", [v]) => Ok(Value::Bool(
            stringify(v).trim().eq_ignore_ascii_case("true"),
        )),
        _ => Err(unresolved(format!(
            "static method T({}).{} with {} argument(s) is not available",
            type_name,
            method,
            args.len()
        ))),
    }
}

fn usize_arg(value: &Value, method: &str) -> Result<usize, ExpressionError> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| type_error(format!("{} expects non-negative integer arguments", method)))
}

fn substring(s: &str, start: usize, end: Option<usize>) -> Result<Value, ExpressionError> {
    let chars = s.chars().collect::<Vec<_>>();
    let end = end.unwrap_or(chars.len());
    if start > end || end > chars.len() {
        return Err(type_error(format!(
            "substring({}, {}) out of range for length {}",
            start,
            end,
            chars.len()
        )));
    }
    Ok(Value::String(chars[start..end].iter().collect()))
}

pub(crate) fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn unresolved(message: String) -> ExpressionError {
    ExpressionError::new(ERR_EXPR_UNRESOLVED, message)
}

fn type_error(message: String) -> ExpressionError {
    ExpressionError::new(ERR_EXPR_TYPE, message)
}
