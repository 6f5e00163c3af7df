//! Expression language used by executor definitions.
//!
//! Two forms are supported. A [`SimpleExpression`] is evaluated against a JSON
//! root (`requestParams.id`, `columns.![name]`, `flag ? 'a' : 'b'`). A
//! [`TemplateExpression`] is literal text with `${...}` segments, each holding a
//! simple expression evaluated against the same root.
//!
//! Both are parsed once, when the configuration document is loaded, and can be
//! evaluated any number of times afterwards.

use serde_json::Value;

mod eval;
mod lexer;
mod parser;

pub const ERR_EXPR_PARSE: &str = "ERR_EXPR_PARSE";
pub const ERR_EXPR_UNRESOLVED: &str = "ERR_EXPR_UNRESOLVED";
pub const ERR_EXPR_TYPE: &str = "ERR_EXPR_TYPE";
pub const ERR_EXPR_TEMPLATE: &str = "ERR_EXPR_TEMPLATE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionError {
    pub code: &'static str,
    pub message: String,
}

impl ExpressionError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ExpressionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    String,
    Object,
    Collection,
    Boolean,
}

#[derive(Debug, Clone)]
pub struct SimpleExpression {
    source: String,
    ast: parser::Expr,
}

impl SimpleExpression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let ast = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, root: &Value) -> Result<Value, ExpressionError> {
        eval::evaluate(&self.ast, root)
    }

    pub fn evaluate_as(&self, root: &Value, target: TargetType) -> Result<Value, ExpressionError> {
        coerce(self.evaluate(root)?, target)
    }
}

impl PartialEq for SimpleExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TemplatePart {
    Literal(String),
    Expr(SimpleExpression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateExpression {
    source: String,
    parts: Vec<TemplatePart>,
}

impl TemplateExpression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(start) = rest.find("${") {
            literal.push_str(&rest[..start]);
            let body_start = start + 2;
            let body_len = placeholder_len(&rest[body_start..]).ok_or_else(|| {
                ExpressionError::new(
                    ERR_EXPR_TEMPLATE,
                    format!(
                        "unterminated `${{` at offset {} in template `{}`",
                        source.len() - rest.len() + start,
                        source
                    ),
                )
            })?;
            let body = &rest[body_start..body_start + body_len];
            if body.trim().is_empty() {
                return Err(ExpressionError::new(
                    ERR_EXPR_TEMPLATE,
                    format!("empty `${{}}` placeholder in template `{}`", source),
                ));
            }

            if !literal.is_empty() {
                parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
            }
            parts.push(TemplatePart::Expr(SimpleExpression::parse(body)?));
            rest = &rest[body_start + body_len + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// Wraps plain text so it renders verbatim.
    pub fn literal(text: &str) -> Self {
        let parts = if text.is_empty() {
            Vec::new()
        } else {
            vec![TemplatePart::Literal(text.to_string())]
        };
        Self {
            source: text.to_string(),
            parts,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// A template that is exactly one `${...}` yields that expression's raw
    /// value; anything else renders to a string.
    pub fn evaluate(&self, root: &Value) -> Result<Value, ExpressionError> {
        match self.parts.as_slice() {
            [] => Ok(Value::String(String::new())),
            [TemplatePart::Expr(expr)] => expr.evaluate(root),
            parts => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Literal(text) => out.push_str(text),
                        TemplatePart::Expr(expr) => out.push_str(&stringify(&expr.evaluate(root)?)),
                    }
                }
                Ok(Value::String(out))
            }
        }
    }

    pub fn evaluate_as(&self, root: &Value, target: TargetType) -> Result<Value, ExpressionError> {
        coerce(self.evaluate(root)?, target)
    }

    /// Evaluates to a string, with `None` for a null result.
    pub fn evaluate_string(&self, root: &Value) -> Result<Option<String>, ExpressionError> {
        match self.evaluate_as(root, TargetType::String)? {
            Value::String(s) => Ok(Some(s)),
            _ => Ok(None),
        }
    }
}

// Length of the placeholder body up to its matching `}`, skipping braces that
// appear inside quoted literals or inline collections.
fn placeholder_len(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut chars = body.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if in_quote {
            match ch {
                '\\' => {
                    chars.next();
                }
                '\'' => {
                    if chars.peek().is_some_and(|(_, c)| *c == '\'') {
                        chars.next();
                    } else {
                        in_quote = false;
                    }
                }
                _ => {}
            }
            continue;
        }
        match ch {
            '\'' => in_quote = true,
            '{' => depth += 1,
            '}' if depth == 0 => return Some(idx),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Renders a value the way templates concatenate it: strings verbatim, null
/// as empty text, containers as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

pub fn coerce(value: Value, target: TargetType) -> Result<Value, ExpressionError> {
    match target {
        TargetType::Object => Ok(value),
        TargetType::String => Ok(match value {
            Value::Null => Value::Null,
            Value::String(s) => Value::String(s),
            other => Value::String(stringify(&other)),
        }),
        TargetType::Collection => Ok(match value {
            Value::Null => Value::Array(Vec::new()),
            Value::Array(items) => Value::Array(items),
            Value::Object(map) => Value::Array(map.into_iter().map(|(_, v)| v).collect()),
            scalar => Value::Array(vec![scalar]),
        }),
        TargetType::Boolean => Ok(Value::Bool(eval::truthy(&value).map_err(|_| {
            ExpressionError::new(
                ERR_EXPR_TYPE,
                format!("cannot convert {} to boolean", eval::type_name_of(&value)),
            )
        })?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_concatenates_literals_and_values() {
        let t = TemplateExpression::parse("${columns.name} (${params.id})").unwrap();
        let root = json!({"columns": {"name": "alice"}, "params": {"id": "7"}});
        assert_eq!(t.evaluate(&root).unwrap(), json!("alice (7)"));
    }

    #[test]
    fn single_placeholder_keeps_raw_value() {
        let t = TemplateExpression::parse("${ids}").unwrap();
        let root = json!({"ids": [1, 2, 3]});
        assert_eq!(t.evaluate(&root).unwrap(), json!([1, 2, 3]));
        assert_eq!(
            t.evaluate_as(&root, TargetType::String).unwrap(),
            json!("[1,2,3]")
        );
    }

    #[test]
    fn literal_template_and_null_rendering() {
        let t = TemplateExpression::parse("SELECT 1").unwrap();
        assert_eq!(t.evaluate(&json!({})).unwrap(), json!("SELECT 1"));

        let t = TemplateExpression::parse("x=${missing}").unwrap();
        assert_eq!(t.evaluate(&json!({})).unwrap(), json!("x="));
        let t = TemplateExpression::parse("${missing}").unwrap();
        assert_eq!(t.evaluate_string(&json!({})).unwrap(), None);
    }

    #[test]
    fn placeholder_may_contain_braces_and_quotes() {
        let t = TemplateExpression::parse("a${ {'k}': x}['k}'] }b").unwrap();
        assert_eq!(t.evaluate(&json!({"x": 1})).unwrap(), json!("a1b"));
    }

    #[test]
    fn dollar_without_brace_is_literal() {
        let t = TemplateExpression::parse("cost $5").unwrap();
        assert_eq!(t.evaluate(&json!({})).unwrap(), json!("cost $5"));
    }

    #[test]
    fn malformed_templates_fail() {
        assert_eq!(
            TemplateExpression::parse("${abc").unwrap_err().code,
            ERR_EXPR_TEMPLATE
        );
        assert_eq!(
            TemplateExpression::parse("x ${ } y").unwrap_err().code,
            ERR_EXPR_TEMPLATE
        );
        assert_eq!(
            TemplateExpression::parse("${a +}").unwrap_err().code,
            ERR_EXPR_PARSE
        );
    }

    #[test]
    fn coercion_targets() {
        assert_eq!(coerce(json!(5), TargetType::String).unwrap(), json!("5"));
        assert_eq!(coerce(Value::Null, TargetType::String).unwrap(), Value::Null);
        assert_eq!(coerce(Value::Null, TargetType::Collection).unwrap(), json!([]));
        assert_eq!(coerce(json!("a"), TargetType::Collection).unwrap(), json!(["a"]));
        assert_eq!(
            coerce(json!({"a": 1, "b": 2}), TargetType::Collection).unwrap(),
            json!([1, 2])
        );
        assert_eq!(coerce(json!("TRUE"), TargetType::Boolean).unwrap(), json!(true));
        assert_eq!(
            coerce(json!([1]), TargetType::Boolean).unwrap_err().code,
            ERR_EXPR_TYPE
        );
    }

    #[test]
    fn simple_expression_keeps_source() {
        let e = SimpleExpression::parse("a.b").unwrap();
        assert_eq!(e.source(), "a.b");
        assert_eq!(e.evaluate_as(&json!({"a": {"b": 3}}), TargetType::String).unwrap(), json!("3"));
    }
}
