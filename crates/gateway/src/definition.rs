//! Parsing of the executor configuration document.
//!
//! The document is a JSON or YAML object with a single `executors` list. Every
//! expression in an entry is parsed here, so a document that loads cleanly
//! cannot fail later on syntax.

use std::path::Path;

use extapi_contracts::{ERR_CONFIG, ExecutorKind, canonical};
use extapi_expr::{SimpleExpression, TemplateExpression};
use extapi_policy::AccessRequirements;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::executor::fs::{DEFAULT_DIR_POST_PROCESS, DEFAULT_FILE_POST_PROCESS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub code: &'static str,
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ERR_CONFIG,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("yaml" | "yml") => DocumentFormat::Yaml,
            _ => DocumentFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorDefinition {
    pub name: String,
    pub declared_type: String,
    pub access: AccessRequirements,
    pub embed_result_in_data_object: bool,
    pub post_process_expression: Option<SimpleExpression>,
    pub body: ExecutorBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorBody {
    Query(QueryDefinition),
    FsFile(FileDefinition),
    FsDir(DirDefinition),
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefinition {
    pub query_param_expressions: Vec<(String, TemplateExpression)>,
    pub query_expression: TemplateExpression,
    pub output_expressions: Vec<(String, TemplateExpression)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileDefinition {
    pub parent_path_expression: TemplateExpression,
    pub file_name_expression: TemplateExpression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirDefinition {
    pub parent_path_expression: TemplateExpression,
}

impl ExecutorDefinition {
    pub fn kind(&self) -> ExecutorKind {
        match self.body {
            ExecutorBody::Query(_) => ExecutorKind::Query,
            ExecutorBody::FsFile(_) => ExecutorKind::FsFile,
            ExecutorBody::FsDir(_) => ExecutorKind::FsDir,
            ExecutorBody::Other => ExecutorKind::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub definitions: Vec<ExecutorDefinition>,
    pub config_hash: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    executors: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    requires_any_role: Vec<String>,
    #[serde(default)]
    requires_all_permissions: Vec<String>,
    #[serde(default)]
    embed_result_in_data_object: bool,
    post_process_expression: Option<String>,

    query_param_expressions: Option<Map<String, Value>>,
    query_params: Option<Map<String, Value>>,
    query_expression: Option<String>,
    query: Option<String>,
    output_expressions: Option<Map<String, Value>>,
    output: Option<Map<String, Value>>,

    parent_path_expression: Option<String>,
    file_name_expression: Option<String>,
}

pub fn parse_document(bytes: &[u8], format: DocumentFormat) -> Result<ParsedDocument, ConfigError> {
    let document = decode_document(bytes, format)?;
    let config_hash = canonical::hash_canonical_json(&document);

    let raw = if document.is_null() {
        RawDocument::default()
    } else {
        serde_json::from_value::<RawDocument>(document)
            .map_err(|err| ConfigError::new(format!("invalid configuration document: {}", err)))?
    };

    let entries = raw.executors.unwrap_or_default();
    let mut definitions = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.into_iter().enumerate() {
        let definition = parse_entry(entry).map_err(|err| {
            ConfigError::new(format!("executors[{}]: {}", idx, err.message))
        })?;
        if definitions
            .iter()
            .any(|d: &ExecutorDefinition| d.name == definition.name)
        {
            return Err(ConfigError::new(format!(
                "executors[{}]: duplicate executor name `{}`",
                idx, definition.name
            )));
        }
        definitions.push(definition);
    }

    Ok(ParsedDocument {
        definitions,
        config_hash,
    })
}

fn decode_document(bytes: &[u8], format: DocumentFormat) -> Result<Value, ConfigError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Value::Null);
    }

    match format {
        DocumentFormat::Json => serde_json::from_slice::<Value>(bytes)
            .map_err(|err| ConfigError::new(format!("invalid JSON document: {}", err))),
        DocumentFormat::Yaml => serde_yaml::from_slice::<Value>(bytes)
            .map_err(|err| ConfigError::new(format!("invalid YAML document: {}", err))),
    }
}

fn parse_entry(entry: Value) -> Result<ExecutorDefinition, ConfigError> {
    let Some(obj) = entry.as_object() else {
        return Err(ConfigError::new("entry must be an object"));
    };

    let declared_type = obj
        .get("type")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ConfigError::new("`type` is required and must be a string"))?;

    let kind = ExecutorKind::from_config_type(&declared_type);
    if kind == ExecutorKind::Other {
        return parse_other_entry(obj, declared_type);
    }

    let raw = serde_json::from_value::<RawEntry>(entry)
        .map_err(|err| ConfigError::new(err.to_string()))?;
    let name = validate_name(&raw.name)?;

    let result = build_definition(name.clone(), kind, declared_type, raw);
    result.map_err(|err| ConfigError::new(format!("`{}`: {}", name, err.message)))
}

// Entries of unknown types only keep their identity, so lookups under a
// built-in kind can report a mismatch instead of a missing name.
fn parse_other_entry(
    obj: &Map<String, Value>,
    declared_type: String,
) -> Result<ExecutorDefinition, ConfigError> {
    let raw_name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ConfigError::new("`name` is required and must be a string"))?;

    Ok(ExecutorDefinition {
        name: validate_name(raw_name)?,
        declared_type,
        access: AccessRequirements::default(),
        embed_result_in_data_object: false,
        post_process_expression: None,
        body: ExecutorBody::Other,
    })
}

fn validate_name(raw: &str) -> Result<String, ConfigError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ConfigError::new("`name` must be non-empty"));
    }
    if name.contains('/') {
        return Err(ConfigError::new(format!(
            "`name` must not contain `/` (got `{}`)",
            name
        )));
    }
    Ok(name.to_string())
}

fn build_definition(
    name: String,
    kind: ExecutorKind,
    declared_type: String,
    raw: RawEntry,
) -> Result<ExecutorDefinition, ConfigError> {
    let body = match kind {
        ExecutorKind::Query => {
            reject_fields(
                kind,
                &[
                    ("parentPathExpression", raw.parent_path_expression.is_some()),
                    ("fileNameExpression", raw.file_name_expression.is_some()),
                ],
            )?;

            let params = pick_alias(
                "queryParamExpressions",
                raw.query_param_expressions,
                "queryParams",
                raw.query_params,
            )?;
            let query = pick_alias("queryExpression", raw.query_expression, "query", raw.query)?
                .ok_or_else(|| ConfigError::new("`queryExpression` (or `query`) is required"))?;
            let output = pick_alias(
                "outputExpressions",
                raw.output_expressions,
                "output",
                raw.output,
            )?;

            ExecutorBody::Query(QueryDefinition {
                query_param_expressions: parse_template_map("queryParamExpressions", params)?,
                query_expression: parse_template("queryExpression", &query)?,
                output_expressions: parse_template_map("outputExpressions", output)?,
            })
        }
        ExecutorKind::FsFile | ExecutorKind::FsDir => {
            reject_fields(
                kind,
                &[
                    (
                        "queryParamExpressions",
                        raw.query_param_expressions.is_some() || raw.query_params.is_some(),
                    ),
                    (
                        "queryExpression",
                        raw.query_expression.is_some() || raw.query.is_some(),
                    ),
                    (
                        "outputExpressions",
                        raw.output_expressions.is_some() || raw.output.is_some(),
                    ),
                ],
            )?;

            let parent = raw
                .parent_path_expression
                .ok_or_else(|| ConfigError::new("`parentPathExpression` is required"))?;
            let parent_path_expression = parse_template("parentPathExpression", &parent)?;

            if kind == ExecutorKind::FsFile {
                let file_name = raw
                    .file_name_expression
                    .ok_or_else(|| ConfigError::new("`fileNameExpression` is required"))?;
                ExecutorBody::FsFile(FileDefinition {
                    parent_path_expression,
                    file_name_expression: parse_template("fileNameExpression", &file_name)?,
                })
            } else {
                reject_fields(
                    kind,
                    &[("fileNameExpression", raw.file_name_expression.is_some())],
                )?;
                ExecutorBody::FsDir(DirDefinition {
                    parent_path_expression,
                })
            }
        }
        ExecutorKind::Other => ExecutorBody::Other,
    };

    let post_process_source = match (&raw.post_process_expression, kind) {
        (Some(source), _) => Some(source.as_str()),
        (None, ExecutorKind::FsDir) => Some(DEFAULT_DIR_POST_PROCESS),
        (None, ExecutorKind::FsFile) => Some(DEFAULT_FILE_POST_PROCESS),
        (None, _) => None,
    };
    let post_process_expression = post_process_source
        .map(|source| {
            SimpleExpression::parse(source)
                .map_err(|err| ConfigError::new(format!("`postProcessExpression`: {}", err)))
        })
        .transpose()?;

    Ok(ExecutorDefinition {
        name,
        declared_type,
        access: AccessRequirements {
            requires_any_role: trimmed_list(raw.requires_any_role),
            requires_all_permissions: trimmed_list(raw.requires_all_permissions),
        },
        embed_result_in_data_object: raw.embed_result_in_data_object,
        post_process_expression,
        body,
    })
}

fn pick_alias<T>(
    canonical_name: &str,
    canonical: Option<T>,
    alias_name: &str,
    alias: Option<T>,
) -> Result<Option<T>, ConfigError> {
    match (canonical, alias) {
        (Some(_), Some(_)) => Err(ConfigError::new(format!(
            "`{}` and `{}` are alternatives; specify only one",
            canonical_name, alias_name
        ))),
        (Some(v), None) | (None, Some(v)) => Ok(Some(v)),
        (None, None) => Ok(None),
    }
}

fn reject_fields(kind: ExecutorKind, present: &[(&str, bool)]) -> Result<(), ConfigError> {
    let unexpected = present
        .iter()
        .filter(|(_, is_present)| *is_present)
        .map(|(field, _)| format!("`{}`", field))
        .collect::<Vec<_>>();
    if unexpected.is_empty() {
        return Ok(());
    }
    Err(ConfigError::new(format!(
        "{} not valid for type `{}`",
        unexpected.join(", "),
        kind.config_type().unwrap_or("other")
    )))
}

fn parse_template(field: &str, source: &str) -> Result<TemplateExpression, ConfigError> {
    TemplateExpression::parse(source)
        .map_err(|err| ConfigError::new(format!("`{}`: {}", field, err)))
}

fn parse_template_map(
    field: &str,
    map: Option<Map<String, Value>>,
) -> Result<Vec<(String, TemplateExpression)>, ConfigError> {
    let Some(map) = map else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(map.len());
    for (key, value) in map {
        let Some(source) = value.as_str() else {
            return Err(ConfigError::new(format!(
                "`{}.{}` must be a string expression",
                field, key
            )));
        };
        let expr = TemplateExpression::parse(source)
            .map_err(|err| ConfigError::new(format!("`{}.{}`: {}", field, key, err)))?;
        out.push((key, expr));
    }
    Ok(out)
}

fn trimmed_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
