//! The invocation pipeline shared by every executor kind.
//!
//! An invocation runs the access check, the kind-specific body, the optional
//! post-process expression and the optional `{"data": ...}` envelope, in that
//! order. Nothing touches the body before the principal has passed the check.

use std::time::Instant;

use extapi_auth::Principal;
use extapi_contracts::{
    ERR_ACCESS_DENIED, ERR_AMBIGUOUS, ERR_CONFIG, ERR_EXPRESSION, ERR_INVALID_ARG, ERR_IO,
    ERR_KIND_MISMATCH, ERR_NOT_FOUND, ERR_QUERY, ERR_QUERY_TIMEOUT, ExecutorKind, envelope,
};
use extapi_expr::{ExpressionError, TargetType};
use extapi_policy::AccessDenied;
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::definition::{ConfigError, ExecutorBody, ExecutorDefinition};
use crate::metrics;
use crate::named_params::NamedParamError;
use crate::runner::{QueryRunner, RunnerError};

pub mod fs;
pub mod query;

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationError {
    AccessDenied(String),
    InvalidArg(String),
    NotFound(String),
    KindMismatch { name: String, expected: String, actual: String },
    Ambiguous { kind: ExecutorKind, names: Vec<String> },
    Expression(ExpressionError),
    Query(String),
    QueryTimeout(String),
    Config(ConfigError),
    Io(String),
}

impl InvocationError {
    pub fn code(&self) -> &'static str {
        match self {
            InvocationError::AccessDenied(_) => ERR_ACCESS_DENIED,
            InvocationError::InvalidArg(_) => ERR_INVALID_ARG,
            InvocationError::NotFound(_) => ERR_NOT_FOUND,
            InvocationError::KindMismatch { .. } => ERR_KIND_MISMATCH,
            InvocationError::Ambiguous { .. } => ERR_AMBIGUOUS,
            InvocationError::Expression(_) => ERR_EXPRESSION,
            InvocationError::Query(_) => ERR_QUERY,
            InvocationError::QueryTimeout(_) => ERR_QUERY_TIMEOUT,
            InvocationError::Config(_) => ERR_CONFIG,
            InvocationError::Io(_) => ERR_IO,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            InvocationError::QueryTimeout(_) | InvocationError::Io(_)
        )
    }
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationError::AccessDenied(message)
            | InvocationError::InvalidArg(message)
            | InvocationError::NotFound(message)
            | InvocationError::Query(message)
            | InvocationError::QueryTimeout(message)
            | InvocationError::Io(message) => f.write_str(message),
            InvocationError::KindMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "executor `{}` is of type `{}`, not `{}`",
                name, actual, expected
            ),
            InvocationError::Ambiguous { kind, names } => write!(
                f,
                "more than one {} executor is configured: {}",
                kind,
                names.join(", ")
            ),
            InvocationError::Expression(err) => write!(f, "{}", err),
            InvocationError::Config(err) => f.write_str(&err.message),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<AccessDenied> for InvocationError {
    fn from(err: AccessDenied) -> Self {
        InvocationError::AccessDenied(err.message().to_string())
    }
}

impl From<ExpressionError> for InvocationError {
    fn from(err: ExpressionError) -> Self {
        InvocationError::Expression(err)
    }
}

impl From<ConfigError> for InvocationError {
    fn from(err: ConfigError) -> Self {
        InvocationError::Config(err)
    }
}

impl From<NamedParamError> for InvocationError {
    fn from(err: NamedParamError) -> Self {
        InvocationError::Query(err.message)
    }
}

impl From<RunnerError> for InvocationError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Timeout(_) => InvocationError::QueryTimeout(err.to_string()),
            other => InvocationError::Query(other.to_string()),
        }
    }
}

/// Query-string parameters of a request, in arrival order. Every value is a
/// JSON string; when a key repeats, the first occurrence wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParams(Map<String, Value>);

impl RequestParams {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = Map::new();
        for (key, value) in pairs {
            let key = key.into();
            if !map.contains_key(&key) {
                map.insert(key, Value::String(value.into()));
            }
        }
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// What the adapter hands to an executor body. Query invocations also carry
/// the runner that executes the final statement.
#[derive(Clone, Copy)]
pub enum InvocationArgs<'a> {
    Query {
        runner: &'a dyn QueryRunner,
        request_params: &'a RequestParams,
    },
    RequestParams(&'a RequestParams),
}

impl<'a> InvocationArgs<'a> {
    pub fn request_params(&self) -> &'a RequestParams {
        match self {
            InvocationArgs::Query { request_params, .. } => request_params,
            InvocationArgs::RequestParams(request_params) => request_params,
        }
    }

    /// `{"requestParams": {...}}`, the root seen by path and post-process
    /// expressions.
    pub fn to_root(&self) -> Value {
        let mut root = Map::with_capacity(1);
        root.insert(
            "requestParams".to_string(),
            self.request_params().to_value(),
        );
        Value::Object(root)
    }
}

pub async fn invoke(
    definition: &ExecutorDefinition,
    principal: &Principal,
    args: InvocationArgs<'_>,
) -> Result<Value, InvocationError> {
    let kind = definition.kind();
    let span = tracing::info_span!(
        "executor.invoke",
        name = %definition.name,
        kind = %kind,
        principal_id = %principal.principal_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        if let Err(denied) = definition
            .access
            .check(&principal.roles, &principal.authorities)
        {
            tracing::warn!(
                executor = %definition.name,
                principal_id = %principal.principal_id,
                reason = %denied,
                "extapi.access_denied"
            );
            return Err(InvocationError::from(denied));
        }

        let data = execute(definition, args).await?;
        let data = post_process(definition, &args, data)?;

        Ok(if definition.embed_result_in_data_object {
            envelope(data)
        } else {
            data
        })
    }
    .instrument(span.clone())
    .await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) => err.code(),
    };
    span.record("latency_ms", started.elapsed().as_millis() as u64);
    span.record("outcome", outcome);
    metrics::observe_executor_invocation(kind.as_str(), outcome);

    result
}

async fn execute(
    definition: &ExecutorDefinition,
    args: InvocationArgs<'_>,
) -> Result<Value, InvocationError> {
    match (&definition.body, args) {
        (
            ExecutorBody::Query(query),
            InvocationArgs::Query {
                runner,
                request_params,
            },
        ) => query::execute(query, runner, request_params).await,
        (ExecutorBody::FsDir(dir), InvocationArgs::RequestParams(_)) => {
            fs::list_dir(dir, &args).await
        }
        (ExecutorBody::FsFile(file), InvocationArgs::RequestParams(_)) => {
            fs::read_file(file, &args).await
        }
        _ => Err(InvocationError::KindMismatch {
            name: definition.name.clone(),
            expected: match args {
                InvocationArgs::Query { .. } => "query".to_string(),
                InvocationArgs::RequestParams(_) => "fs.file or fs.dir".to_string(),
            },
            actual: definition.declared_type.clone(),
        }),
    }
}

fn post_process(
    definition: &ExecutorDefinition,
    args: &InvocationArgs<'_>,
    data: Value,
) -> Result<Value, InvocationError> {
    let Some(expression) = &definition.post_process_expression else {
        return Ok(data);
    };

    let mut root = Map::with_capacity(2);
    root.insert("args".to_string(), args.to_root());
    root.insert("data".to_string(), data);
    Ok(expression.evaluate_as(&Value::Object(root), TargetType::Object)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DocumentFormat, parse_document};
    use crate::named_params::NamedStatement;
    use crate::runner::RowMap;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<NamedStatement>>,
    }

    #[async_trait]
    impl QueryRunner for RecordingRunner {
        async fn fetch_rows(&self, statement: &NamedStatement) -> Result<Vec<RowMap>, RunnerError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(statement.clone());
            let mut row = Map::new();
            row.insert("n".to_string(), json!(1));
            Ok(vec![row])
        }
    }

    fn definition(yaml: &str) -> ExecutorDefinition {
        parse_document(yaml.as_bytes(), DocumentFormat::Yaml)
            .expect("document should parse")
            .definitions
            .remove(0)
    }

    fn principal(roles: &[&str], authorities: &[&str]) -> Principal {
        Principal {
            principal_id: "dev".to_string(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
            authorities: authorities.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn denied_principals_never_reach_the_runner() {
        let def = definition(
            r#"
executors:
  - name: q1
    type: query
    requiresAnyRole: [Administrator]
    query: "SELECT 1 AS n"
"#,
        );
        let runner = RecordingRunner::default();
        let params = RequestParams::default();
        let args = InvocationArgs::Query {
            runner: &runner,
            request_params: &params,
        };

        let err = invoke(&def, &principal(&["Developer"], &[]), args)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ERR_ACCESS_DENIED);
        assert_eq!(err.to_string(), "missing any of: Administrator");
        assert!(runner.calls.lock().unwrap().is_empty());

        let out = invoke(&def, &principal(&["Administrator"], &[]), args)
            .await
            .expect("admin should pass");
        assert_eq!(out, json!([{"n": 1}]));
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_permissions_are_listed() {
        let def = definition(
            r#"
executors:
  - name: q1
    type: query
    requiresAllPermissions: [view_issues, audit]
    query: "SELECT 1"
"#,
        );
        let runner = RecordingRunner::default();
        let params = RequestParams::default();
        let err = invoke(
            &def,
            &principal(&[], &["view_issues"]),
            InvocationArgs::Query {
                runner: &runner,
                request_params: &params,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, InvocationError::AccessDenied("missing: audit".to_string()));
    }

    #[tokio::test]
    async fn post_process_runs_before_envelope() {
        let def = definition(
            r#"
executors:
  - name: q1
    type: query
    embedResultInDataObject: true
    postProcessExpression: "args.requestParams.flat == 'true' ? data.![n] : data"
    query: "SELECT 1 AS n"
"#,
        );
        let runner = RecordingRunner::default();
        let params = RequestParams::from_pairs([("flat", "true")]);
        let out = invoke(
            &def,
            &principal(&[], &[]),
            InvocationArgs::Query {
                runner: &runner,
                request_params: &params,
            },
        )
        .await
        .expect("invocation should succeed");
        assert_eq!(out, json!({"data": [1]}));
    }

    #[tokio::test]
    async fn args_of_the_wrong_shape_are_a_kind_mismatch() {
        let def = definition(
            r#"
executors:
  - { name: q1, type: query, query: "SELECT 1" }
"#,
        );
        let params = RequestParams::default();
        let err = invoke(
            &def,
            &principal(&[], &[]),
            InvocationArgs::RequestParams(&params),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ERR_KIND_MISMATCH);
    }

    #[test]
    fn request_params_keep_first_occurrence_and_order() {
        let params = RequestParams::from_pairs([("b", "1"), ("a", "2"), ("b", "3")]);
        assert_eq!(params.get("b"), Some("1"));
        let keys = params.as_map().keys().map(String::as_str).collect::<Vec<_>>();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn runner_errors_map_to_query_codes() {
        let timeout = InvocationError::from(RunnerError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(timeout.code(), ERR_QUERY_TIMEOUT);
        assert!(timeout.retryable());

        let db = InvocationError::from(RunnerError::Database("syntax error".to_string()));
        assert_eq!(db.code(), ERR_QUERY);
        assert!(!db.retryable());
    }
}
