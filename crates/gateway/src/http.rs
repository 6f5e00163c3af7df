use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use extapi_auth::{OidcAuthenticator, Principal};
use extapi_contracts::{
    ERR_INTERNAL, ERR_INVALID_ARG, ErrorResponse, ExecutorKind, ReloadResponse,
};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;

use crate::config::{AuthMode, GatewayConfig, StartupError};
use crate::executor::{self, InvocationArgs, InvocationError, RequestParams};
use crate::registry::Registry;
use crate::runner::{PgQueryRunner, QueryRunner};

const RELOAD_ROUTE: &str = "/api/v1/custom/reloadConfig";
const QUERY_ROUTE: &str = "/api/v1/custom/query/{name}";
const FS_FILE_ROUTE: &str = "/api/v1/custom/fs/file/{name}";
const FS_DIR_ROUTE: &str = "/api/v1/custom/fs/dir/{name}";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    registry: Arc<Registry>,
    runner: Arc<dyn QueryRunner>,
    oidc: Option<OidcAuthenticator>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<Registry>,
        runner: Arc<dyn QueryRunner>,
        oidc: Option<OidcAuthenticator>,
    ) -> Self {
        Self {
            config,
            registry,
            runner,
            oidc,
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type PairsQuery = Result<Query<Vec<(String, String)>>, QueryRejection>;

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let oidc = if config.auth_mode == AuthMode::Oidc {
        let oidc_config = config.oidc.clone().ok_or_else(|| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc auth mode requires oidc config".to_string(),
        })?;

        Some(
            OidcAuthenticator::new(oidc_config)
                .await
                .map_err(|err| StartupError {
                    code: err.code,
                    message: err.message,
                })?,
        )
    } else {
        None
    };

    let pg_pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.db_url)
        .await
        .map_err(|_| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: "failed to initialize database pool".to_string(),
        })?;
    let runner = PgQueryRunner::new(pg_pool, config.query_timeout(), config.query_max_rows);

    let registry = Arc::new(Registry::from_path(config.executors_path.clone()));
    // A broken document must not keep the service down; reloadConfig can
    // publish a fixed one later.
    if let Err(err) = registry.current_snapshot().await {
        tracing::warn!(
            path = %config.executors_path.display(),
            error = %err,
            "extapi.initial_config_load_failed"
        );
    }

    Ok(router_with_state(AppState::new(
        config,
        registry,
        Arc::new(runner),
        oidc,
    )))
}

pub fn router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(RELOAD_ROUTE, get(reload_config))
        .route(QUERY_ROUTE, get(query_executor))
        .route(FS_FILE_ROUTE, get(fs_file_executor))
        .route(FS_DIR_ROUTE, get(fs_dir_executor))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("postgres", state.runner.ping().await);
    checks.insert("registry", state.registry.current_snapshot().await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) = extract_principal(&state, &headers).await
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn reload_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();
    let result = async {
        let principal = extract_principal(&state, &headers).await?;
        tracing::info!(principal_id = %principal.principal_id, "extapi.reload_requested");

        state
            .registry
            .reload()
            .await
            .map_err(|err| invocation_error(&InvocationError::Config(err)))?;
        Ok::<_, ApiError>(Json(ReloadResponse::ok()).into_response())
    }
    .await;

    finish(RELOAD_ROUTE, started, result)
}

async fn query_executor(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    query: PairsQuery,
) -> Response {
    let started = Instant::now();
    let result = async {
        let principal = extract_principal(&state, &headers).await?;
        let request_params = request_params(query)?;
        let definition = state
            .registry
            .lookup_by_name(&name, ExecutorKind::Query)
            .await
            .map_err(|err| invocation_error(&err))?;

        let args = InvocationArgs::Query {
            runner: state.runner.as_ref(),
            request_params: &request_params,
        };
        let value = executor::invoke(&definition, &principal, args)
            .await
            .map_err(|err| invocation_error(&err))?;
        Ok::<_, ApiError>(Json(value).into_response())
    }
    .await;

    finish(QUERY_ROUTE, started, result)
}

async fn fs_file_executor(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    query: PairsQuery,
) -> Response {
    let started = Instant::now();
    let result = invoke_fs(&state, &name, ExecutorKind::FsFile, &headers, query).await;
    finish(FS_FILE_ROUTE, started, result)
}

async fn fs_dir_executor(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    query: PairsQuery,
) -> Response {
    let started = Instant::now();
    let result = invoke_fs(&state, &name, ExecutorKind::FsDir, &headers, query).await;
    finish(FS_DIR_ROUTE, started, result)
}

async fn invoke_fs(
    state: &AppState,
    name: &str,
    kind: ExecutorKind,
    headers: &HeaderMap,
    query: PairsQuery,
) -> Result<Response, ApiError> {
    let principal = extract_principal(state, headers).await?;
    let request_params = request_params(query)?;
    let definition = state
        .registry
        .lookup_by_name(name, kind)
        .await
        .map_err(|err| invocation_error(&err))?;

    let value = executor::invoke(
        &definition,
        &principal,
        InvocationArgs::RequestParams(&request_params),
    )
    .await
    .map_err(|err| invocation_error(&err))?;

    Ok(match value {
        Value::String(text) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        other => Json(other).into_response(),
    })
}

fn request_params(query: PairsQuery) -> Result<RequestParams, ApiError> {
    let Query(pairs) = query.map_err(|rejection| {
        json_error(
            StatusCode::BAD_REQUEST,
            ERR_INVALID_ARG,
            format!("invalid query string: {}", rejection.body_text()),
            false,
        )
    })?;
    Ok(RequestParams::from_pairs(pairs))
}

fn finish(route: &'static str, started: Instant, result: Result<Response, ApiError>) -> Response {
    let response = match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    crate::metrics::observe_http_request(route, "GET", response.status().as_u16(), started.elapsed());
    response
}

fn invocation_error(err: &InvocationError) -> ApiError {
    let status = match err {
        InvocationError::AccessDenied(_) => StatusCode::FORBIDDEN,
        InvocationError::InvalidArg(_) => StatusCode::BAD_REQUEST,
        InvocationError::NotFound(_) | InvocationError::KindMismatch { .. } => {
            StatusCode::NOT_FOUND
        }
        InvocationError::QueryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        InvocationError::Ambiguous { .. }
        | InvocationError::Expression(_)
        | InvocationError::Query(_)
        | InvocationError::Config(_)
        | InvocationError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::warn!(code = err.code(), error = %err, "extapi.invocation_failed");
    }
    json_error(status, err.code(), err.to_string(), err.retryable())
}

async fn extract_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    match state.config.auth_mode {
        AuthMode::Local => {
            extapi_auth::local_principal(headers, state.config.local_auth_shared_secret.as_deref())
                .map_err(|err| json_error(StatusCode::UNAUTHORIZED, err.code, err.message, false))
        }
        AuthMode::Oidc => {
            let Some(auth) = state.oidc.as_ref() else {
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ERR_INTERNAL,
                    "oidc authenticator is not initialized",
                    false,
                ));
            };

            auth.authenticate(headers)
                .await
                .map_err(|err| match err.code {
                    "ERR_AUTH_UNAVAILABLE" => json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        err.code,
                        err.message,
                        true,
                    ),
                    _ => json_error(StatusCode::UNAUTHORIZED, err.code, err.message, false),
                })
        }
    }
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ConfigError, DocumentFormat, ParsedDocument, parse_document};
    use crate::named_params::NamedStatement;
    use crate::registry::DefinitionSource;
    use crate::runner::{RowMap, RunnerError};
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use extapi_auth::{AUTHORITIES_HEADER, PRINCIPAL_ID_HEADER, ROLES_HEADER};
    use serde_json::json;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct PlantedSource {
        document: Arc<Mutex<String>>,
    }

    #[async_trait]
    impl DefinitionSource for PlantedSource {
        async fn load(&self) -> Result<ParsedDocument, ConfigError> {
            let yaml = self.document.lock().unwrap().clone();
            parse_document(yaml.as_bytes(), DocumentFormat::Yaml)
        }

        fn describe(&self) -> String {
            "planted".to_string()
        }
    }

    /// Echoes the bound values back as a single row.
    struct EchoRunner;

    #[async_trait]
    impl QueryRunner for EchoRunner {
        async fn fetch_rows(&self, statement: &NamedStatement) -> Result<Vec<RowMap>, RunnerError> {
            if statement.sql.contains("pg_sleep") {
                return Err(RunnerError::Timeout(std::time::Duration::from_millis(10)));
            }
            let mut row = serde_json::Map::new();
            row.insert("sql".to_string(), json!(statement.sql));
            row.insert("binds".to_string(), Value::Array(statement.binds.clone()));
            Ok(vec![row])
        }
    }

    fn test_config() -> GatewayConfig {
        let kv = [
            ("EXTAPI_DB_URL", "postgres://unused"),
            ("EXTAPI_EXECUTORS_PATH", "custom-api.yaml"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        GatewayConfig::from_kv(&kv).expect("test config should parse")
    }

    fn app(source: &PlantedSource) -> Router {
        router_with_state(AppState::new(
            test_config(),
            Arc::new(Registry::new(source.clone())),
            Arc::new(EchoRunner),
            None,
        ))
    }

    fn plant(source: &PlantedSource, yaml: &str) {
        *source.document.lock().unwrap() = yaml.to_string();
    }

    fn get(uri: &str, roles: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(PRINCIPAL_ID_HEADER, "dev")
            .header(ROLES_HEADER, roles)
            .header(AUTHORITIES_HEADER, "view_issues")
            .body(Body::empty())
            .expect("request should build")
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        (status, content_type, body.to_vec())
    }

    async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = send(app, request).await;
        let value = serde_json::from_slice(&body).expect("body should be JSON");
        (status, value)
    }

    #[tokio::test]
    async fn reload_publishes_and_removes_executors() {
        let source = PlantedSource::default();
        let app = app(&source);

        let (status, body) = send_json(&app, get("/api/v1/custom/query/q1", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "ERR_NOT_FOUND");

        plant(
            &source,
            r#"
executors:
  - { name: q1, type: query, query: "SELECT name FROM t WHERE id = :id" }
"#,
        );
        let (status, body) = send_json(&app, get("/api/v1/custom/reloadConfig", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"result": "OK"}));

        let (status, body) = send_json(&app, get("/api/v1/custom/query/q1?id=7", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([{"sql": "SELECT name FROM t WHERE id = $1", "binds": ["7"]}])
        );

        plant(&source, "executors: []\n");
        send_json(&app, get("/api/v1/custom/reloadConfig", "")).await;
        let (status, _) = send_json(&app, get("/api/v1/custom/query/q1?id=7", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_reload_is_a_500_and_keeps_serving() {
        let source = PlantedSource::default();
        plant(
            &source,
            "executors:\n  - { name: q1, type: query, query: \"SELECT 1\" }\n",
        );
        let app = app(&source);
        assert_eq!(
            send_json(&app, get("/api/v1/custom/query/q1", "")).await.0,
            StatusCode::OK
        );

        plant(&source, "executors: [ { name: q1 ");
        let (status, body) = send_json(&app, get("/api/v1/custom/reloadConfig", "")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "ERR_CONFIG");

        assert_eq!(
            send_json(&app, get("/api/v1/custom/query/q1", "")).await.0,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn access_and_auth_failures_have_distinct_statuses() {
        let source = PlantedSource::default();
        plant(
            &source,
            r#"
executors:
  - name: admin.only
    type: query
    requiresAnyRole: [Administrator]
    embedResultInDataObject: true
    query: "SELECT 1"
"#,
        );
        let app = app(&source);

        let (status, body) = send_json(&app, get("/api/v1/custom/query/admin.only", "Developer")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "ERR_ACCESS_DENIED");
        assert_eq!(body["message"], "missing any of: Administrator");

        let (status, body) =
            send_json(&app, get("/api/v1/custom/query/admin.only", "Administrator")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["sql"], "SELECT 1");

        let anonymous = Request::builder()
            .uri("/api/v1/custom/query/admin.only")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send_json(&app, anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "ERR_AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn lookups_respect_kind_and_timeouts_map_to_504() {
        let source = PlantedSource::default();
        plant(
            &source,
            r#"
executors:
  - { name: slow, type: query, query: "SELECT pg_sleep(5)" }
  - { name: logs, type: fs.dir, parentPathExpression: /var/log }
"#,
        );
        let app = app(&source);

        let (status, body) = send_json(&app, get("/api/v1/custom/query/logs", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "ERR_KIND_MISMATCH");

        let (status, body) = send_json(&app, get("/api/v1/custom/query/slow", "")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["code"], "ERR_QUERY_TIMEOUT");
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn fs_routes_serve_text_or_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("app.log"), "one\ntwo").unwrap();
        std::fs::write(dir.path().join("other.log"), "x").unwrap();

        let source = PlantedSource::default();
        plant(
            &source,
            &format!(
                r#"
executors:
  - name: logs
    type: fs.dir
    parentPathExpression: "{root}"
  - name: log.file
    type: fs.file
    parentPathExpression: "{root}"
    fileNameExpression: "${{requestParams.file}}"
"#,
                root = dir.path().display()
            ),
        );
        let app = app(&source);

        let (status, content_type, body) =
            send(&app, get("/api/v1/custom/fs/file/log.file?file=app.log", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
        assert_eq!(body, b"one\ntwo");

        let (status, body) = send_json(
            &app,
            get(
                "/api/v1/custom/fs/file/log.file?file=app.log&plainText=false&splitLines=true",
                "",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"data": {"contents": ["one", "two"]}}));

        let (status, body) = send_json(
            &app,
            get("/api/v1/custom/fs/file/log.file?file=../etc/passwd", ""),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "outside parent");

        let (status, body) = send_json(&app, get("/api/v1/custom/fs/dir/logs", "")).await;
        assert_eq!(status, StatusCode::OK);
        let mut names = body["data"]["directoryContents"]
            .as_array()
            .expect("structured listing")
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["app.log", "other.log"]);

        let (status, content_type, body) =
            send(&app, get("/api/v1/custom/fs/dir/logs?plainText=true", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
        let text = String::from_utf8(body).unwrap();
        let mut lines = text.split('\n').map(str::to_string).collect::<Vec<_>>();
        lines.sort();
        assert_eq!(lines, vec!["app.log", "other.log"]);
    }

    #[tokio::test]
    async fn health_and_metrics_endpoints_respond() {
        let source = PlantedSource::default();
        let app = app(&source);

        let (status, _, body) = send(&app, get("/healthz", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");

        let (status, body) = send_json(&app, get("/readyz", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["registry"], true);

        send(&app, get("/api/v1/custom/query/none", "")).await;
        let (status, _, body) = send(&app, get("/metrics", "")).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("extapi_http_requests_total"));
    }
}
