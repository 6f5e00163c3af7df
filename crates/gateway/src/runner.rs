use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{Decimal, Json, Uuid};
use sqlx::{Column, Either, Executor, PgPool, Postgres, Row, Statement, TypeInfo, ValueRef};

use crate::named_params::NamedStatement;

pub type RowMap = Map<String, Value>;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    Timeout(Duration),
    TooManyRows(usize),
    Parameter(String),
    Database(String),
    UnsupportedColumn { column: String, type_name: String },
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Timeout(limit) => {
                write!(f, "query did not complete within {} ms", limit.as_millis())
            }
            RunnerError::TooManyRows(max) => write!(f, "query returned more than {} rows", max),
            RunnerError::Parameter(message) | RunnerError::Database(message) => {
                write!(f, "{}", message)
            }
            RunnerError::UnsupportedColumn { column, type_name } => write!(
                f,
                "column `{}` has unsupported type {}; cast it in SQL (e.g. `{}::text`)",
                column, type_name, column
            ),
        }
    }
}

impl std::error::Error for RunnerError {}

/// Executes an already expanded statement and returns rows as ordered column
/// maps.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn fetch_rows(&self, statement: &NamedStatement) -> Result<Vec<RowMap>, RunnerError>;

    /// Whether the backing database currently answers.
    async fn ping(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct PgQueryRunner {
    pool: PgPool,
    timeout: Option<Duration>,
    max_rows: usize,
}

impl PgQueryRunner {
    /// `timeout == None` and `max_rows == 0` leave the statement unbounded.
    pub fn new(pool: PgPool, timeout: Option<Duration>, max_rows: usize) -> Self {
        Self {
            pool,
            timeout,
            max_rows,
        }
    }

    async fn run(&self, statement: &NamedStatement) -> Result<Vec<RowMap>, RunnerError> {
        let mut conn = self.pool.acquire().await.map_err(database_error)?;

        // Parameter types come from the server so request strings can be
        // bound to integer, date or uuid placeholders.
        let prepared = (&mut *conn)
            .prepare(statement.sql.as_str())
            .await
            .map_err(database_error)?;
        let param_types = match prepared.parameters() {
            Some(Either::Left(types)) => types
                .iter()
                .map(|t| t.name().to_string())
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };

        let mut query = prepared.query();
        for (idx, value) in statement.binds.iter().enumerate() {
            let type_name = param_types.get(idx).map(String::as_str).unwrap_or("TEXT");
            let name = statement.names.get(idx).map(String::as_str).unwrap_or("?");
            query = bind_param(query, name, type_name, value)?;
        }

        let mut stream = query.fetch(&mut *conn);
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await.map_err(database_error)? {
            if self.max_rows > 0 && rows.len() >= self.max_rows {
                return Err(RunnerError::TooManyRows(self.max_rows));
            }
            rows.push(decode_row(&row)?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl QueryRunner for PgQueryRunner {
    async fn fetch_rows(&self, statement: &NamedStatement) -> Result<Vec<RowMap>, RunnerError> {
        let Some(limit) = self.timeout else {
            return self.run(statement).await;
        };
        match tokio::time::timeout(limit, self.run(statement)).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout(limit)),
        }
    }

    async fn ping(&self) -> bool {
        tokio::time::timeout(
            self.timeout
                .map_or(PING_TIMEOUT, |limit| limit.min(PING_TIMEOUT)),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .is_ok_and(|res| res.is_ok())
    }
}

fn database_error(err: sqlx::Error) -> RunnerError {
    match err {
        sqlx::Error::Database(db) => RunnerError::Database(db.message().to_string()),
        other => RunnerError::Database(other.to_string()),
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

fn bind_param<'q>(
    query: PgQuery<'q>,
    name: &str,
    type_name: &str,
    value: &Value,
) -> Result<PgQuery<'q>, RunnerError> {
    let invalid = |expected: &str| {
        RunnerError::Parameter(format!(
            "SQL parameter `:{}` cannot be used as {} (got {})",
            name, expected, value
        ))
    };

    Ok(match type_name {
        "BOOL" => query.bind(coerce(value, |v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Some(true),
                "false" | "f" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        })
        .ok_or_else(|| invalid("boolean"))?),
        "INT2" => query.bind(
            coerce(value, |v| integer(v).and_then(|i| i16::try_from(i).ok()))
                .ok_or_else(|| invalid("smallint"))?,
        ),
        "INT4" => query.bind(
            coerce(value, |v| integer(v).and_then(|i| i32::try_from(i).ok()))
                .ok_or_else(|| invalid("integer"))?,
        ),
        "INT8" => query.bind(coerce(value, integer).ok_or_else(|| invalid("bigint"))?),
        "FLOAT4" => query.bind(
            coerce(value, |v| float(v).map(|f| f as f32)).ok_or_else(|| invalid("real"))?,
        ),
        "FLOAT8" => query.bind(coerce(value, float).ok_or_else(|| invalid("double precision"))?),
        "NUMERIC" => query.bind(
            coerce(value, |v| Decimal::from_str(scalar_text(v)?.trim()).ok())
                .ok_or_else(|| invalid("numeric"))?,
        ),
        "UUID" => query.bind(
            coerce(value, |v| Uuid::parse_str(v.as_str()?.trim()).ok())
                .ok_or_else(|| invalid("uuid"))?,
        ),
        "DATE" => query.bind(
            coerce(value, |v| NaiveDate::parse_from_str(v.as_str()?.trim(), "%Y-%m-%d").ok())
                .ok_or_else(|| invalid("date"))?,
        ),
        "TIMESTAMP" => query.bind(
            coerce(value, |v| parse_naive_timestamp(v.as_str()?)).ok_or_else(|| invalid("timestamp"))?,
        ),
        "TIMESTAMPTZ" => query.bind(
            coerce(value, |v| {
                DateTime::parse_from_rfc3339(v.as_str()?.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            })
            .ok_or_else(|| invalid("timestamptz"))?,
        ),
        "JSON" | "JSONB" => query.bind(match value {
            Value::Null => None,
            other => Some(Json(other.clone())),
        }),
        _ => query.bind(match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }),
    })
}

// `Ok(None)` binds SQL NULL; `None` means the value could not be converted.
fn coerce<T>(value: &Value, convert: impl Fn(&Value) -> Option<T>) -> Option<Option<T>> {
    if value.is_null() {
        return Some(None);
    }
    convert(value).map(Some)
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_naive_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn decode_row(row: &PgRow) -> Result<RowMap, RunnerError> {
    let mut out = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let idx = column.ordinal();
        let name = column.name();
        let type_name = column.type_info().name();

        let is_null = row
            .try_get_raw(idx)
            .map(|raw| raw.is_null())
            .map_err(database_error)?;
        if is_null {
            out.insert(name.to_string(), Value::Null);
            continue;
        }

        let value = decode_column(row, idx, type_name).map_err(database_error)?;
        let Some(value) = value else {
            return Err(RunnerError::UnsupportedColumn {
                column: name.to_string(),
                type_name: type_name.to_string(),
            });
        };
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<Option<Value>, sqlx::Error> {
    Ok(Some(match type_name {
        "BOOL" => Value::Bool(row.try_get::<bool, _>(idx)?),
        "INT2" => Value::from(row.try_get::<i16, _>(idx)?),
        "INT4" => Value::from(row.try_get::<i32, _>(idx)?),
        "INT8" => Value::from(row.try_get::<i64, _>(idx)?),
        "FLOAT4" => float_value(f64::from(row.try_get::<f32, _>(idx)?)),
        "FLOAT8" => float_value(row.try_get::<f64, _>(idx)?),
        "NUMERIC" => Value::String(row.try_get::<Decimal, _>(idx)?.to_string()),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => {
            Value::String(row.try_get::<String, _>(idx)?)
        }
        "JSON" | "JSONB" => row.try_get::<Json<Value>, _>(idx)?.0,
        "UUID" => Value::String(row.try_get::<Uuid, _>(idx)?.to_string()),
        "DATE" => Value::String(row.try_get::<NaiveDate, _>(idx)?.to_string()),
        "TIME" => Value::String(row.try_get::<NaiveTime, _>(idx)?.to_string()),
        "TIMESTAMP" => Value::String(
            row.try_get::<NaiveDateTime, _>(idx)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "TIMESTAMPTZ" => Value::String(row.try_get::<DateTime<Utc>, _>(idx)?.to_rfc3339()),
        "BYTEA" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(idx)?)),
        "TEXT[]" | "VARCHAR[]" => Value::from(row.try_get::<Vec<Option<String>>, _>(idx)?),
        "INT4[]" => Value::from(row.try_get::<Vec<Option<i32>>, _>(idx)?),
        "INT8[]" => Value::from(row.try_get::<Vec<Option<i64>>, _>(idx)?),
        "VOID" => Value::Null,
        _ => return Ok(None),
    }))
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
