use extapi_expr::TargetType;
use serde_json::{Map, Value};

use super::{InvocationError, RequestParams};
use crate::definition::QueryDefinition;
use crate::named_params;
use crate::runner::{QueryRunner, RowMap};

pub async fn execute(
    definition: &QueryDefinition,
    runner: &dyn QueryRunner,
    request_params: &RequestParams,
) -> Result<Value, InvocationError> {
    let params = resolve_params(definition, request_params)?;

    let sql = definition
        .query_expression
        .evaluate_string(&Value::Object(params.clone()))?
        .filter(|sql| !sql.trim().is_empty())
        .ok_or_else(|| InvocationError::Query("query expression produced no SQL".to_string()))?;

    let statement = named_params::expand(&sql, &params)?;
    tracing::debug!(
        binds = statement.binds.len(),
        "extapi.query.expanded"
    );

    let rows = runner.fetch_rows(&statement).await?;
    let rows = map_rows(definition, &params, rows)?;
    Ok(Value::Array(rows))
}

/// Request params overlaid with the configured parameter expressions, which
/// are evaluated against the original request params in definition order.
fn resolve_params(
    definition: &QueryDefinition,
    request_params: &RequestParams,
) -> Result<Map<String, Value>, InvocationError> {
    let request_root = request_params.to_value();
    let mut params = request_params.as_map().clone();
    for (key, expression) in &definition.query_param_expressions {
        let value = expression.evaluate_as(&request_root, TargetType::Object)?;
        params.insert(key.clone(), value);
    }
    Ok(params)
}

fn map_rows(
    definition: &QueryDefinition,
    params: &Map<String, Value>,
    rows: Vec<RowMap>,
) -> Result<Vec<Value>, InvocationError> {
    if definition.output_expressions.is_empty() {
        return Ok(rows.into_iter().map(Value::Object).collect());
    }

    let params = Value::Object(params.clone());
    let mut out = Vec::with_capacity(rows.len());
    for columns in rows {
        let mut root = Map::with_capacity(2);
        root.insert("params".to_string(), params.clone());
        root.insert("columns".to_string(), Value::Object(columns));
        let root = Value::Object(root);

        let mut mapped = Map::with_capacity(definition.output_expressions.len());
        for (key, expression) in &definition.output_expressions {
            mapped.insert(
                key.clone(),
                expression.evaluate_as(&root, TargetType::Object)?,
            );
        }
        out.push(Value::Object(mapped));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DocumentFormat, ExecutorBody, parse_document};
    use crate::named_params::NamedStatement;
    use crate::runner::RunnerError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeRunner {
        rows: Vec<RowMap>,
        seen: Mutex<Option<NamedStatement>>,
    }

    impl FakeRunner {
        fn returning(rows: Value) -> Self {
            let rows = rows
                .as_array()
                .expect("rows must be an array")
                .iter()
                .map(|r| r.as_object().cloned().expect("row must be an object"))
                .collect();
            Self {
                rows,
                seen: Mutex::new(None),
            }
        }

        fn statement(&self) -> NamedStatement {
            self.seen
                .lock()
                .unwrap()
                .clone()
                .expect("runner should have been called")
        }
    }

    #[async_trait]
    impl QueryRunner for FakeRunner {
        async fn fetch_rows(&self, statement: &NamedStatement) -> Result<Vec<RowMap>, RunnerError> {
            *self.seen.lock().unwrap() = Some(statement.clone());
            Ok(self.rows.clone())
        }
    }

    fn query_definition(yaml: &str) -> QueryDefinition {
        let mut doc = parse_document(yaml.as_bytes(), DocumentFormat::Yaml)
            .expect("document should parse");
        match doc.definitions.remove(0).body {
            ExecutorBody::Query(query) => query,
            other => panic!("expected a query executor, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn param_expressions_override_request_params() {
        let def = query_definition(
            r#"
executors:
  - name: q1
    type: query
    queryParams: { id: "${id}0", extra: "fixed" }
    query: "SELECT name FROM t WHERE id = :id AND tag = :extra AND other = :id"
"#,
        );
        let runner = FakeRunner::returning(json!([{"name": "x"}]));
        let params = RequestParams::from_pairs([("id", "7"), ("unused", "u")]);

        let out = execute(&def, &runner, &params).await.expect("query should run");
        assert_eq!(out, json!([{"name": "x"}]));

        let stmt = runner.statement();
        assert_eq!(
            stmt.sql,
            "SELECT name FROM t WHERE id = $1 AND tag = $2 AND other = $3"
        );
        assert_eq!(stmt.binds, vec![json!("70"), json!("fixed"), json!("70")]);
    }

    #[tokio::test]
    async fn template_values_can_shape_the_sql_text() {
        let def = query_definition(
            r#"
executors:
  - name: q1
    type: query
    queryParams: { ids: "${ids.split(',')}" }
    query: "SELECT * FROM ${table} WHERE id IN (:ids)"
"#,
        );
        let runner = FakeRunner::returning(json!([]));
        let params = RequestParams::from_pairs([("table", "issues"), ("ids", "1,2")]);

        let out = execute(&def, &runner, &params).await.expect("query should run");
        assert_eq!(out, json!([]));
        let stmt = runner.statement();
        assert_eq!(stmt.sql, "SELECT * FROM issues WHERE id IN ($1, $2)");
        assert_eq!(stmt.binds, vec![json!("1"), json!("2")]);
    }

    #[tokio::test]
    async fn output_expressions_see_params_and_columns() {
        let def = query_definition(
            r#"
executors:
  - name: q1
    type: query
    query: "SELECT id, name FROM t WHERE id > :min"
    output:
      label: "${columns.name} (${params.min})"
      id: "${columns.id}"
"#,
        );
        let runner = FakeRunner::returning(json!([
            {"id": 3, "name": "a"},
            {"id": 4, "name": null}
        ]));
        let params = RequestParams::from_pairs([("min", "2")]);

        let out = execute(&def, &runner, &params).await.expect("query should run");
        assert_eq!(
            out,
            json!([
                {"label": "a (2)", "id": 3},
                {"label": " (2)", "id": 4}
            ])
        );
        let keys = out[0]
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["label", "id"]);
    }

    #[tokio::test]
    async fn missing_sql_parameter_is_a_query_error() {
        let def = query_definition(
            r#"
executors:
  - { name: q1, type: query, query: "SELECT * FROM t WHERE id = :id" }
"#,
        );
        let runner = FakeRunner::returning(json!([]));
        let err = execute(&def, &runner, &RequestParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), extapi_contracts::ERR_QUERY);
        assert!(err.to_string().contains(":id"));
        assert!(runner.seen.lock().unwrap().is_none());
    }
}
