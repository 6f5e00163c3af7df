use serde::{Deserialize, Serialize};

pub mod canonical;

pub const ERR_INVALID_ARG: &str = "ERR_INVALID_ARG";
pub const ERR_AUTH_REQUIRED: &str = "ERR_AUTH_REQUIRED";
pub const ERR_AUTH_INVALID: &str = "ERR_AUTH_INVALID";
pub const ERR_ACCESS_DENIED: &str = "ERR_ACCESS_DENIED";
pub const ERR_NOT_FOUND: &str = "ERR_NOT_FOUND";
pub const ERR_KIND_MISMATCH: &str = "ERR_KIND_MISMATCH";
pub const ERR_AMBIGUOUS: &str = "ERR_AMBIGUOUS";
pub const ERR_EXPRESSION: &str = "ERR_EXPRESSION";
pub const ERR_QUERY: &str = "ERR_QUERY";
pub const ERR_QUERY_TIMEOUT: &str = "ERR_QUERY_TIMEOUT";
pub const ERR_CONFIG: &str = "ERR_CONFIG";
pub const ERR_IO: &str = "ERR_IO";
pub const ERR_INTERNAL: &str = "ERR_INTERNAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorKind {
    Query,
    FsFile,
    FsDir,
    Other,
}

impl ExecutorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorKind::Query => "QUERY",
            ExecutorKind::FsFile => "FS_FILE",
            ExecutorKind::FsDir => "FS_DIR",
            ExecutorKind::Other => "OTHER",
        }
    }

    /// Maps the `type` of a configuration entry to a kind. Unrecognized types
    /// become [`ExecutorKind::Other`].
    pub fn from_config_type(raw: &str) -> Self {
        match raw.trim() {
            "query" => ExecutorKind::Query,
            "fs.file" => ExecutorKind::FsFile,
            "fs.dir" => ExecutorKind::FsDir,
            _ => ExecutorKind::Other,
        }
    }

    pub fn config_type(self) -> Option<&'static str> {
        match self {
            ExecutorKind::Query => Some("query"),
            ExecutorKind::FsFile => Some("fs.file"),
            ExecutorKind::FsDir => Some("fs.dir"),
            ExecutorKind::Other => None,
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub result: String,
}

impl ReloadResponse {
    pub fn ok() -> Self {
        Self {
            result: "OK".to_string(),
        }
    }
}

/// Wraps an executor result as `{"data": value}`.
pub fn envelope(value: serde_json::Value) -> serde_json::Value {
    let mut out = serde_json::Map::with_capacity(1);
    out.insert("data".to_string(), value);
    serde_json::Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_types_map_to_kinds() {
        assert_eq!(ExecutorKind::from_config_type("query"), ExecutorKind::Query);
        assert_eq!(ExecutorKind::from_config_type("fs.file"), ExecutorKind::FsFile);
        assert_eq!(ExecutorKind::from_config_type("fs.dir"), ExecutorKind::FsDir);
        assert_eq!(ExecutorKind::from_config_type("webhook"), ExecutorKind::Other);

        for kind in [ExecutorKind::Query, ExecutorKind::FsFile, ExecutorKind::FsDir] {
            let raw = kind.config_type().expect("built-in kinds have a config type");
            assert_eq!(ExecutorKind::from_config_type(raw), kind);
        }
        assert_eq!(ExecutorKind::Other.config_type(), None);
    }

    #[test]
    fn kind_serializes_as_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExecutorKind::FsFile).unwrap(),
            "\"FS_FILE\""
        );
        assert_eq!(ExecutorKind::FsDir.to_string(), "FS_DIR");
    }

    #[test]
    fn envelope_is_single_key_map() {
        let wrapped = envelope(serde_json::json!([{"name": "alice"}]));
        assert_eq!(wrapped, serde_json::json!({"data": [{"name": "alice"}]}));
        assert_eq!(wrapped.as_object().map(|m| m.len()), Some(1));
    }

    #[test]
    fn reload_response_shape() {
        assert_eq!(
            serde_json::to_value(ReloadResponse::ok()).unwrap(),
            serde_json::json!({"result": "OK"})
        );
    }
}
