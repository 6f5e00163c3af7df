//! Directory listing and file reading under a configured parent directory.
//!
//! Paths are confined lexically before the filesystem is touched. File reads
//! then resolve each symlink on the way down and confine it before looking
//! at anything behind it.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use extapi_expr::TemplateExpression;
use serde_json::Value;

use super::{InvocationArgs, InvocationError};
use crate::definition::{DirDefinition, FileDefinition};

pub(crate) const DEFAULT_DIR_POST_PROCESS: &str = "args.requestParams.plainText == 'true' ? T(String).join('\\n', data) : {'data': {'directoryContents': data}}";
pub(crate) const DEFAULT_FILE_POST_PROCESS: &str = "args.requestParams.plainText != 'false' ? data : {'data': {'contents': args.requestParams.splitLines == 'true' ? data.split('\\n') : data}}";

const OUTSIDE_PARENT: &str = "outside parent";

pub async fn list_dir(
    definition: &DirDefinition,
    args: &InvocationArgs<'_>,
) -> Result<Value, InvocationError> {
    let parent = resolve_parent(&definition.parent_path_expression, args).await?;

    let mut entries = tokio::fs::read_dir(&parent)
        .await
        .map_err(|err| io_error(&parent, err))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| io_error(&parent, err))?
    {
        names.push(Value::String(entry.file_name().to_string_lossy().into_owned()));
    }
    Ok(Value::Array(names))
}

pub async fn read_file(
    definition: &FileDefinition,
    args: &InvocationArgs<'_>,
) -> Result<Value, InvocationError> {
    let parent = resolve_parent(&definition.parent_path_expression, args).await?;

    let file_name = definition
        .file_name_expression
        .evaluate_string(&args.to_root())?
        .filter(|name| !name.is_empty())
        .ok_or_else(|| InvocationError::InvalidArg("file name required".to_string()))?;

    let candidate = normalize(&parent.join(&file_name));
    if candidate == parent || !candidate.starts_with(&parent) {
        return Err(InvocationError::AccessDenied(OUTSIDE_PARENT.to_string()));
    }

    let real_parent = tokio::fs::canonicalize(&parent)
        .await
        .map_err(|err| io_error(&parent, err))?;
    let relative = candidate
        .strip_prefix(&parent)
        .map_err(|_| InvocationError::AccessDenied(OUTSIDE_PARENT.to_string()))?;
    let real_candidate = resolve_within(&real_parent, relative, &file_name).await?;

    let metadata = tokio::fs::metadata(&real_candidate)
        .await
        .map_err(|err| io_error(Path::new(&file_name), err))?;
    if !metadata.is_file() {
        return Err(InvocationError::InvalidArg(format!(
            "`{}` is not a regular file",
            file_name
        )));
    }

    let bytes = tokio::fs::read(&real_candidate)
        .await
        .map_err(|err| io_error(Path::new(&file_name), err))?;
    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Walks `relative` below `real_parent` one component at a time, resolving
/// every symlink before anything behind it is looked up. A link that leaves
/// the parent, or that cannot be resolved, is denied, so a missing file is
/// only reported for paths that stay inside.
async fn resolve_within(
    real_parent: &Path,
    relative: &Path,
    file_name: &str,
) -> Result<PathBuf, InvocationError> {
    let mut current = real_parent.to_path_buf();
    for component in relative.components() {
        let next = current.join(component);
        let metadata = tokio::fs::symlink_metadata(&next)
            .await
            .map_err(|err| io_error(Path::new(file_name), err))?;
        if !metadata.file_type().is_symlink() {
            current = next;
            continue;
        }

        let resolved = match tokio::fs::canonicalize(&next).await {
            Ok(resolved) if resolved.starts_with(real_parent) => resolved,
            Ok(resolved) => {
                tracing::warn!(
                    path = %next.display(),
                    target = %resolved.display(),
                    "extapi.fs.link_outside_parent"
                );
                return Err(InvocationError::AccessDenied(OUTSIDE_PARENT.to_string()));
            }
            Err(_) => return Err(InvocationError::AccessDenied(OUTSIDE_PARENT.to_string())),
        };
        current = resolved;
    }
    Ok(current)
}

/// Evaluates the parent path and makes it absolute and lexically normal. The
/// path itself may be a symlink; it is not resolved here.
async fn resolve_parent(
    expression: &TemplateExpression,
    args: &InvocationArgs<'_>,
) -> Result<PathBuf, InvocationError> {
    let raw = expression
        .evaluate_string(&args.to_root())?
        .filter(|path| !path.trim().is_empty())
        .ok_or_else(|| InvocationError::InvalidArg("parent path required".to_string()))?;

    let absolute = std::path::absolute(Path::new(&raw))
        .map_err(|err| InvocationError::Io(format!("cannot resolve `{}`: {}", raw, err)))?;
    let parent = normalize(&absolute);

    tokio::fs::symlink_metadata(&parent)
        .await
        .map_err(|err| io_error(&parent, err))?;
    Ok(parent)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    out.components().next_back(),
                    Some(Component::RootDir | Component::Prefix(_)) | None
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn io_error(path: &Path, err: std::io::Error) -> InvocationError {
    match err.kind() {
        ErrorKind::NotFound => InvocationError::NotFound(format!("`{}` not found", path.display())),
        ErrorKind::PermissionDenied => {
            InvocationError::Io(format!("permission denied reading `{}`", path.display()))
        }
        _ => InvocationError::Io(format!("cannot read `{}`: {}", path.display(), err)),
    }
}
