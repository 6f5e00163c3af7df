//! The process-wide executor registry.
//!
//! The active [`RegistrySnapshot`] is replaced as a whole on reload. Readers
//! take an `Arc` to the snapshot with a single atomic load, never a lock, and
//! keep using it for the rest of their request, so they always see either the
//! old or the new definitions in full.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extapi_contracts::ExecutorKind;

use crate::definition::{ConfigError, DocumentFormat, ExecutorDefinition, ParsedDocument, parse_document};
use crate::executor::InvocationError;
use crate::metrics;

/// Where the configuration document comes from.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn load(&self) -> Result<ParsedDocument, ConfigError>;

    fn describe(&self) -> String;
}

pub struct FileDefinitionSource {
    path: PathBuf,
}

impl FileDefinitionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DefinitionSource for FileDefinitionSource {
    async fn load(&self) -> Result<ParsedDocument, ConfigError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|err| {
            ConfigError::new(format!(
                "failed to read executor configuration {}: {}",
                self.path.display(),
                err
            ))
        })?;
        parse_document(&bytes, DocumentFormat::from_path(&self.path))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug)]
pub struct RegistrySnapshot {
    by_name: HashMap<String, Arc<ExecutorDefinition>>,
    by_kind: HashMap<ExecutorKind, Vec<Arc<ExecutorDefinition>>>,
    pub config_hash: String,
    pub loaded_at: DateTime<Utc>,
    pub generation: u64,
}

impl RegistrySnapshot {
    fn build(document: ParsedDocument, generation: u64) -> Self {
        let mut by_name = HashMap::with_capacity(document.definitions.len());
        let mut by_kind: HashMap<ExecutorKind, Vec<Arc<ExecutorDefinition>>> = HashMap::new();
        for definition in document.definitions {
            let definition = Arc::new(definition);
            by_kind
                .entry(definition.kind())
                .or_default()
                .push(Arc::clone(&definition));
            by_name.insert(definition.name.clone(), definition);
        }

        Self {
            by_name,
            by_kind,
            config_hash: document.config_hash,
            loaded_at: Utc::now(),
            generation,
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn lookup_by_name(
        &self,
        name: &str,
        kind: ExecutorKind,
    ) -> Result<Arc<ExecutorDefinition>, LookupError> {
        let definition = self.by_name.get(name).ok_or_else(|| LookupError::NotFound {
            name: Some(name.to_string()),
            kind,
        })?;
        if definition.kind() != kind {
            return Err(LookupError::KindMismatch {
                name: name.to_string(),
                expected: kind,
                actual: definition.declared_type.clone(),
            });
        }
        Ok(Arc::clone(definition))
    }

    pub fn lookup_by_kind(&self, kind: ExecutorKind) -> Result<Arc<ExecutorDefinition>, LookupError> {
        match self.by_kind.get(&kind).map(Vec::as_slice) {
            None | Some([]) => Err(LookupError::NotFound { name: None, kind }),
            Some([only]) => Ok(Arc::clone(only)),
            Some(many) => Err(LookupError::Ambiguous {
                kind,
                names: many.iter().map(|d| d.name.clone()).collect(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    NotFound {
        name: Option<String>,
        kind: ExecutorKind,
    },
    KindMismatch {
        name: String,
        expected: ExecutorKind,
        actual: String,
    },
    Ambiguous {
        kind: ExecutorKind,
        names: Vec<String>,
    },
}

impl From<LookupError> for InvocationError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::NotFound {
                name: Some(name),
                kind,
            } => InvocationError::NotFound(format!(
                "no {} executor named `{}`",
                kind.config_type().unwrap_or(kind.as_str()),
                name
            )),
            LookupError::NotFound { name: None, kind } => InvocationError::NotFound(format!(
                "no {} executor is configured",
                kind.config_type().unwrap_or(kind.as_str())
            )),
            LookupError::KindMismatch {
                name,
                expected,
                actual,
            } => InvocationError::KindMismatch {
                name,
                expected: expected.config_type().unwrap_or(expected.as_str()).to_string(),
                actual,
            },
            LookupError::Ambiguous { kind, names } => InvocationError::Ambiguous { kind, names },
        }
    }
}

pub struct Registry {
    source: Box<dyn DefinitionSource>,
    current: ArcSwapOption<RegistrySnapshot>,
    // Serializes loads; holds the last published generation.
    reload_lock: tokio::sync::Mutex<u64>,
}

impl Registry {
    pub fn new(source: impl DefinitionSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            current: ArcSwapOption::empty(),
            reload_lock: tokio::sync::Mutex::new(0),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(FileDefinitionSource::new(path))
    }

    fn published(&self) -> Option<Arc<RegistrySnapshot>> {
        self.current.load_full()
    }

    /// The active snapshot, loading the document on first use.
    pub async fn current_snapshot(&self) -> Result<Arc<RegistrySnapshot>, ConfigError> {
        if let Some(snapshot) = self.published() {
            return Ok(snapshot);
        }

        let mut generation = self.reload_lock.lock().await;
        // Another task may have finished the first load while we waited.
        if let Some(snapshot) = self.published() {
            return Ok(snapshot);
        }
        self.load_locked(&mut generation).await
    }

    /// Loads the document and publishes a new snapshot. On failure the
    /// previous snapshot stays active.
    pub async fn reload(&self) -> Result<Arc<RegistrySnapshot>, ConfigError> {
        let mut generation = self.reload_lock.lock().await;
        self.load_locked(&mut generation).await
    }

    async fn load_locked(&self, generation: &mut u64) -> Result<Arc<RegistrySnapshot>, ConfigError> {
        let document = match self.source.load().await {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(
                    source = %self.source.describe(),
                    error = %err,
                    "extapi.config_reload_failed"
                );
                metrics::observe_config_reload("error", None);
                return Err(err);
            }
        };

        *generation += 1;
        let snapshot = Arc::new(RegistrySnapshot::build(document, *generation));
        self.current.store(Some(Arc::clone(&snapshot)));

        tracing::info!(
            source = %self.source.describe(),
            config_hash = %snapshot.config_hash,
            count = snapshot.len(),
            generation = snapshot.generation,
            "extapi.config_reloaded"
        );
        metrics::observe_config_reload("ok", Some(snapshot.len()));
        Ok(snapshot)
    }

    pub async fn lookup_by_name(
        &self,
        name: &str,
        kind: ExecutorKind,
    ) -> Result<Arc<ExecutorDefinition>, InvocationError> {
        let snapshot = self.current_snapshot().await?;
        Ok(snapshot.lookup_by_name(name, kind)?)
    }

    pub async fn lookup_by_kind(
        &self,
        kind: ExecutorKind,
    ) -> Result<Arc<ExecutorDefinition>, InvocationError> {
        let snapshot = self.current_snapshot().await?;
        Ok(snapshot.lookup_by_kind(kind)?)
    }
}
