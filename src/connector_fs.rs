//! Filesystem connector.
//!
//! Produces one record per file under a root directory:
//!
//! ```json
//! { "path": "guides/setup.md", "size": 1234, "modified": 1700000000.0,
//!   "extension": "md", "content": "..." }
//! ```
//!
//! Files are produced oldest first, ordered by (modification time, path), so
//! a watermark taken from a partial run never hides a file the run had not
//! reached yet. The directory walk and the ordering happen when the fetch
//! starts; file contents are read lazily. `from_date` (inclusive) and
//! `to_date` (exclusive) filter on modification time.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::client::Client;
use crate::error::{HarvestError, Result};
use crate::models::{datetime_to_epoch, epoch_to_datetime, ConnectorDescriptor, FetchParams, Record};
use crate::traits::{Connector, RecordStream};

const CATEGORY: &str = "file";
const VERSION: &str = "0.3.0";

/// `[connectors.filesystem.<name>]` settings.
#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Attach file contents (UTF-8 only) to records.
    #[serde(default = "default_true")]
    pub read_content: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_true() -> bool {
    true
}

pub struct FilesystemConnector {
    config: FilesystemConnectorConfig,
    origin: String,
    descriptor: ConnectorDescriptor,
    include: GlobSet,
    exclude: GlobSet,
}

impl FilesystemConnector {
    pub fn new(config: FilesystemConnectorConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        let origin = config.root.display().to_string();
        let descriptor = ConnectorDescriptor::new([CATEGORY])
            .search_field("extension", "extension")
            .resuming(true);

        Ok(Self {
            config,
            origin,
            descriptor,
            include,
            exclude,
        })
    }

    /// Registry constructor.
    pub fn from_settings(settings: &Value) -> Result<Box<dyn Connector>> {
        let config: FilesystemConnectorConfig = serde_json::from_value(settings.clone())
            .map_err(|e| HarvestError::Config(format!("invalid filesystem settings: {}", e)))?;
        Ok(Box::new(Self::new(config)?))
    }
}

#[async_trait]
impl Connector for FilesystemConnector {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn description(&self) -> &str {
        "Files under a local directory"
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn descriptor(&self) -> &ConnectorDescriptor {
        &self.descriptor
    }

    fn identify(&self, record: &Record) -> Result<String> {
        record
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HarvestError::Parse("file record without a path".to_string()))
    }

    fn updated_at(&self, record: &Record) -> Result<f64> {
        record
            .get("modified")
            .and_then(Value::as_f64)
            .ok_or_else(|| HarvestError::Parse("file record without a modification time".to_string()))
    }

    fn classify(&self, _record: &Record) -> Result<String> {
        Ok(CATEGORY.to_string())
    }

    fn init_client(&self, _from_archive: bool) -> Result<Client> {
        Ok(Client::offline())
    }

    async fn retrieve(
        &self,
        _client: Client,
        _category: &str,
        params: &FetchParams,
    ) -> Result<Box<dyn RecordStream>> {
        let root = &self.config.root;
        if !root.exists() {
            return Err(HarvestError::Connector(format!(
                "filesystem root does not exist: {}",
                root.display()
            )));
        }

        let from_date = params.from_date()?;
        let to_date = params.to_date()?;
        let in_range = |modified: &DateTime<Utc>| {
            from_date.map_or(true, |from| *modified >= from)
                && to_date.map_or(true, |to| *modified < to)
        };

        let mut entries = Vec::new();
        for entry in WalkDir::new(root).follow_links(self.config.follow_symlinks) {
            let entry = entry.map_err(|e| HarvestError::Connector(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let modified = modified_time(path)?;
            let Some(modified_dt) = epoch_to_datetime(modified) else {
                continue;
            };
            if !in_range(&modified_dt) {
                continue;
            }

            entries.push(FileEntry {
                path: path.to_path_buf(),
                relative: rel_str,
                modified,
            });
        }
        entries.sort_by(|a, b| {
            a.modified
                .total_cmp(&b.modified)
                .then_with(|| a.relative.cmp(&b.relative))
        });
        debug!("{} file(s) selected under {}", entries.len(), root.display());

        Ok(Box::new(FilesystemStream {
            entries: entries.into(),
            read_content: self.config.read_content,
        }))
    }
}

struct FileEntry {
    path: PathBuf,
    relative: String,
    modified: f64,
}

struct FilesystemStream {
    entries: VecDeque<FileEntry>,
    read_content: bool,
}

#[async_trait]
impl RecordStream for FilesystemStream {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        match self.entries.pop_front() {
            Some(entry) => {
                file_record(&entry.path, &entry.relative, entry.modified, self.read_content).map(Some)
            }
            None => Ok(None),
        }
    }
}

fn modified_time(path: &Path) -> Result<f64> {
    let modified = std::fs::metadata(path)?
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let dt: DateTime<Utc> = modified.into();
    Ok(datetime_to_epoch(&dt))
}

fn file_record(path: &Path, relative_path: &str, modified: f64, read_content: bool) -> Result<Record> {
    let size = std::fs::metadata(path)?.len();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_string());

    let content = if read_content {
        std::fs::read_to_string(path).ok()
    } else {
        None
    };

    Ok(json!({
        "path": relative_path,
        "size": size,
        "modified": modified,
        "extension": extension,
        "content": content,
    }))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| HarvestError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| HarvestError::Config(e.to_string()))
}
