//! Connector contract and registry.
//!
//! A connector knows how to talk to one kind of source. The harvesting core
//! drives it through two groups of methods:
//!
//! - **hooks** that inspect a raw record ([`identify`](Connector::identify),
//!   [`updated_at`](Connector::updated_at), [`classify`](Connector::classify))
//!   plus static configuration ([`descriptor`](Connector::descriptor));
//! - **retrieval**, which returns a [`RecordStream`] pulling raw records one
//!   at a time through a [`Client`] the core has already bound to the
//!   archive and cache of the current fetch.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │   "filesystem" ─▶ FilesystemConnector    │
//! │   "http_json"  ─▶ HttpJsonConnector      │
//! │   ...          ─▶ (registered by caller) │
//! └──────────────┬───────────────────────────┘
//!                ▼ build(type, settings)
//!          Box<dyn Connector> ─▶ Backend::fetch() ─▶ ItemStream
//! ```
//!
//! Connectors are registered explicitly; there is no runtime discovery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::CacheReplay;
use crate::client::Client;
use crate::error::{HarvestError, Result};
use crate::models::{ConnectorDescriptor, FetchParams, Record};

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// A source of raw records.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use item_harvest::client::Client;
/// use item_harvest::error::Result;
/// use item_harvest::models::{ConnectorDescriptor, FetchParams, Record};
/// use item_harvest::traits::{Connector, RecordStream, VecRecordStream};
///
/// struct Numbers {
///     descriptor: ConnectorDescriptor,
/// }
///
/// #[async_trait]
/// impl Connector for Numbers {
///     fn name(&self) -> &str { "numbers" }
///     fn version(&self) -> &str { "0.1.0" }
///     fn description(&self) -> &str { "Counts to three" }
///     fn origin(&self) -> &str { "numbers://local" }
///     fn descriptor(&self) -> &ConnectorDescriptor { &self.descriptor }
///
///     fn identify(&self, record: &Record) -> Result<String> {
///         Ok(record["n"].to_string())
///     }
///     fn updated_at(&self, record: &Record) -> Result<f64> {
///         Ok(record["n"].as_f64().unwrap_or_default())
///     }
///     fn classify(&self, _record: &Record) -> Result<String> {
///         Ok("number".to_string())
///     }
///
///     fn init_client(&self, _from_archive: bool) -> Result<Client> {
///         Ok(Client::offline())
///     }
///
///     async fn retrieve(
///         &self,
///         _client: Client,
///         _category: &str,
///         _params: &FetchParams,
///     ) -> Result<Box<dyn RecordStream>> {
///         let records = (1..=3).map(|n| serde_json::json!({ "n": n })).collect();
///         Ok(Box::new(VecRecordStream::new(records)))
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector name stamped on every item as `backend_name`.
    fn name(&self) -> &str;

    /// Connector version stamped on every item as `backend_version`.
    fn version(&self) -> &str;

    /// One-line description, shown by `harvest connectors`.
    fn description(&self) -> &str;

    /// Identifier of the data source (URL, path, ...).
    fn origin(&self) -> &str;

    /// Static configuration: categories, classified and search fields,
    /// capabilities.
    fn descriptor(&self) -> &ConnectorDescriptor;

    /// Source-native id of a record, unique within the origin.
    fn identify(&self, record: &Record) -> Result<String>;

    /// Last update time of a record, epoch seconds.
    fn updated_at(&self, record: &Record) -> Result<f64>;

    /// Category of a record. Must be one of the declared categories.
    fn classify(&self, record: &Record) -> Result<String>;

    /// Build the client used by one retrieval. `from_archive` is set when
    /// every response will come from an archive.
    fn init_client(&self, from_archive: bool) -> Result<Client>;

    /// Start pulling raw records of `category`.
    async fn retrieve(
        &self,
        client: Client,
        category: &str,
        params: &FetchParams,
    ) -> Result<Box<dyn RecordStream>>;

    /// Rebuild records of `category` from a cache stream.
    ///
    /// Connectors that never write to the cache keep the default.
    async fn retrieve_from_cache(
        &self,
        category: &str,
        replay: CacheReplay,
    ) -> Result<Box<dyn RecordStream>> {
        let _ = replay;
        Err(HarvestError::Cache(format!(
            "{} does not support fetching {} from the cache",
            self.name(),
            category
        )))
    }
}

/// Pull-based source of raw records.
///
/// `Ok(None)` marks the clean end of the stream; every failure is an `Err`.
#[async_trait]
pub trait RecordStream: Send {
    async fn next_record(&mut self) -> Result<Option<Record>>;

    /// Offset of the record most recently returned, for offset-based
    /// connectors.
    fn last_offset(&self) -> Option<i64> {
        None
    }
}

/// Stream over records already in memory.
pub struct VecRecordStream {
    records: std::vec::IntoIter<Record>,
}

impl VecRecordStream {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

#[async_trait]
impl RecordStream for VecRecordStream {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.records.next())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Builds a connector from its configuration table.
pub type ConnectorFactory = fn(&Value) -> Result<Box<dyn Connector>>;

/// Registered connector type.
#[derive(Clone)]
pub struct ConnectorEntry {
    pub type_name: String,
    pub description: String,
    factory: ConnectorFactory,
}

impl ConnectorEntry {
    pub fn build(&self, settings: &Value) -> Result<Box<dyn Connector>> {
        (self.factory)(settings)
    }
}

/// Static mapping from connector type name to constructor.
///
/// # Example
///
/// ```rust
/// use item_harvest::traits::ConnectorRegistry;
///
/// let registry = ConnectorRegistry::with_builtins();
/// assert!(registry.contains("filesystem"));
/// ```
pub struct ConnectorRegistry {
    entries: BTreeMap<String, ConnectorEntry>,
}

impl ConnectorRegistry {
    /// Create an empty connector registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Create a registry holding the connectors shipped with this crate.
    pub fn with_builtins() -> Self {
        use crate::connector_fs::FilesystemConnector;
        use crate::connector_http::HttpJsonConnector;

        let mut registry = Self::new();
        registry.register(
            "filesystem",
            "Files under a local directory",
            FilesystemConnector::from_settings,
        );
        registry.register(
            "http_json",
            "Paged JSON HTTP API",
            HttpJsonConnector::from_settings,
        );
        registry
    }

    /// Register (or replace) a connector type.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        description: impl Into<String>,
        factory: ConnectorFactory,
    ) {
        let type_name = type_name.into();
        self.entries.insert(
            type_name.clone(),
            ConnectorEntry {
                type_name,
                description: description.into(),
                factory,
            },
        );
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn find(&self, type_name: &str) -> Option<&ConnectorEntry> {
        self.entries.get(type_name)
    }

    /// Build a connector of `type_name` from its settings.
    pub fn build(&self, type_name: &str, settings: &Value) -> Result<Box<dyn Connector>> {
        let entry = self.find(type_name).ok_or_else(|| {
            HarvestError::Config(format!("unknown connector type '{}'", type_name))
        })?;
        entry.build(settings)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConnectorEntry> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
