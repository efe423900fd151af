//! Paged JSON HTTP connector.
//!
//! Walks a listing endpoint page by page:
//!
//! ```text
//! GET <url>?<page_param>=N&<per_page_param>=M[&<since_param>=<from_date>]
//! ```
//!
//! and yields every object found at `items_pointer` in the response. A page
//! shorter than `per_page` (or empty) ends the listing. Every response goes
//! through the [`Client`], so live fetches can be archived and replayed.
//!
//! Records can be enriched with per-item lookups (`[...enrich]`): the keys
//! found at `enrich.keys` are resolved against `enrich.url` in sorted order
//! and the responses are attached under `enrich.into`. Responses are
//! remembered for the whole fetch, so a key is requested at most once.
//!
//! When a cache is bound, each page is written to it as one batch, once the
//! page is fully assembled:
//!
//! ```text
//! Payload({"page": N, "skip": S, "from": .., "to": ..})  Payload(<raw page>)
//!   [ Payload(<lookup>)* Checkpoint(EndOfItem) ]   one group per kept record, when enriching
//! Checkpoint(EndOfBatch)
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::{stable_lookup_order, CacheReplay, CheckpointKind, ReplayEntry};
use crate::client::{
    Client, HttpTransport, RateLimitPolicy, Request, DEFAULT_MAX_RETRIES, DEFAULT_SLEEP_TIME,
    MIN_RATE_LIMIT,
};
use crate::error::{HarvestError, Result};
use crate::metadata::find_value;
use crate::models::{
    datetime_to_epoch, epoch_to_datetime, parse_datetime, ConnectorDescriptor, FetchParams,
    FieldKind, FieldPath, OriginUniqueField, Record,
};
use crate::resume::OffsetCursor;
use crate::traits::{Connector, RecordStream};

const VERSION: &str = "0.2.0";

/// `[connectors.http_json.<name>]` settings.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpJsonConfig {
    pub url: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// JSON pointer to the list of items in a page; empty for a bare list.
    #[serde(default)]
    pub items_pointer: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_updated_field")]
    pub updated_field: String,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_per_page_param")]
    pub per_page_param: String,
    /// Number of the first page on the server side.
    #[serde(default = "default_first_page")]
    pub first_page: u64,
    /// Server-side lower bound on update time, sent as RFC 3339.
    #[serde(default)]
    pub since_param: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub classified_fields: Vec<String>,
    #[serde(default)]
    pub search_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub unique_field: Option<String>,
    #[serde(default = "default_unique_field_type")]
    pub unique_field_type: FieldKind,
    /// The listing is sorted by update time, oldest first.
    #[serde(default)]
    pub ascending: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_sleep_time")]
    pub sleep_time: u64,
    /// Wait for the rate limit to reset instead of failing.
    #[serde(default)]
    pub sleep_for_rate: bool,
    #[serde(default = "default_min_rate_to_sleep")]
    pub min_rate_to_sleep: u64,
    /// Longest rate-limit wait, in seconds, accepted with `sleep_for_rate`.
    #[serde(default)]
    pub max_rate_limit_wait: Option<u64>,
    #[serde(default)]
    pub enrich: Option<EnrichConfig>,
}

/// `[connectors.http_json.<name>.enrich]` settings.
#[derive(Debug, Deserialize, Clone)]
pub struct EnrichConfig {
    /// Dotted path to a key, or a list of keys, in each record.
    pub keys: String,
    /// Lookup URL; `{key}` is replaced by each key.
    pub url: String,
    #[serde(default = "default_enrich_into")]
    pub into: String,
}

fn default_category() -> String {
    "item".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_updated_field() -> String {
    "updated_at".to_string()
}

fn default_per_page() -> u64 {
    30
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_per_page_param() -> String {
    "per_page".to_string()
}

fn default_first_page() -> u64 {
    1
}

fn default_unique_field_type() -> FieldKind {
    FieldKind::Str
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_sleep_time() -> u64 {
    DEFAULT_SLEEP_TIME
}

fn default_min_rate_to_sleep() -> u64 {
    MIN_RATE_LIMIT
}

fn default_enrich_into() -> String {
    "enriched".to_string()
}

/// Header of a cached batch: which part of which page it holds, and the
/// date window the live fetch applied to it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PageInfo {
    page: u64,
    skip: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<DateTime<Utc>>,
}

/// Resolved enrichment settings.
#[derive(Debug)]
struct Enrichment {
    keys: FieldPath,
    url: String,
    into: String,
}

impl Enrichment {
    fn new(config: &EnrichConfig) -> Result<Self> {
        if config.keys.is_empty() || config.into.is_empty() {
            return Err(HarvestError::Config(
                "http_json enrich needs non-empty 'keys' and 'into'".to_string(),
            ));
        }
        if !config.url.contains("{key}") {
            return Err(HarvestError::Config(format!(
                "http_json enrich url '{}' has no {{key}} placeholder",
                config.url
            )));
        }
        Ok(Self {
            keys: FieldPath::parse(&config.keys),
            url: config.url.clone(),
            into: config.into.clone(),
        })
    }

    /// Keys to look up for `record`, in the order they are requested.
    fn keys_of(&self, record: &Record) -> Vec<String> {
        let keys: Vec<String> = match find_value(record, &self.keys) {
            Ok(Value::Array(list)) => list.iter().filter_map(key_string).collect(),
            Ok(value) => key_string(value).into_iter().collect(),
            Err(_) => Vec::new(),
        };
        stable_lookup_order(keys)
    }

    fn request(&self, key: &str) -> Request {
        Request::get(self.url.replace("{key}", key)).header("Accept", "application/json")
    }

    /// Attach `{key: response}` to `record`.
    fn attach(&self, record: &mut Record, keys: &[String], bodies: &[Vec<u8>]) -> Result<()> {
        let mut resolved = Map::new();
        for (key, body) in keys.iter().zip(bodies) {
            let value: Value = serde_json::from_slice(body).map_err(|e| {
                HarvestError::Parse(format!("invalid JSON lookup for '{}': {}", key, e))
            })?;
            resolved.insert(key.clone(), value);
        }
        let object = record.as_object_mut().ok_or_else(|| {
            HarvestError::Parse("only JSON objects can be enriched".to_string())
        })?;
        object.insert(self.into.clone(), Value::Object(resolved));
        Ok(())
    }
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct HttpJsonConnector {
    config: Arc<HttpJsonConfig>,
    descriptor: ConnectorDescriptor,
    id_path: FieldPath,
    updated_path: FieldPath,
    enrichment: Option<Arc<Enrichment>>,
}

impl HttpJsonConnector {
    pub fn new(config: HttpJsonConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(HarvestError::Config("http_json url must not be empty".to_string()));
        }
        if config.per_page == 0 {
            return Err(HarvestError::Config("http_json per_page must be > 0".to_string()));
        }
        if !config.items_pointer.is_empty() && !config.items_pointer.starts_with('/') {
            return Err(HarvestError::Config(format!(
                "items_pointer '{}' must start with '/'",
                config.items_pointer
            )));
        }

        let mut descriptor = ConnectorDescriptor::new([config.category.as_str()])
            .archiving(true)
            .resuming(config.ascending);
        for field in &config.classified_fields {
            descriptor = descriptor.classified_field(field.as_str());
        }
        for (name, path) in &config.search_fields {
            descriptor = descriptor.search_field(name.as_str(), path.as_str());
        }
        if let Some(name) = &config.unique_field {
            descriptor = descriptor
                .origin_unique_field(OriginUniqueField::new(name.as_str(), config.unique_field_type));
        }

        let enrichment = match &config.enrich {
            Some(enrich) => Some(Arc::new(Enrichment::new(enrich)?)),
            None => None,
        };

        Ok(Self {
            id_path: FieldPath::parse(&config.id_field),
            updated_path: FieldPath::parse(&config.updated_field),
            config: Arc::new(config),
            descriptor,
            enrichment,
        })
    }

    /// Registry constructor.
    pub fn from_settings(settings: &Value) -> Result<Box<dyn Connector>> {
        let config: HttpJsonConfig = serde_json::from_value(settings.clone())
            .map_err(|e| HarvestError::Config(format!("invalid http_json settings: {}", e)))?;
        Ok(Box::new(Self::new(config)?))
    }

    fn window(&self, params: &FetchParams) -> Result<Window> {
        Ok(Window {
            from: params.from_date()?,
            to: params.to_date()?,
            updated_path: self.updated_path.clone(),
        })
    }
}

#[async_trait]
impl Connector for HttpJsonConnector {
    fn name(&self) -> &str {
        "http_json"
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn description(&self) -> &str {
        "Paged JSON HTTP API"
    }

    fn origin(&self) -> &str {
        &self.config.url
    }

    fn descriptor(&self) -> &ConnectorDescriptor {
        &self.descriptor
    }

    fn identify(&self, record: &Record) -> Result<String> {
        match find_value(record, &self.id_path) {
            Ok(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Ok(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(HarvestError::Parse(format!(
                "record without a usable '{}' field",
                self.id_path
            ))),
        }
    }

    fn updated_at(&self, record: &Record) -> Result<f64> {
        updated_epoch(record, &self.updated_path)
    }

    fn classify(&self, _record: &Record) -> Result<String> {
        Ok(self.config.category.clone())
    }

    fn init_client(&self, from_archive: bool) -> Result<Client> {
        if from_archive {
            return Ok(Client::offline());
        }
        let transport = HttpTransport::new(self.config.token.clone())?
            .with_retries(self.config.max_retries, self.config.sleep_time)
            .with_rate_limit(RateLimitPolicy::new(
                self.config.sleep_for_rate,
                self.config.min_rate_to_sleep,
                self.config.max_rate_limit_wait,
            ));
        Ok(Client::new(Box::new(transport)))
    }

    async fn retrieve(
        &self,
        client: Client,
        _category: &str,
        params: &FetchParams,
    ) -> Result<Box<dyn RecordStream>> {
        let offset = params.offset()?.unwrap_or(0);
        let cursor = OffsetCursor::new(self.config.per_page, offset as u64);
        let since = match (&self.config.since_param, params.from_date()?) {
            (Some(name), Some(from)) => Some((name.clone(), from)),
            _ => None,
        };

        Ok(Box::new(HttpJsonStream {
            config: self.config.clone(),
            client,
            cursor,
            since,
            window: self.window(params)?,
            enrichment: self.enrichment.clone(),
            lookups: HashMap::new(),
            buffer: VecDeque::new(),
            last_offset: None,
            done: false,
        }))
    }

    async fn retrieve_from_cache(
        &self,
        _category: &str,
        replay: CacheReplay,
    ) -> Result<Box<dyn RecordStream>> {
        Ok(Box::new(CachedPagesStream {
            config: self.config.clone(),
            updated_path: self.updated_path.clone(),
            enrichment: self.enrichment.clone(),
            replay,
            buffer: VecDeque::new(),
            last_offset: None,
        }))
    }
}

/// Client-side date filter, applied even when the server honours `since`.
#[derive(Debug, Clone)]
struct Window {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    updated_path: FieldPath,
}

impl Window {
    fn contains(&self, record: &Record) -> Result<bool> {
        if self.from.is_none() && self.to.is_none() {
            return Ok(true);
        }
        let updated = updated_epoch(record, &self.updated_path)?;
        let Some(at) = epoch_to_datetime(updated) else {
            return Ok(false);
        };
        Ok(self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to))
    }
}

struct HttpJsonStream {
    config: Arc<HttpJsonConfig>,
    client: Client,
    cursor: OffsetCursor,
    since: Option<(String, DateTime<Utc>)>,
    window: Window,
    enrichment: Option<Arc<Enrichment>>,
    /// Lookup responses by key, for the whole fetch.
    lookups: HashMap<String, Vec<u8>>,
    buffer: VecDeque<(i64, Record)>,
    last_offset: Option<i64>,
    done: bool,
}

impl HttpJsonStream {
    fn request(&self, page: u64) -> Request {
        let mut request = Request::get(self.config.url.as_str())
            .param(self.config.page_param.as_str(), page + self.config.first_page)
            .param(self.config.per_page_param.as_str(), self.config.per_page)
            .header("Accept", "application/json");
        if let Some((name, from)) = &self.since {
            request = request.param(name.as_str(), from.to_rfc3339());
        }
        request
    }

    async fn lookup(&mut self, enrichment: &Enrichment, key: &str) -> Result<Vec<u8>> {
        if let Some(body) = self.lookups.get(key) {
            return Ok(body.clone());
        }
        let body = self.client.fetch(&enrichment.request(key)).await?;
        self.lookups.insert(key.to_string(), body.clone());
        Ok(body)
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let info = PageInfo {
            page: self.cursor.page(),
            skip: self.cursor.index(),
            from: self.window.from,
            to: self.window.to,
        };
        let request = self.request(info.page);
        debug!("Fetching page {} of {}", info.page, self.config.url);

        let body = self.client.fetch(&request).await?;
        let records = parse_page(&body, &self.config.items_pointer)?;
        if (records.len() as u64) < self.config.per_page {
            self.done = true;
        }

        let mut kept = Vec::new();
        for (offset, mut record) in page_entries(&info, self.config.per_page, records) {
            if !self.window.contains(&record)? {
                continue;
            }
            let mut bodies = Vec::new();
            if let Some(enrichment) = self.enrichment.clone() {
                let keys = enrichment.keys_of(&record);
                for key in &keys {
                    bodies.push(self.lookup(&enrichment, key).await?);
                }
                enrichment.attach(&mut record, &keys, &bodies)?;
            }
            kept.push((offset, record, bodies));
        }

        let enriching = self.enrichment.is_some();
        if let Some(queue) = self.client.cache() {
            queue.push_payload(serde_json::to_vec(&info)?);
            queue.push_payload(body);
            if enriching {
                for (_, _, bodies) in &kept {
                    for lookup in bodies {
                        queue.push_payload(lookup.clone());
                    }
                    queue.push_checkpoint(CheckpointKind::EndOfItem);
                }
            }
            queue.push_checkpoint(CheckpointKind::EndOfBatch);
            queue.flush()?;
        }

        self.buffer = kept
            .into_iter()
            .map(|(offset, record, _)| (offset, record))
            .collect();
        self.cursor.next_page();
        Ok(())
    }
}

#[async_trait]
impl RecordStream for HttpJsonStream {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some((offset, record)) = self.buffer.pop_front() {
                self.last_offset = Some(offset);
                return Ok(Some(record));
            }
            if self.done {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    fn last_offset(&self) -> Option<i64> {
        self.last_offset
    }
}

/// Rebuilds records from batches written by [`HttpJsonStream`].
struct CachedPagesStream {
    config: Arc<HttpJsonConfig>,
    updated_path: FieldPath,
    enrichment: Option<Arc<Enrichment>>,
    replay: CacheReplay,
    buffer: VecDeque<(i64, Record)>,
    last_offset: Option<i64>,
}

impl CachedPagesStream {
    fn read_batch(&mut self, info: PageInfo) -> Result<()> {
        let body = self.replay.expect_payload()?;
        let records = parse_page(&body, &self.config.items_pointer)?;
        let window = Window {
            from: info.from,
            to: info.to,
            updated_path: self.updated_path.clone(),
        };

        for (offset, mut record) in page_entries(&info, self.config.per_page, records) {
            if !window.contains(&record)? {
                continue;
            }
            if let Some(enrichment) = &self.enrichment {
                let keys = enrichment.keys_of(&record);
                let bodies = self.replay.payloads_until(CheckpointKind::EndOfItem)?;
                if bodies.len() != keys.len() {
                    return Err(HarvestError::CacheCorrupted(format!(
                        "item at offset {} expects {} lookup(s), cache holds {}",
                        offset,
                        keys.len(),
                        bodies.len()
                    )));
                }
                enrichment.attach(&mut record, &keys, &bodies)?;
            }
            self.buffer.push_back((offset, record));
        }

        self.replay.expect_checkpoint(CheckpointKind::EndOfBatch)
    }
}

#[async_trait]
impl RecordStream for CachedPagesStream {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some((offset, record)) = self.buffer.pop_front() {
                self.last_offset = Some(offset);
                return Ok(Some(record));
            }

            let info = match self.replay.next_entry() {
                ReplayEntry::End => return Ok(None),
                ReplayEntry::Payload(data) => serde_json::from_slice::<PageInfo>(&data)
                    .map_err(|e| HarvestError::CacheCorrupted(format!("invalid page header: {}", e)))?,
                ReplayEntry::Checkpoint(kind) => {
                    return Err(HarvestError::CacheCorrupted(format!(
                        "unexpected checkpoint {:?} at the start of a batch",
                        kind
                    )))
                }
            };
            self.read_batch(info)?;
        }
    }

    fn last_offset(&self) -> Option<i64> {
        self.last_offset
    }
}

fn page_entries(info: &PageInfo, per_page: u64, records: Vec<Record>) -> Vec<(i64, Record)> {
    let mut cursor = OffsetCursor::new(per_page, info.page * per_page + info.skip);
    records
        .into_iter()
        .skip(info.skip as usize)
        .map(|record| (cursor.advance() as i64, record))
        .collect()
}

fn parse_page(body: &[u8], items_pointer: &str) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| HarvestError::Parse(format!("invalid JSON page: {}", e)))?;

    let items = if items_pointer.is_empty() {
        value
    } else {
        value.pointer(items_pointer).cloned().ok_or_else(|| {
            HarvestError::Parse(format!("no items found at '{}'", items_pointer))
        })?
    };

    match items {
        Value::Array(list) => Ok(list),
        Value::Null => Ok(Vec::new()),
        other => Err(HarvestError::Parse(format!(
            "items at '{}' are not a list: {}",
            items_pointer, other
        ))),
    }
}

/// Update time of a record as epoch seconds; accepts numbers and dates.
fn updated_epoch(record: &Record, path: &FieldPath) -> Result<f64> {
    match find_value(record, path) {
        Ok(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| HarvestError::Parse(format!("invalid '{}' value {}", path, n))),
        Ok(Value::String(s)) => parse_datetime(s)
            .map(|dt| datetime_to_epoch(&dt))
            .map_err(|_| HarvestError::Parse(format!("invalid '{}' value {}", path, s))),
        _ => Err(HarvestError::Parse(format!(
            "record without a usable '{}' field",
            path
        ))),
    }
}
