//! Fetch driver.
//!
//! A [`Backend`] wraps one connector instance together with what a fetch
//! needs around it: the tag stamped on items, an optional archive, an
//! optional cache and a block-list. Each fetch mode returns an owned,
//! single-pass [`ItemStream`] that pulls raw records from the connector and
//! turns them into envelopes on demand.
//!
//! ```text
//!            fetch / fetch_resumed          fetch_from_archive        fetch_from_cache
//!                    │                             │                        │
//!   validate ────────┤                             │                        │
//!   tag archive ─────┤                             │                        │
//!   init_client(false)                    init_client(true)          Cache::replay()
//!                    ▼                             ▼                        ▼
//!             Connector::retrieve          Connector::retrieve    Connector::retrieve_from_cache
//!                    └──────────────┬──────────────┘────────────────────────┘
//!                                   ▼
//!                  ItemStream: block-list ─▶ redact ─▶ envelope ─▶ Summary
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::cache::{Cache, CacheQueue};
use crate::error::{HarvestError, Result};
use crate::fingerprint::fingerprint;
use crate::metadata::{build_item, filter_classified_data, find_value};
use crate::models::{FetchParams, FieldKind, FieldPath, Item, Record};
use crate::resume::Watermark;
use crate::summary::Summary;
use crate::traits::{Connector, RecordStream};

/// Records whose origin-unique field holds one of these values are dropped.
#[derive(Debug, Clone, PartialEq)]
struct Blocklist {
    field: FieldPath,
    values: Vec<Value>,
}

impl Blocklist {
    fn matches(&self, record: &Record) -> bool {
        match find_value(record, &self.field) {
            Ok(value) => self.values.iter().any(|v| v == value),
            Err(_) => false,
        }
    }
}

/// One connector instance plus the per-fetch collaborators.
pub struct Backend {
    connector: Arc<dyn Connector>,
    tag: String,
    archive: Option<Archive>,
    cache: Option<Cache>,
    blocklist: Option<Blocklist>,
}

impl Backend {
    /// Wrap `connector`. Items are tagged with its origin until
    /// [`with_tag`](Self::with_tag) says otherwise.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let tag = connector.origin().to_string();
        Self {
            connector,
            tag,
            archive: None,
            cache: None,
            blocklist: None,
        }
    }

    /// Use `tag` for items. `None` or an empty tag falls back to the origin.
    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = match tag {
            Some(tag) if !tag.is_empty() => tag,
            _ => self.connector.origin().to_string(),
        };
        self
    }

    /// Record traffic into (or replay it from) `archive`.
    pub fn with_archive(mut self, archive: Archive) -> Result<Self> {
        if !self.connector.descriptor().has_archiving() {
            return Err(HarvestError::Config(format!(
                "{} does not support archiving",
                self.connector.name()
            )));
        }
        self.archive = Some(archive);
        Ok(self)
    }

    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Drop records whose origin-unique field matches one of `ids`.
    ///
    /// Ids are given as text and converted to the field's declared type.
    pub fn with_blocklist<I, S>(mut self, ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        if ids.is_empty() {
            self.blocklist = None;
            return Ok(self);
        }

        let field = self.connector.descriptor().unique_field().ok_or_else(|| {
            HarvestError::Config(format!(
                "origin unique field not defined for {}; ids cannot be block-listed",
                self.connector.name()
            ))
        })?;

        let values = ids
            .iter()
            .map(|id| match field.kind {
                FieldKind::Str => Ok(Value::String(id.clone())),
                FieldKind::Int => id.trim().parse::<i64>().map(Value::from).map_err(|_| {
                    HarvestError::Config(format!(
                        "{} is not a valid value for integer field {}",
                        id, field.name
                    ))
                }),
            })
            .collect::<Result<Vec<Value>>>()?;

        self.blocklist = Some(Blocklist {
            field: FieldPath::parse(&field.name),
            values,
        });
        Ok(self)
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn origin(&self) -> &str {
        self.connector.origin()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn categories(&self) -> &[String] {
        self.connector.descriptor().categories()
    }

    pub fn archive(&self) -> Option<&Archive> {
        self.archive.as_ref()
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    /// Detach the archive, e.g. to discard it after a failed fetch.
    pub fn take_archive(&mut self) -> Option<Archive> {
        self.archive.take()
    }

    /// Fetch items of `category` from the source.
    ///
    /// Configuration problems are reported before the connector's client
    /// is even built, so nothing touches the network.
    pub async fn fetch(
        &mut self,
        category: &str,
        filter_classified: bool,
        params: FetchParams,
    ) -> Result<ItemStream> {
        self.check_category(category)?;

        if filter_classified && self.archive.is_some() {
            return Err(HarvestError::Config(
                "classified fields filtering is not compatible with archiving items".to_string(),
            ));
        }

        // Validate the well-known params up front.
        params.from_date()?;
        params.to_date()?;
        params.offset()?;

        if let Some(archive) = self.archive.as_mut() {
            archive
                .init_metadata(
                    self.connector.origin(),
                    self.connector.name(),
                    self.connector.version(),
                    category,
                    &params,
                )
                .await?;
        }

        let mut client = self.connector.init_client(false)?;
        if let Some(archive) = &self.archive {
            client.bind_archive(archive.clone(), false);
        }
        if let Some(cache) = &self.cache {
            client.bind_cache(CacheQueue::new(cache.clone()));
        }

        info!(
            "Fetching {} items from {} ({})",
            category,
            self.connector.origin(),
            self.connector.name()
        );

        let records = self.connector.retrieve(client, category, &params).await?;
        Ok(self.stream(records, filter_classified))
    }

    /// Replay the fetch stored in the associated archive.
    ///
    /// Category and parameters are the ones the archive was tagged with.
    /// Archives always hold raw responses, so classified fields can be
    /// redacted on the way out.
    pub async fn fetch_from_archive(&mut self, filter_classified: bool) -> Result<ItemStream> {
        let archive = self.archive.as_ref().ok_or_else(|| {
            HarvestError::ArchiveUnavailable(format!(
                "archive instance was not provided to {}",
                self.connector.name()
            ))
        })?;

        let metadata = archive.metadata().cloned().ok_or_else(|| {
            HarvestError::Archive(format!(
                "archive {} has no metadata",
                archive.path().display()
            ))
        })?;
        self.check_category(&metadata.category)?;

        let mut client = self.connector.init_client(true)?;
        client.bind_archive(archive.clone(), true);

        info!(
            "Fetching {} items from archive {}",
            metadata.category,
            archive.path().display()
        );

        let records = self
            .connector
            .retrieve(client, &metadata.category, &metadata.backend_params)
            .await?;
        Ok(self.stream(records, filter_classified))
    }

    /// Rebuild items of `category` from the associated cache.
    pub async fn fetch_from_cache(
        &mut self,
        category: &str,
        filter_classified: bool,
    ) -> Result<ItemStream> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            HarvestError::Cache(format!("cache not set for {}", self.connector.name()))
        })?;
        self.check_category(category)?;

        info!(
            "Fetching {} items from cache {}",
            category,
            cache.path().display()
        );

        let replay = cache.replay()?;
        let records = self.connector.retrieve_from_cache(category, replay).await?;
        Ok(self.stream(records, filter_classified))
    }

    /// Continue a previous fetch from `watermark`.
    ///
    /// Items at exactly the watermark instant that were already produced are
    /// dropped and counted as skipped. Connectors that cannot guarantee a
    /// gap-free continuation are refused.
    pub async fn fetch_resumed(
        &mut self,
        category: &str,
        filter_classified: bool,
        watermark: &Watermark,
        params: FetchParams,
    ) -> Result<ItemStream> {
        if !self.connector.descriptor().has_resuming() {
            return Err(HarvestError::Config(format!(
                "{} does not support resuming; a full fetch is required",
                self.connector.name()
            )));
        }

        let params = watermark.apply(params);
        let mut stream = self.fetch(category, filter_classified, params).await?;
        stream.watermark = Some(watermark.clone());
        Ok(stream)
    }

    fn check_category(&self, category: &str) -> Result<()> {
        if self.connector.descriptor().has_category(category) {
            Ok(())
        } else {
            Err(HarvestError::Config(format!(
                "{} category not valid for {}",
                category,
                self.connector.name()
            )))
        }
    }

    fn stream(&self, records: Box<dyn RecordStream>, filter_classified: bool) -> ItemStream {
        ItemStream {
            connector: self.connector.clone(),
            records,
            tag: self.tag.clone(),
            filter_classified,
            blocklist: self.blocklist.clone(),
            watermark: None,
            summary: Summary::new(),
            finished: false,
        }
    }
}

/// Owned, single-pass stream of items produced by one fetch.
pub struct ItemStream {
    connector: Arc<dyn Connector>,
    records: Box<dyn RecordStream>,
    tag: String,
    filter_classified: bool,
    blocklist: Option<Blocklist>,
    watermark: Option<Watermark>,
    summary: Summary,
    finished: bool,
}

impl ItemStream {
    /// Pull the next item. `Ok(None)` once the source is exhausted.
    ///
    /// After an error the stream is finished.
    pub async fn next(&mut self) -> Result<Option<Item>> {
        if self.finished {
            return Ok(None);
        }

        match self.pull().await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => {
                self.finished = true;
                info!(
                    "Fetch process completed: {} items fetched, {} skipped",
                    self.summary.fetched, self.summary.skipped
                );
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    async fn pull(&mut self) -> Result<Option<Item>> {
        loop {
            let Some(mut record) = self.records.next_record().await? else {
                return Ok(None);
            };

            if let Some(blocklist) = &self.blocklist {
                if blocklist.matches(&record) {
                    let blocked = find_value(&record, &blocklist.field)
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    warn!("Skipping blacklisted item {}: {}", blocklist.field, blocked);
                    self.summary.skip();
                    continue;
                }
            }

            if let Some(watermark) = &self.watermark {
                let id = self.connector.identify(&record)?;
                let uuid = fingerprint(&[self.connector.origin(), id.as_str()])?;
                let updated_on = self.connector.updated_at(&record)?;
                if watermark.already_seen(&uuid, updated_on) {
                    debug!("Skipping item {} already fetched at the watermark", uuid);
                    self.summary.skip();
                    continue;
                }
            }

            if self.filter_classified {
                filter_classified_data(self.connector.as_ref(), &mut record)?;
            }

            let item = build_item(
                self.connector.as_ref(),
                &self.tag,
                record,
                self.filter_classified,
                self.records.last_offset(),
            )?;
            self.summary.update(&item);
            return Ok(Some(item));
        }
    }

    /// Running summary; final once [`next`](Self::next) returned `Ok(None)`.
    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drain the stream into a vector.
    pub async fn collect(&mut self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    pub fn into_summary(self) -> Summary {
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::models::{ConnectorDescriptor, OriginUniqueField};
    use crate::traits::VecRecordStream;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed {
        descriptor: ConnectorDescriptor,
        records: Vec<Record>,
    }

    #[async_trait]
    impl Connector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
        fn description(&self) -> &str {
            "fixed records"
        }
        fn origin(&self) -> &str {
            "fixed://origin"
        }
        fn descriptor(&self) -> &ConnectorDescriptor {
            &self.descriptor
        }
        fn identify(&self, record: &Record) -> Result<String> {
            Ok(record["id"].as_str().unwrap_or_default().to_string())
        }
        fn updated_at(&self, record: &Record) -> Result<f64> {
            Ok(record["ts"].as_f64().unwrap_or_default())
        }
        fn classify(&self, _record: &Record) -> Result<String> {
            Ok("thing".to_string())
        }
        fn init_client(&self, _from_archive: bool) -> Result<Client> {
            Ok(Client::offline())
        }
        async fn retrieve(
            &self,
            _client: Client,
            _category: &str,
            _params: &FetchParams,
        ) -> Result<Box<dyn RecordStream>> {
            Ok(Box::new(VecRecordStream::new(self.records.clone())))
        }
    }

    fn backend(descriptor: ConnectorDescriptor) -> Backend {
        Backend::new(Arc::new(Fixed {
            descriptor,
            records: vec![
                json!({"id": "1", "ts": 10.0, "num": 1}),
                json!({"id": "2", "ts": 20.0, "num": 2}),
                json!({"id": "3", "ts": 20.0, "num": 3}),
            ],
        }))
    }

    #[test]
    fn tag_defaults_to_origin() {
        let b = backend(ConnectorDescriptor::new(["thing"]));
        assert_eq!(b.tag(), "fixed://origin");
        let b = b.with_tag(Some(String::new()));
        assert_eq!(b.tag(), "fixed://origin");
        let b = b.with_tag(Some("mytag".into()));
        assert_eq!(b.tag(), "mytag");
    }

    #[test]
    fn blocklist_requires_unique_field() {
        let err = backend(ConnectorDescriptor::new(["thing"]))
            .with_blocklist(["1"])
            .err()
            .unwrap();
        assert!(matches!(err, HarvestError::Config(_)));

        let err = backend(
            ConnectorDescriptor::new(["thing"])
                .origin_unique_field(OriginUniqueField::new("num", FieldKind::Int)),
        )
        .with_blocklist(["abc"])
        .err()
        .unwrap();
        assert!(matches!(err, HarvestError::Config(_)));
    }

    #[tokio::test]
    async fn blocklisted_records_are_skipped() {
        let mut b = backend(
            ConnectorDescriptor::new(["thing"])
                .origin_unique_field(OriginUniqueField::new("num", FieldKind::Int)),
        )
        .with_blocklist(["2"])
        .unwrap();

        let mut stream = b.fetch("thing", false, FetchParams::new()).await.unwrap();
        let items = stream.collect().await.unwrap();
        let ids: Vec<&Value> = items.iter().map(|i| &i.data["num"]).collect();
        assert_eq!(ids, vec![&json!(1), &json!(3)]);
        assert_eq!(stream.summary().fetched, 2);
        assert_eq!(stream.summary().skipped, 1);
        assert_eq!(stream.summary().total(), 3);
    }

    #[tokio::test]
    async fn invalid_category_is_config_error() {
        let mut b = backend(ConnectorDescriptor::new(["thing"]));
        let err = b.fetch("other", false, FetchParams::new()).await.err().unwrap();
        assert_eq!(err.to_string(), "other category not valid for fixed");
    }

    #[tokio::test]
    async fn resumed_fetch_requires_capability() {
        let mut b = backend(ConnectorDescriptor::new(["thing"]));
        let err = b
            .fetch_resumed("thing", false, &Watermark::new(), FetchParams::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarvestError::Config(_)));
    }

    #[tokio::test]
    async fn resumed_fetch_drops_boundary_duplicates() {
        let mut b = backend(ConnectorDescriptor::new(["thing"]).resuming(true));

        let mut first = b.fetch("thing", false, FetchParams::new()).await.unwrap();
        let mut watermark = Watermark::new();
        for item in first.collect().await.unwrap().iter().take(2) {
            watermark.observe(item);
        }

        let mut resumed = b
            .fetch_resumed("thing", false, &watermark, FetchParams::new())
            .await
            .unwrap();
        let items = resumed.collect().await.unwrap();
        let ids: Vec<&str> = items
            .iter()
            .map(|i| i.search_fields["item_id"].as_str().unwrap())
            .collect();
        // Record "1" is older than the watermark but this connector ignores
        // from_date, so only the boundary item is dropped here.
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(resumed.summary().skipped, 1);
    }

    #[tokio::test]
    async fn stream_is_single_pass() {
        let mut b = backend(ConnectorDescriptor::new(["thing"]));
        let mut stream = b.fetch("thing", false, FetchParams::new()).await.unwrap();
        assert_eq!(stream.collect().await.unwrap().len(), 3);
        assert!(stream.is_finished());
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(stream.summary().fetched, 3);
    }

    #[tokio::test]
    async fn archive_replay_without_archive_is_unavailable() {
        let mut b = backend(ConnectorDescriptor::new(["thing"]).archiving(true));
        let err = b.fetch_from_archive(false).await.err().unwrap();
        assert!(matches!(err, HarvestError::ArchiveUnavailable(_)));
    }

    #[tokio::test]
    async fn cache_replay_without_cache_fails() {
        let mut b = backend(ConnectorDescriptor::new(["thing"]));
        let err = b.fetch_from_cache("thing", false).await.err().unwrap();
        assert!(matches!(err, HarvestError::Cache(_)));
    }
}
