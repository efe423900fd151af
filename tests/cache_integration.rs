//! Cache round trips through the paged JSON connector.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use item_harvest::backend::Backend;
use item_harvest::cache::{Cache, CacheQueue, CacheRecord, CheckpointKind};
use item_harvest::client::{Client, Request, Transport};
use item_harvest::error::{HarvestError, Result};
use item_harvest::ingest::{FetchRequest, ItemsGenerator};
use item_harvest::models::{FetchParams, Record};
use item_harvest::traits::{Connector, ConnectorRegistry};

const URL: &str = "https://tracker.example.com/api/issues";

/// Serves `total` issues, `updated_at` = 5000 + n.
struct Issues {
    total: u64,
}

#[async_trait]
impl Transport for Issues {
    async fn send(&self, request: &Request) -> Result<Vec<u8>> {
        let page: u64 = request.params["page"].parse().unwrap();
        let per_page: u64 = request.params["per_page"].parse().unwrap();
        let start = (page - 1) * per_page;
        let items: Vec<Value> = (start..(start + per_page).min(self.total))
            .map(|n| json!({"id": n, "updated_at": 5000 + n, "title": format!("Issue {}", n)}))
            .collect();
        Ok(serde_json::to_vec(&items)?)
    }
}

fn connector() -> Arc<dyn Connector> {
    connector_with(json!({}))
}

/// The issues connector with `extra` merged into its settings.
fn connector_with(extra: Value) -> Arc<dyn Connector> {
    let mut settings = json!({"url": URL, "category": "issue", "per_page": 4});
    if let (Some(base), Value::Object(extra)) = (settings.as_object_mut(), extra) {
        base.extend(extra);
    }
    Arc::from(
        ConnectorRegistry::with_builtins()
            .build("http_json", &settings)
            .unwrap(),
    )
}

/// Run a live retrieval that writes every page to `cache`.
async fn fill(connector: &Arc<dyn Connector>, cache: &Cache, total: u64) -> Vec<Record> {
    let mut client = Client::new(Box::new(Issues { total }));
    client.bind_cache(CacheQueue::new(cache.clone()));
    let mut stream = connector
        .retrieve(client, "issue", &FetchParams::new())
        .await
        .unwrap();
    let mut records = Vec::new();
    while let Some(record) = stream.next_record().await.unwrap() {
        records.push(record);
    }
    records
}

#[tokio::test]
async fn cached_fetch_rebuilds_the_same_items() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::new(tmp.path().join("cache")).unwrap();
    let connector = connector();

    let live = fill(&connector, &cache, 10).await;
    assert_eq!(live.len(), 10);

    // 3 pages, each a header, a body and a checkpoint.
    let stored = cache.retrieve().unwrap();
    assert_eq!(stored.len(), 9);
    assert_eq!(stored[2], CacheRecord::checkpoint(CheckpointKind::EndOfBatch));

    let mut backend = Backend::new(connector).with_cache(cache);
    let mut stream = backend.fetch_from_cache("issue", false).await.unwrap();
    let items = stream.collect().await.unwrap();

    let data: Vec<Record> = items.iter().map(|i| i.data.clone()).collect();
    assert_eq!(data, live);
    assert_eq!(items[3].search_fields["item_id"], json!("3"));
    assert_eq!(stream.summary().fetched, 10);
    assert_eq!(stream.summary().last_offset, Some(9));
}

#[tokio::test]
async fn truncated_cache_is_reported_as_corrupted() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::new(tmp.path().join("cache")).unwrap();
    let connector = connector();
    fill(&connector, &cache, 6).await;

    // Keep the first batch and the header of the second one.
    let mut stored = cache.retrieve().unwrap();
    stored.truncate(4);
    cache.clean(true).unwrap();
    cache.store(&stored).unwrap();

    let mut backend = Backend::new(connector).with_cache(cache);
    let mut stream = backend.fetch_from_cache("issue", false).await.unwrap();
    for _ in 0..4 {
        assert!(stream.next().await.unwrap().is_some());
    }
    let err = stream.next().await.unwrap_err();
    assert!(matches!(err, HarvestError::CacheCorrupted(_)));
    assert!(err.is_corruption());
    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn recovered_cache_replays_the_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::new(tmp.path().join("cache")).unwrap();
    let connector = connector();
    fill(&connector, &cache, 5).await;

    cache.backup().unwrap();
    cache
        .store(&[CacheRecord::payload(b"not a page header".to_vec())])
        .unwrap();

    {
        let mut backend = Backend::new(connector.clone()).with_cache(cache.clone());
        let mut stream = backend.fetch_from_cache("issue", false).await.unwrap();
        assert!(stream.collect().await.is_err());
    }

    cache.recover().unwrap();
    let mut backend = Backend::new(connector).with_cache(cache);
    let mut stream = backend.fetch_from_cache("issue", false).await.unwrap();
    assert_eq!(stream.collect().await.unwrap().len(), 5);
}

#[tokio::test]
async fn empty_cache_yields_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::new(tmp.path().join("cache")).unwrap();

    let mut backend = Backend::new(connector()).with_cache(cache);
    let mut stream = backend.fetch_from_cache("issue", false).await.unwrap();
    assert!(stream.next().await.unwrap().is_none());
    assert_eq!(stream.summary().total(), 0);
}

#[tokio::test]
async fn cache_replay_checks_the_category() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::new(tmp.path().join("cache")).unwrap();

    let mut backend = Backend::new(connector()).with_cache(cache);
    assert!(matches!(
        backend.fetch_from_cache("commit", false).await,
        Err(HarvestError::Config(_))
    ));
}

#[tokio::test]
async fn cache_replay_redacts_classified_fields() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::new(tmp.path().join("cache")).unwrap();
    let connector = connector_with(json!({"classified_fields": ["title"]}));
    let live = fill(&connector, &cache, 3).await;
    assert!(live.iter().all(|r| r.get("title").is_some()));

    let mut backend = Backend::new(connector).with_cache(cache);
    let mut stream = backend.fetch_from_cache("issue", true).await.unwrap();
    let items = stream.collect().await.unwrap();
    assert_eq!(items.len(), 3);
    for item in &items {
        assert!(item.data.get("title").is_none());
        assert_eq!(item.classified_fields_filtered, Some(vec!["title".to_string()]));
    }
}

async fn flaky_tracker() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/issues"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "updated_at": 5001},
            {"id": 2, "updated_at": 5002},
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/issues"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn failed_fetch_leaves_the_cache_as_it_was() {
    let server = flaky_tracker().await;
    let earlier = vec![
        CacheRecord::payload(b"earlier run".to_vec()),
        CacheRecord::checkpoint(CheckpointKind::EndOfBatch),
    ];

    for clean_cache in [false, true] {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(tmp.path().join("cache")).unwrap();
        cache.store(&earlier).unwrap();

        let request = FetchRequest {
            connector_type: "http_json".to_string(),
            settings: json!({
                "url": format!("{}/api/issues", server.uri()),
                "per_page": 2,
                "max_retries": 0,
            }),
            cache: Some(cache.clone()),
            clean_cache,
            ..FetchRequest::default()
        };
        let mut generator =
            ItemsGenerator::fetch(&ConnectorRegistry::with_builtins(), request, None)
                .await
                .unwrap();

        assert!(generator.next().await.unwrap().is_some());
        // The first page is already in the cache.
        let expected_len = if clean_cache { 3 } else { earlier.len() + 3 };
        assert_eq!(cache.retrieve().unwrap().len(), expected_len);

        assert!(generator.next().await.unwrap().is_some());
        assert!(generator.next().await.is_err());
        assert_eq!(cache.retrieve().unwrap(), earlier);
    }
}
