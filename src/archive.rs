//! Archive of raw fetch traffic.
//!
//! An archive is one SQLite file holding every response obtained by a single
//! fetch, keyed by a hash of the request that produced it, plus one
//! metadata row tagging the fetch (origin, connector, category, params).
//! Replaying an archive feeds the same bytes back to the connector, so the
//! replay yields the same items without network access.
//!
//! The metadata row is written before the first entry: an archive whose
//! metadata is missing was never used.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::client::Request;
use crate::db;
use crate::error::{HarvestError, Result};
use crate::fingerprint::fingerprint;
use crate::migrate;
use crate::models::{datetime_to_epoch, parse_datetime, FetchParams};

const ARCHIVE_EXTENSION: &str = "sqlite3";

/// Tag of the fetch that filled an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveMetadata {
    pub origin: String,
    pub backend_name: String,
    pub backend_version: String,
    pub category: String,
    pub backend_params: FetchParams,
    pub created_on: DateTime<Utc>,
}

/// A single archive file.
///
/// Cloning shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    pool: SqlitePool,
    metadata: Option<ArchiveMetadata>,
}

impl Archive {
    /// Create a new, empty archive. Fails if `path` already exists.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Err(HarvestError::Archive(format!(
                "archive {} already exists",
                path.display()
            )));
        }

        let pool = db::connect(&path, true).await?;
        migrate::create_schema(&pool).await?;
        debug!("Creating archive {}", path.display());

        Ok(Self {
            path,
            pool,
            metadata: None,
        })
    }

    /// Open an existing archive and load its metadata.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(HarvestError::Archive(format!(
                "archive {} does not exist",
                path.display()
            )));
        }

        let invalid = || HarvestError::Archive(format!("invalid archive file {}", path.display()));
        let pool = db::connect(&path, false).await.map_err(|_| invalid())?;

        match migrate::has_schema(&pool).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                pool.close().await;
                return Err(invalid());
            }
        }

        let mut archive = Self {
            path,
            pool,
            metadata: None,
        };
        archive.metadata = archive.load_metadata().await?;
        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Option<&ArchiveMetadata> {
        self.metadata.as_ref()
    }

    /// Tag the archive with the fetch it is about to store.
    pub async fn init_metadata(
        &mut self,
        origin: &str,
        backend_name: &str,
        backend_version: &str,
        category: &str,
        backend_params: &FetchParams,
    ) -> Result<()> {
        if self.metadata.is_some() {
            return Err(HarvestError::Archive(format!(
                "metadata of archive {} already initialized",
                self.path.display()
            )));
        }

        let created_on = Utc::now();
        let params_json = serde_json::to_string(backend_params)?;

        sqlx::query(
            "INSERT INTO metadata (origin, backend_name, backend_version, category, backend_params, created_on)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(origin)
        .bind(backend_name)
        .bind(backend_version)
        .bind(category)
        .bind(&params_json)
        .bind(created_on.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            "Metadata of archive {} initialized to {}/{}/{}",
            self.path.display(),
            origin,
            backend_name,
            category
        );

        self.metadata = Some(ArchiveMetadata {
            origin: origin.to_string(),
            backend_name: backend_name.to_string(),
            backend_version: backend_version.to_string(),
            category: category.to_string(),
            backend_params: backend_params.clone(),
            created_on,
        });
        Ok(())
    }

    /// Store the raw response obtained for `request`.
    pub async fn store(&self, request: &Request, data: &[u8]) -> Result<()> {
        let hashcode = make_hashcode(request)?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM archive WHERE hashcode = ?")
            .bind(&hashcode)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            return Err(HarvestError::Archive(format!(
                "duplicated entry {} in archive {}",
                hashcode,
                self.path.display()
            )));
        }

        sqlx::query(
            "INSERT INTO archive (hashcode, uri, payload, headers, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&hashcode)
        .bind(&request.uri)
        .bind(serde_json::to_string(&request.params)?)
        .bind(serde_json::to_string(&request.headers)?)
        .bind(data)
        .bind(datetime_to_epoch(&Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!("Archived entry {} for {}", hashcode, request.uri);
        Ok(())
    }

    /// Return the response stored for `request`.
    pub async fn retrieve(&self, request: &Request) -> Result<Vec<u8>> {
        let hashcode = make_hashcode(request)?;

        let row: Option<Vec<u8>> = sqlx::query_scalar("SELECT data FROM archive WHERE hashcode = ?")
            .bind(&hashcode)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| {
            HarvestError::ArchiveCorrupted(format!(
                "entry {} for {} not found in archive {}",
                hashcode,
                request.uri,
                self.path.display()
            ))
        })
    }

    /// Number of stored entries.
    pub async fn len(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archive")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn load_metadata(&self) -> Result<Option<ArchiveMetadata>> {
        let row: Option<(String, String, String, String, String, String)> = sqlx::query_as(
            "SELECT origin, backend_name, backend_version, category, backend_params, created_on
             FROM metadata LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((origin, backend_name, backend_version, category, params, created_on)) = row else {
            return Ok(None);
        };

        let backend_params: FetchParams = serde_json::from_str(&params).map_err(|e| {
            HarvestError::Archive(format!(
                "invalid metadata in archive {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let created_on = parse_datetime(&created_on).map_err(|e| {
            HarvestError::Archive(format!(
                "invalid metadata in archive {}: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(Some(ArchiveMetadata {
            origin,
            backend_name,
            backend_version,
            category,
            backend_params,
            created_on,
        }))
    }
}

/// Key of an archived request: SHA-1 of its URI, parameters and headers.
///
/// Parameters and headers are ordered maps, so the key does not depend on
/// the order they were set in.
pub fn make_hashcode(request: &Request) -> Result<String> {
    let params = serde_json::to_string(&request.params)?;
    let headers = serde_json::to_string(&request.headers)?;
    fingerprint(&[request.uri.as_str(), params.as_str(), headers.as_str()])
}

/// Criteria for [`ArchiveManager::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    pub origin: Option<String>,
    pub backend_name: Option<String>,
    pub category: Option<String>,
    pub archived_after: Option<DateTime<Utc>>,
}

impl ArchiveFilter {
    fn matches(&self, metadata: &ArchiveMetadata) -> bool {
        let eq = |want: &Option<String>, got: &str| want.as_deref().map_or(true, |w| w == got);

        eq(&self.origin, &metadata.origin)
            && eq(&self.backend_name, &metadata.backend_name)
            && eq(&self.category, &metadata.category)
            && self
                .archived_after
                .map_or(true, |after| metadata.created_on >= after)
    }
}

/// A directory of archives.
#[derive(Debug, Clone)]
pub struct ArchiveManager {
    dirpath: PathBuf,
}

impl ArchiveManager {
    /// Use `dirpath` as the archive store, creating it if needed.
    pub fn new(dirpath: impl Into<PathBuf>) -> Result<Self> {
        let dirpath = dirpath.into();
        std::fs::create_dir_all(&dirpath)?;
        Ok(Self { dirpath })
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    /// Create a new archive with a random name.
    pub async fn create_archive(&self) -> Result<Archive> {
        let hashcode = uuid::Uuid::new_v4().simple().to_string();
        let (dir, file) = hashcode.split_at(2);
        let path = self
            .dirpath
            .join(dir)
            .join(format!("{}.{}", file, ARCHIVE_EXTENSION));
        Archive::create(path).await
    }

    /// Delete an archive file.
    pub fn remove_archive(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(HarvestError::Archive(format!(
                "archive {} does not exist",
                path.display()
            )));
        }
        std::fs::remove_file(path)?;
        debug!("Archive {} removed", path.display());
        Ok(())
    }

    /// Paths of the archives matching every given criterion, oldest first.
    pub async fn search(
        &self,
        origin: &str,
        backend_name: &str,
        category: &str,
        archived_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PathBuf>> {
        let filter = ArchiveFilter {
            origin: Some(origin.to_string()),
            backend_name: Some(backend_name.to_string()),
            category: Some(category.to_string()),
            archived_after,
        };
        Ok(self
            .list(&filter)
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .collect())
    }

    /// Archives matching `filter` with their metadata, oldest first.
    ///
    /// Files that cannot be opened as archives, and archives that were never
    /// tagged, are skipped.
    pub async fn list(&self, filter: &ArchiveFilter) -> Result<Vec<(PathBuf, ArchiveMetadata)>> {
        let mut found = Vec::new();

        for path in self.archive_files() {
            let archive = match Archive::open(&path).await {
                Ok(archive) => archive,
                Err(e) => {
                    warn!("Ignoring archive {}: {}", path.display(), e);
                    continue;
                }
            };

            let metadata = archive.metadata().cloned();
            archive.close().await;

            match metadata {
                Some(metadata) if filter.matches(&metadata) => found.push((path, metadata)),
                Some(_) => {}
                None => debug!("Archive {} has no metadata; skipped", path.display()),
            }
        }

        found.sort_by(|a, b| a.1.created_on.cmp(&b.1.created_on).then_with(|| a.0.cmp(&b.0)));
        Ok(found)
    }

    fn archive_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.dirpath)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .map_or(false, |ext| ext == ARCHIVE_EXTENSION)
            })
            .map(|e| e.into_path())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(uri: &str, page: &str) -> Request {
        let mut params = BTreeMap::new();
        params.insert("page".to_string(), page.to_string());
        Request {
            uri: uri.to_string(),
            params,
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn hashcode_is_stable() {
        let a = make_hashcode(&request("http://example.com/", "1")).unwrap();
        let b = make_hashcode(&request("http://example.com/", "1")).unwrap();
        let c = make_hashcode(&request("http://example.com/", "2")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn create_refuses_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.sqlite3");
        let archive = Archive::create(&path).await.unwrap();
        archive.close().await;

        let err = Archive::create(&path).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn open_rejects_missing_and_invalid_files() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing.sqlite3");
        let err = Archive::open(&missing).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let bogus = tmp.path().join("bogus.sqlite3");
        std::fs::write(&bogus, b"this is not a database at all, just some text").unwrap();
        let err = Archive::open(&bogus).await.unwrap_err();
        assert!(err.to_string().contains("invalid archive file"));
    }

    #[tokio::test]
    async fn store_and_retrieve() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.sqlite3");
        let mut archive = Archive::create(&path).await.unwrap();
        archive
            .init_metadata("http://example.com/", "http_json", "0.1.0", "issue", &FetchParams::new())
            .await
            .unwrap();

        let req = request("http://example.com/", "1");
        archive.store(&req, b"{\"items\": []}").await.unwrap();
        assert_eq!(archive.retrieve(&req).await.unwrap(), b"{\"items\": []}".to_vec());
        assert_eq!(archive.len().await.unwrap(), 1);

        let err = archive.store(&req, b"again").await.unwrap_err();
        assert!(err.to_string().contains("duplicated entry"));

        let err = archive
            .retrieve(&request("http://example.com/", "2"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::ArchiveCorrupted(_)));
        archive.close().await;
    }

    #[tokio::test]
    async fn metadata_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.sqlite3");
        let params = FetchParams::new().with("from_date", "2020-01-01T00:00:00+00:00");

        let mut archive = Archive::create(&path).await.unwrap();
        archive
            .init_metadata("origin", "backend", "1.0", "cat", &params)
            .await
            .unwrap();
        assert!(archive
            .init_metadata("origin", "backend", "1.0", "cat", &params)
            .await
            .is_err());
        archive.close().await;

        let archive = Archive::open(&path).await.unwrap();
        let metadata = archive.metadata().unwrap();
        assert_eq!(metadata.origin, "origin");
        assert_eq!(metadata.category, "cat");
        assert_eq!(metadata.backend_params, params);
        archive.close().await;
    }

    #[tokio::test]
    async fn manager_search_filters_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = ArchiveManager::new(tmp.path().join("archives")).unwrap();

        let mut first = manager.create_archive().await.unwrap();
        first
            .init_metadata("o", "b", "1", "issue", &FetchParams::new())
            .await
            .unwrap();
        let first_path = first.path().to_path_buf();
        first.close().await;

        let mut other = manager.create_archive().await.unwrap();
        other
            .init_metadata("o", "b", "1", "pull_request", &FetchParams::new())
            .await
            .unwrap();
        other.close().await;

        // Never tagged
        manager.create_archive().await.unwrap().close().await;

        let mut second = manager.create_archive().await.unwrap();
        second
            .init_metadata("o", "b", "1", "issue", &FetchParams::new())
            .await
            .unwrap();
        let second_path = second.path().to_path_buf();
        second.close().await;

        std::fs::write(manager.dirpath().join("junk.sqlite3"), b"garbage").unwrap();

        let found = manager.search("o", "b", "issue", None).await.unwrap();
        assert_eq!(found, vec![first_path.clone(), second_path]);

        let none = manager
            .search("o", "b", "issue", Some(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert!(none.is_empty());

        manager.remove_archive(&first_path).unwrap();
        assert_eq!(manager.search("o", "b", "issue", None).await.unwrap().len(), 1);
        assert!(manager.remove_archive(&first_path).is_err());
    }

    #[tokio::test]
    async fn archive_names_are_sharded() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = ArchiveManager::new(tmp.path()).unwrap();
        let archive = manager.create_archive().await.unwrap();
        let path = archive.path().to_path_buf();
        archive.close().await;

        let parent = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        let stem = path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(parent.len(), 2);
        assert_eq!(stem.len(), 30);
        assert_eq!(path.extension().unwrap(), "sqlite3");
    }
}
