//! Fetch orchestration.
//!
//! [`ItemsGenerator`] decides between a live fetch and a replay of stored
//! archives and keeps archives consistent with the outcome:
//!
//! - **live**: an archive is created only when a manager is given and the
//!   connector supports archiving. If the fetch fails at any point the
//!   archive is removed before the error is returned, so no partial archive
//!   is ever left behind. A bound cache is backed up (or cleaned) before the
//!   fetch starts and recovered from that backup when it fails.
//! - **replay**: every archive matching the connector's origin, name and
//!   category (optionally created after a given instant) is replayed in
//!   creation order. Archives that turn out to be corrupted are skipped with
//!   a warning.
//!
//! The `run_*` functions implement the `harvest` subcommands on top of it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::archive::{Archive, ArchiveFilter, ArchiveManager};
use crate::backend::{Backend, ItemStream};
use crate::cache::Cache;
use crate::config::{parse_label, Config};
use crate::error::{HarvestError, Result};
use crate::models::{parse_datetime, FetchParams, Item};
use crate::output::ItemWriter;
use crate::progress::{FetchProgressEvent, FetchProgressReporter, REPORT_EVERY};
use crate::summary::Summary;
use crate::traits::{Connector, ConnectorRegistry};

/// What to fetch and how.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub connector_type: String,
    /// Settings table passed to the connector constructor.
    pub settings: Value,
    /// Defaults to the connector's first category.
    pub category: Option<String>,
    pub params: FetchParams,
    pub tag: Option<String>,
    pub filter_classified: bool,
    pub blacklist_ids: Vec<String>,
    pub cache: Option<Cache>,
    /// Rebuild items from `cache` instead of the source.
    pub from_cache: bool,
    /// Empty `cache` before fetching instead of just backing it up.
    pub clean_cache: bool,
}

struct LiveArchive {
    manager: ArchiveManager,
    archive: Archive,
}

enum Mode {
    Live {
        stream: ItemStream,
        archive: Option<LiveArchive>,
        /// Restored from its backup if the fetch fails.
        cache: Option<Cache>,
    },
    Replay {
        connector: Arc<dyn Connector>,
        tag: Option<String>,
        blacklist_ids: Vec<String>,
        filter_classified: bool,
        pending: VecDeque<PathBuf>,
        current: Option<(PathBuf, ItemStream)>,
        done: Summary,
    },
    Finished(Summary),
}

/// Owned, single-pass source of items for one fetch request.
pub struct ItemsGenerator {
    category: String,
    mode: Mode,
}

impl ItemsGenerator {
    /// Fetch items from the source described by `request`.
    pub async fn fetch(
        registry: &ConnectorRegistry,
        request: FetchRequest,
        manager: Option<&ArchiveManager>,
    ) -> Result<Self> {
        let connector: Arc<dyn Connector> =
            Arc::from(registry.build(&request.connector_type, &request.settings)?);
        let category = resolve_category(connector.as_ref(), request.category.as_deref())?;

        let mut backend = Backend::new(connector.clone())
            .with_tag(request.tag.clone())
            .with_blocklist(&request.blacklist_ids)?;
        if let Some(cache) = &request.cache {
            if request.clean_cache {
                cache.clean(false)?;
            } else {
                cache.backup()?;
            }
            backend = backend.with_cache(cache.clone());
        }

        if request.from_cache {
            let stream = backend
                .fetch_from_cache(&category, request.filter_classified)
                .await?;
            return Ok(Self {
                category,
                mode: Mode::Live {
                    stream,
                    archive: None,
                    cache: None,
                },
            });
        }

        let archive = match manager {
            Some(manager) if connector.descriptor().has_archiving() => Some(LiveArchive {
                manager: manager.clone(),
                archive: manager.create_archive().await?,
            }),
            _ => None,
        };

        if let Some(live) = &archive {
            backend = backend.with_archive(live.archive.clone())?;
        }

        match backend
            .fetch(&category, request.filter_classified, request.params.clone())
            .await
        {
            Ok(stream) => Ok(Self {
                category,
                mode: Mode::Live {
                    stream,
                    archive,
                    cache: request.cache,
                },
            }),
            Err(e) => {
                if let Some(live) = archive {
                    discard(live).await;
                }
                if let Some(cache) = &request.cache {
                    restore(cache);
                }
                Err(e)
            }
        }
    }

    /// Replay every archive stored for the source described by `request`.
    pub async fn fetch_from_archive(
        registry: &ConnectorRegistry,
        request: FetchRequest,
        manager: &ArchiveManager,
        archived_after: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let connector: Arc<dyn Connector> =
            Arc::from(registry.build(&request.connector_type, &request.settings)?);
        if !connector.descriptor().has_archiving() {
            return Err(HarvestError::Config(format!(
                "{} does not support archiving",
                connector.name()
            )));
        }
        let category = resolve_category(connector.as_ref(), request.category.as_deref())?;

        let pending: VecDeque<PathBuf> = manager
            .search(connector.origin(), connector.name(), &category, archived_after)
            .await?
            .into();
        info!(
            "{} archive(s) found for {} {} items",
            pending.len(),
            connector.origin(),
            category
        );

        Ok(Self {
            category,
            mode: Mode::Replay {
                connector,
                tag: request.tag,
                blacklist_ids: request.blacklist_ids,
                filter_classified: request.filter_classified,
                pending,
                current: None,
                done: Summary::new(),
            },
        })
    }

    /// Pull the next item. `Ok(None)` once every source is exhausted.
    pub async fn next(&mut self) -> Result<Option<Item>> {
        let pulled = match &mut self.mode {
            Mode::Live { stream, .. } => stream.next().await,
            Mode::Replay { .. } => return self.next_replayed().await,
            Mode::Finished(_) => return Ok(None),
        };

        match pulled {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(e) => {
                self.fail().await;
                Err(e)
            }
        }
    }

    async fn next_replayed(&mut self) -> Result<Option<Item>> {
        let Mode::Replay {
            connector,
            tag,
            blacklist_ids,
            filter_classified,
            pending,
            current,
            done,
        } = &mut self.mode
        else {
            return Ok(None);
        };

        loop {
            if let Some((path, stream)) = current {
                match stream.next().await {
                    Ok(Some(item)) => return Ok(Some(item)),
                    Ok(None) => {
                        done.merge(stream.summary());
                        *current = None;
                    }
                    Err(e) if e.is_corruption() => {
                        warn!("Ignoring corrupted archive {}: {}", path.display(), e);
                        done.merge(stream.summary());
                        *current = None;
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            let Some(path) = pending.pop_front() else {
                let summary = std::mem::take(done);
                self.mode = Mode::Finished(summary);
                return Ok(None);
            };

            let archive = match Archive::open(&path).await {
                Ok(archive) => archive,
                Err(e) => {
                    warn!("Ignoring archive {}: {}", path.display(), e);
                    continue;
                }
            };

            let mut backend = Backend::new(connector.clone())
                .with_tag(tag.clone())
                .with_blocklist(blacklist_ids.iter())?
                .with_archive(archive)?;

            match backend.fetch_from_archive(*filter_classified).await {
                Ok(stream) => *current = Some((path, stream)),
                Err(e) if e.is_corruption() => {
                    warn!("Ignoring corrupted archive {}: {}", path.display(), e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Category being fetched, after defaulting.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Summary of everything produced so far.
    pub fn summary(&self) -> Summary {
        match &self.mode {
            Mode::Live { stream, .. } => stream.summary().clone(),
            Mode::Replay { current, done, .. } => {
                let mut summary = done.clone();
                if let Some((_, stream)) = current {
                    summary.merge(stream.summary());
                }
                summary
            }
            Mode::Finished(summary) => summary.clone(),
        }
    }

    /// Drain every item into a vector.
    pub async fn collect(&mut self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    fn finish(&mut self) {
        let summary = self.summary();
        if let Mode::Live {
            archive: Some(live),
            ..
        } = &self.mode
        {
            info!("Items archived in {}", live.archive.path().display());
        }
        self.mode = Mode::Finished(summary);
    }

    async fn fail(&mut self) {
        let summary = self.summary();
        if let Mode::Live { archive, cache, .. } = &mut self.mode {
            if let Some(live) = archive.take() {
                discard(live).await;
            }
            if let Some(cache) = cache.take() {
                restore(&cache);
            }
        }
        self.mode = Mode::Finished(summary);
    }
}

fn restore(cache: &Cache) {
    match cache.recover() {
        Ok(()) => info!("Cache {} recovered after a failed fetch", cache.path().display()),
        Err(e) => warn!("Failed to recover cache {}: {}", cache.path().display(), e),
    }
}

async fn discard(live: LiveArchive) {
    let path = live.archive.path().to_path_buf();
    live.archive.close().await;
    match live.manager.remove_archive(&path) {
        Ok(()) => info!("Archive {} removed after a failed fetch", path.display()),
        Err(e) => warn!("Failed to remove archive {}: {}", path.display(), e),
    }
}

fn resolve_category(connector: &dyn Connector, category: Option<&str>) -> Result<String> {
    match category {
        Some(category) => Ok(category.to_string()),
        None => connector
            .descriptor()
            .default_category()
            .map(str::to_string)
            .ok_or_else(|| {
                HarvestError::Config(format!("{} declares no categories", connector.name()))
            }),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// CLI commands
// ═══════════════════════════════════════════════════════════════════════

/// Options of `harvest fetch`.
#[derive(Debug, Clone, Default)]
pub struct FetchArgs {
    pub label: String,
    pub category: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub offset: Option<i64>,
    pub tag: Option<String>,
    pub filter_classified: bool,
    pub blacklist_ids: Vec<String>,
    pub no_archive: bool,
    pub fetch_archive: bool,
    pub archived_since: Option<String>,
    pub fetch_cache: bool,
    pub clean_cache: bool,
    pub output: Option<PathBuf>,
    pub json_line: bool,
}

pub async fn run_fetch(
    config: &Config,
    registry: &ConnectorRegistry,
    args: &FetchArgs,
    progress: &dyn FetchProgressReporter,
) -> anyhow::Result<Summary> {
    if args.fetch_archive && args.no_archive {
        bail!("--fetch-archive and --no-archive are not compatible");
    }
    if args.fetch_archive && args.fetch_cache {
        bail!("--fetch-archive and --fetch-cache are not compatible");
    }

    let (connector_type, name) = parse_label(&args.label)?;
    let settings = config.connector_settings(connector_type, name)?.clone();

    let mut params = FetchParams::new();
    if let Some(from) = &args.from_date {
        params = params.with_from_date(parse_datetime(from)?);
    }
    if let Some(to) = &args.to_date {
        params = params.with_to_date(parse_datetime(to)?);
    }
    if let Some(offset) = args.offset {
        params = params.with_offset(offset);
    }

    let cache = match config.cache_dir(connector_type, name) {
        Some(dir) => Some(Cache::new(dir)?),
        None => None,
    };
    if args.fetch_cache && cache.is_none() {
        bail!("--fetch-cache requires [cache] path to be configured");
    }

    let request = FetchRequest {
        connector_type: connector_type.to_string(),
        settings,
        category: args.category.clone(),
        params,
        tag: args.tag.clone(),
        filter_classified: args.filter_classified,
        blacklist_ids: args.blacklist_ids.clone(),
        cache,
        from_cache: args.fetch_cache,
        clean_cache: args.clean_cache,
    };

    let manager = if config.archive.enabled && !args.no_archive {
        Some(ArchiveManager::new(config.archive_dir())?)
    } else {
        None
    };

    let mut generator = if args.fetch_archive {
        let manager = manager
            .as_ref()
            .context("--fetch-archive requires archiving to be enabled")?;
        let archived_after = args
            .archived_since
            .as_deref()
            .map(parse_datetime)
            .transpose()?;
        ItemsGenerator::fetch_from_archive(registry, request, manager, archived_after).await?
    } else {
        ItemsGenerator::fetch(registry, request, manager.as_ref()).await?
    };

    progress.report(FetchProgressEvent::Started {
        connector: args.label.clone(),
        category: generator.category().to_string(),
    });

    let mut writer = ItemWriter::open(args.output.as_deref(), args.json_line || config.output.json_line)?;
    while let Some(item) = generator.next().await? {
        writer.write(&item)?;
        if writer.written() % REPORT_EVERY == 0 {
            let summary = generator.summary();
            progress.report(FetchProgressEvent::Fetching {
                connector: args.label.clone(),
                fetched: summary.fetched,
                skipped: summary.skipped,
            });
        }
    }
    writer.finish()?;

    let summary = generator.summary();
    progress.report(FetchProgressEvent::Finished {
        connector: args.label.clone(),
        fetched: summary.fetched,
        skipped: summary.skipped,
    });
    info!("{}", summary);

    Ok(summary)
}

/// `harvest archives list`.
pub async fn run_list_archives(config: &Config, filter: &ArchiveFilter) -> anyhow::Result<()> {
    let manager = ArchiveManager::new(config.archive_dir())?;
    let archives = manager.list(filter).await?;

    println!(
        "{:<27} {:<12} {:<12} {:<40} PATH",
        "CREATED", "BACKEND", "CATEGORY", "ORIGIN"
    );
    for (path, metadata) in &archives {
        println!(
            "{:<27} {:<12} {:<12} {:<40} {}",
            metadata.created_on.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            metadata.backend_name,
            metadata.category,
            metadata.origin,
            path.display()
        );
    }
    eprintln!("{} archive(s)", archives.len());
    Ok(())
}

/// `harvest archives remove`.
pub fn run_remove_archive(config: &Config, path: &Path) -> anyhow::Result<()> {
    let manager = ArchiveManager::new(config.archive_dir())?;
    manager.remove_archive(path)?;
    eprintln!("Removed {}", path.display());
    Ok(())
}

/// Maintenance action on a connector's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    Backup,
    Recover,
    Clean { erase: bool },
}

/// `harvest cache backup|recover|clean`.
pub fn run_cache(config: &Config, label: &str, action: CacheAction) -> anyhow::Result<()> {
    let (connector_type, name) = parse_label(label)?;
    config.connector_settings(connector_type, name)?;
    let dir = config
        .cache_dir(connector_type, name)
        .context("No [cache] path configured")?;
    let cache = Cache::new(&dir)?;

    match action {
        CacheAction::Backup => cache.backup()?,
        CacheAction::Recover => cache.recover()?,
        CacheAction::Clean { erase } => cache.clean(erase)?,
    }
    eprintln!("Cache {} for {}: {:?} done", dir.display(), label, action);
    Ok(())
}
