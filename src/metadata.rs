//! Item envelope builder.
//!
//! Wraps a raw connector record into the canonical [`Item`] shape:
//! identity via [`fingerprint`], search-field extraction along dotted paths,
//! and optional redaction of classified fields. Missing search-field paths
//! and missing classified fields are never fatal: they are logged and the
//! affected sub-feature is left out.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};
use crate::fingerprint::fingerprint;
use crate::models::{datetime_to_epoch, FieldPath, Item, Record};
use crate::traits::Connector;

/// Name of the search field every item carries.
pub const DEFAULT_SEARCH_FIELD: &str = "item_id";

/// Version of this tool, stamped on every envelope.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Why a dotted path could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMiss {
    /// A key along the path does not exist.
    NotFound,
    /// The path is empty or points past the end of a list.
    Empty,
}

/// Build the envelope for one record.
///
/// `record` must already be redacted when `filter_classified` is set; the
/// flag only controls what `classified_fields_filtered` reports.
pub fn build_item(
    connector: &dyn Connector,
    tag: &str,
    record: Record,
    filter_classified: bool,
    offset: Option<i64>,
) -> Result<Item> {
    let item_id = connector.identify(&record)?;
    let uuid = fingerprint(&[connector.origin(), item_id.as_str()])?;

    let category = connector.classify(&record)?;
    if !connector.descriptor().has_category(&category) {
        return Err(HarvestError::Connector(format!(
            "{} category not declared by {}",
            category,
            connector.name()
        )));
    }

    let updated_on = connector.updated_at(&record)?;
    let search_fields = search_fields(connector, &record, &item_id, &uuid);

    let classified_fields_filtered = if filter_classified {
        Some(connector.descriptor().classified_fields())
    } else {
        None
    };

    Ok(Item {
        backend_name: connector.name().to_string(),
        backend_version: connector.version().to_string(),
        tool_version: TOOL_VERSION.to_string(),
        timestamp: datetime_to_epoch(&Utc::now()),
        origin: connector.origin().to_string(),
        uuid,
        updated_on,
        classified_fields_filtered,
        category,
        search_fields,
        tag: tag.to_string(),
        data: record,
        offset,
    })
}

/// Collect `item_id` plus the connector's extra search fields.
pub fn search_fields(
    connector: &dyn Connector,
    record: &Record,
    item_id: &str,
    item_uuid: &str,
) -> BTreeMap<String, Value> {
    debug!("Adding search fields to item {}", item_uuid);

    let mut fields = BTreeMap::new();
    fields.insert(
        DEFAULT_SEARCH_FIELD.to_string(),
        Value::String(item_id.to_string()),
    );

    for (name, path) in connector.descriptor().extra_search_fields() {
        match find_value(record, path) {
            Ok(value) => {
                fields.insert(name.clone(), value.clone());
            }
            Err(PathMiss::NotFound) => {
                warn!(
                    "Extra search field '{}' not found for item {}; field ignored",
                    name, item_uuid
                );
            }
            Err(PathMiss::Empty) => {
                warn!(
                    "Extra search field '{}' is empty {}; field ignored",
                    name, item_uuid
                );
            }
        }
    }

    fields
}

/// Remove every classified field declared by `connector` from `record`.
///
/// Paths traverse into lists by applying the rest of the path to each
/// element. Fields that are not present are logged and skipped.
pub fn filter_classified_data(connector: &dyn Connector, record: &mut Record) -> Result<()> {
    let item_uuid = fingerprint(&[connector.origin(), connector.identify(record)?.as_str()])?;

    debug!("Filtering classified data for item {}", item_uuid);

    for path in connector.descriptor().classified_paths() {
        let misses = remove_path(record, path.segments());
        if misses > 0 {
            debug!(
                "Classified field '{}' not found for item {} ({} occurrence(s)); field ignored",
                path, item_uuid, misses
            );
        }
    }

    debug!("Classified data filtered for item {}", item_uuid);
    Ok(())
}

/// Resolve a dotted path inside a record.
///
/// Numeric segments index into lists. A terminal lookup inside a null or
/// empty container yields `null` rather than a miss.
pub fn find_value<'a>(record: &'a Value, path: &FieldPath) -> std::result::Result<&'a Value, PathMiss> {
    static NULL: Value = Value::Null;

    let segments = path.segments();
    if segments.is_empty() {
        return Err(PathMiss::Empty);
    }

    let mut current = record;
    for (i, key) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        if last && is_falsy_container(current) {
            return Ok(&NULL);
        }
        current = step(current, key)?;
    }
    Ok(current)
}

fn is_falsy_container(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(list) => list.is_empty(),
        _ => false,
    }
}

fn step<'a>(value: &'a Value, key: &str) -> std::result::Result<&'a Value, PathMiss> {
    match value {
        Value::Object(map) => map.get(key).ok_or(PathMiss::NotFound),
        Value::Array(list) => {
            let idx: usize = key.parse().map_err(|_| PathMiss::NotFound)?;
            list.get(idx).ok_or(PathMiss::Empty)
        }
        _ => Err(PathMiss::NotFound),
    }
}

/// Remove the terminal key of `path` from `value`, fanning out over lists.
///
/// Returns how many times the path could not be followed.
pub fn remove_path(value: &mut Value, path: &[String]) -> usize {
    if path.is_empty() {
        return 0;
    }

    match value {
        Value::Array(list) => list.iter_mut().map(|v| remove_path(v, path)).sum(),
        Value::Object(map) => {
            let key = &path[0];
            if path.len() == 1 {
                usize::from(map.remove(key).is_none())
            } else {
                match map.get_mut(key) {
                    Some(child) => remove_path(child, &path[1..]),
                    None => 1,
                }
            }
        }
        _ => 1,
    }
}
