//! Core data models used throughout the harvesting pipeline.
//!
//! These types describe what connectors produce ([`Record`]), what the
//! pipeline emits ([`Item`]), what a fetch is parameterized by
//! ([`FetchParams`]) and the static per-connector configuration
//! ([`ConnectorDescriptor`]).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HarvestError, Result};

/// Raw record produced by a connector's retrieval loop.
///
/// Opaque to the core except through the connector hooks.
pub type Record = Value;

/// The canonical output unit.
///
/// Field names and the set of fields are fixed: downstream consumers parse
/// this shape bit-exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub backend_name: String,
    pub backend_version: String,
    pub tool_version: String,
    /// Envelope creation time, epoch seconds.
    pub timestamp: f64,
    pub origin: String,
    pub uuid: String,
    /// Source-defined update time, epoch seconds.
    pub updated_on: f64,
    pub classified_fields_filtered: Option<Vec<String>>,
    pub category: String,
    pub search_fields: BTreeMap<String, Value>,
    pub tag: String,
    pub data: Record,
    /// Numeric cursor of the record for offset-based connectors. Tracked by
    /// the run summary, never serialized.
    #[serde(skip)]
    pub offset: Option<i64>,
}

/// A dotted path into a raw record, e.g. `fields.project.id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a period-delimited path. An empty string yields an empty path.
    pub fn parse(dotted: &str) -> Self {
        if dotted.is_empty() {
            return Self(Vec::new());
        }
        Self(dotted.split('.').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn dotted(&self) -> String {
        self.0.join(".")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted())
    }
}

impl From<&str> for FieldPath {
    fn from(dotted: &str) -> Self {
        FieldPath::parse(dotted)
    }
}

/// Value type of an origin-unique field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Str,
    Int,
}

/// A field whose value is unique within one origin, used for block-listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginUniqueField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
}

impl OriginUniqueField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Immutable, per-instance configuration of a connector.
///
/// Built once when a connector is constructed; the core reads it but never
/// mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorDescriptor {
    categories: Vec<String>,
    classified_fields: Vec<FieldPath>,
    extra_search_fields: BTreeMap<String, FieldPath>,
    origin_unique_field: Option<OriginUniqueField>,
    archiving: bool,
    resuming: bool,
}

impl ConnectorDescriptor {
    /// Start a descriptor for a connector producing `categories`. The first
    /// category is the default one.
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            classified_fields: Vec::new(),
            extra_search_fields: BTreeMap::new(),
            origin_unique_field: None,
            archiving: false,
            resuming: false,
        }
    }

    pub fn classified_field(mut self, path: impl Into<FieldPath>) -> Self {
        self.classified_fields.push(path.into());
        self
    }

    pub fn search_field(mut self, name: impl Into<String>, path: impl Into<FieldPath>) -> Self {
        self.extra_search_fields.insert(name.into(), path.into());
        self
    }

    pub fn origin_unique_field(mut self, field: OriginUniqueField) -> Self {
        self.origin_unique_field = Some(field);
        self
    }

    pub fn archiving(mut self, enabled: bool) -> Self {
        self.archiving = enabled;
        self
    }

    pub fn resuming(mut self, enabled: bool) -> Self {
        self.resuming = enabled;
        self
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    pub fn default_category(&self) -> Option<&str> {
        self.categories.first().map(String::as_str)
    }

    pub fn classified_paths(&self) -> &[FieldPath] {
        &self.classified_fields
    }

    /// Classified fields as period-delimited strings, as reported in
    /// `classified_fields_filtered`.
    pub fn classified_fields(&self) -> Vec<String> {
        self.classified_fields.iter().map(FieldPath::dotted).collect()
    }

    pub fn extra_search_fields(&self) -> &BTreeMap<String, FieldPath> {
        &self.extra_search_fields
    }

    pub fn unique_field(&self) -> Option<&OriginUniqueField> {
        self.origin_unique_field.as_ref()
    }

    pub fn has_archiving(&self) -> bool {
        self.archiving
    }

    pub fn has_resuming(&self) -> bool {
        self.resuming
    }
}

/// Parameters of one fetch, besides the category.
///
/// Well-known keys are `from_date` (inclusive, RFC 3339), `to_date`
/// (exclusive, RFC 3339) and `offset`; connectors may define more. The whole
/// map is persisted as the archive tag, so replays see exactly the values
/// the live fetch saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchParams(BTreeMap<String, Value>);

impl FetchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn with_from_date(self, from: DateTime<Utc>) -> Self {
        self.with("from_date", from.to_rfc3339())
    }

    pub fn with_to_date(self, to: DateTime<Utc>) -> Self {
        self.with("to_date", to.to_rfc3339())
    }

    pub fn with_offset(self, offset: i64) -> Self {
        self.with("offset", offset)
    }

    pub fn from_date(&self) -> Result<Option<DateTime<Utc>>> {
        self.date("from_date")
    }

    pub fn to_date(&self) -> Result<Option<DateTime<Utc>>> {
        self.date("to_date")
    }

    pub fn offset(&self) -> Result<Option<i64>> {
        match self.0.get("offset") {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .filter(|o| *o >= 0)
                .map(Some)
                .ok_or_else(|| HarvestError::Config(format!("offset {} is not valid", v))),
        }
    }

    fn date(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => parse_datetime(s).map(Some),
            Some(v) => Err(HarvestError::Config(format!("{} is not a valid date", v))),
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }
}

/// Parse RFC 3339 or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| HarvestError::Config(format!("{} is not a valid date", s)))
}

/// Convert epoch seconds (possibly fractional) to a UTC datetime.
pub fn epoch_to_datetime(ts: f64) -> Option<DateTime<Utc>> {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}

/// Convert a UTC datetime to epoch seconds.
pub fn datetime_to_epoch(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6
}
