//! Run summary.
//!
//! Every fetch keeps a [`Summary`] of what it produced: how many items were
//! emitted or skipped, the range of update times it saw and, for
//! offset-based connectors, the range of offsets. The summary of a finished
//! fetch tells the caller where to resume from.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{epoch_to_datetime, Item};

/// Aggregate statistics of one fetch (or of several merged replays).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub fetched: u64,
    pub skipped: u64,
    pub last_uuid: Option<String>,
    pub min_updated_on: Option<DateTime<Utc>>,
    pub max_updated_on: Option<DateTime<Utc>>,
    pub last_updated_on: Option<DateTime<Utc>>,
    pub min_offset: Option<i64>,
    pub max_offset: Option<i64>,
    pub last_offset: Option<i64>,
    /// Connector-specific figures.
    pub extras: Option<Value>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items seen, emitted or not.
    pub fn total(&self) -> u64 {
        self.fetched + self.skipped
    }

    /// Account for an emitted item.
    pub fn update(&mut self, item: &Item) {
        self.fetched += 1;
        self.last_uuid = Some(item.uuid.clone());

        if let Some(updated_on) = epoch_to_datetime(item.updated_on) {
            self.last_updated_on = Some(updated_on);
            self.min_updated_on = Some(match self.min_updated_on {
                Some(min) => min.min(updated_on),
                None => updated_on,
            });
            self.max_updated_on = Some(match self.max_updated_on {
                Some(max) => max.max(updated_on),
                None => updated_on,
            });
        }

        if let Some(offset) = item.offset {
            self.last_offset = Some(offset);
            self.min_offset = Some(self.min_offset.map_or(offset, |m| m.min(offset)));
            self.max_offset = Some(self.max_offset.map_or(offset, |m| m.max(offset)));
        }
    }

    /// Account for a record that was dropped.
    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    /// Fold `other` into this summary as if its items came afterwards.
    pub fn merge(&mut self, other: &Summary) {
        self.fetched += other.fetched;
        self.skipped += other.skipped;

        if other.last_uuid.is_some() {
            self.last_uuid = other.last_uuid.clone();
        }
        if other.last_updated_on.is_some() {
            self.last_updated_on = other.last_updated_on;
        }
        if other.last_offset.is_some() {
            self.last_offset = other.last_offset;
        }

        self.min_updated_on = min_opt(self.min_updated_on, other.min_updated_on);
        self.max_updated_on = max_opt(self.max_updated_on, other.max_updated_on);
        self.min_offset = min_opt(self.min_offset, other.min_offset);
        self.max_offset = max_opt(self.max_offset, other.max_offset);

        if other.extras.is_some() {
            self.extras = other.extras.clone();
        }
    }
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn or_dash<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary of results")?;
        writeln!(f)?;
        writeln!(f, "  Total items:        {}", self.total())?;
        writeln!(f, "  Items fetched:      {}", self.fetched)?;
        writeln!(f, "  Items skipped:      {}", self.skipped)?;
        writeln!(f)?;
        writeln!(f, "  Last item UUID:     {}", or_dash(&self.last_uuid))?;
        writeln!(f, "  Min. updated on:    {}", or_dash(&self.min_updated_on))?;
        writeln!(f, "  Max. updated on:    {}", or_dash(&self.max_updated_on))?;
        writeln!(f, "  Last updated on:    {}", or_dash(&self.last_updated_on))?;
        if self.last_offset.is_some() {
            writeln!(f)?;
            writeln!(f, "  Min. offset:        {}", or_dash(&self.min_offset))?;
            writeln!(f, "  Max. offset:        {}", or_dash(&self.max_offset))?;
            writeln!(f, "  Last offset:        {}", or_dash(&self.last_offset))?;
        }
        if let Some(extras) = &self.extras {
            writeln!(f)?;
            writeln!(f, "  Extras:             {}", extras)?;
        }
        Ok(())
    }
}
