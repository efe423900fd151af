//! Incremental resumption.
//!
//! Two ways to continue a previous fetch:
//!
//! - by date: a [`Watermark`] remembers the newest update time seen and the
//!   items that carried exactly that time. The next fetch starts at that
//!   instant (inclusive) and drops the boundary items it already produced,
//!   so nothing is lost to second-granularity ties and nothing repeats.
//! - by offset: an [`OffsetCursor`] maps an absolute item offset to a page
//!   and a position inside it, for any page size.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::models::{epoch_to_datetime, FetchParams, Item};

/// Resumption point of a date-ordered fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Watermark {
    from_date: Option<DateTime<Utc>>,
    boundary: BTreeSet<String>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at `from_date` with no known boundary items.
    pub fn starting_at(from_date: DateTime<Utc>) -> Self {
        Self {
            from_date: Some(from_date),
            boundary: BTreeSet::new(),
        }
    }

    pub fn from_date(&self) -> Option<DateTime<Utc>> {
        self.from_date
    }

    /// Uuids already produced at exactly [`from_date`](Self::from_date).
    pub fn boundary(&self) -> &BTreeSet<String> {
        &self.boundary
    }

    /// Move the watermark past an emitted item.
    pub fn observe(&mut self, item: &Item) {
        let Some(updated_on) = epoch_to_datetime(item.updated_on) else {
            return;
        };

        match self.from_date {
            Some(current) if updated_on < current => {}
            Some(current) if updated_on == current => {
                self.boundary.insert(item.uuid.clone());
            }
            _ => {
                self.from_date = Some(updated_on);
                self.boundary.clear();
                self.boundary.insert(item.uuid.clone());
            }
        }
    }

    /// Whether a record with this uuid and update time was already produced.
    pub fn already_seen(&self, uuid: &str, updated_on: f64) -> bool {
        match (self.from_date, epoch_to_datetime(updated_on)) {
            (Some(from), Some(at)) => at == from && self.boundary.contains(uuid),
            _ => false,
        }
    }

    /// Set `from_date` on `params`. Later dates already in `params` win.
    pub fn apply(&self, params: FetchParams) -> FetchParams {
        let Some(from) = self.from_date else {
            return params;
        };
        match params.from_date() {
            Ok(Some(current)) if current > from => params,
            _ => params.with_from_date(from),
        }
    }
}

/// Position of an offset-based fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetCursor {
    page_size: u64,
    page: u64,
    index: u64,
}

impl OffsetCursor {
    /// Cursor positioned at absolute item `start_offset`. A zero page size is
    /// treated as one.
    pub fn new(page_size: u64, start_offset: u64) -> Self {
        let page_size = page_size.max(1);
        Self {
            page_size,
            page: start_offset / page_size,
            index: start_offset % page_size,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Zero-based page holding the next item.
    pub fn page(&self) -> u64 {
        self.page
    }

    /// Items of the current page that come before the next one.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Absolute offset of the next item.
    pub fn offset(&self) -> u64 {
        self.page * self.page_size + self.index
    }

    /// Consume one item and return its offset.
    pub fn advance(&mut self) -> u64 {
        let offset = self.offset();
        self.index += 1;
        if self.index == self.page_size {
            self.page += 1;
            self.index = 0;
        }
        offset
    }

    /// Jump to the first item of the following page.
    pub fn next_page(&mut self) {
        self.page += 1;
        self.index = 0;
    }
}
