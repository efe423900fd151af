//! # Item Harvest
//!
//! Incremental harvesting of items from heterogeneous sources (issue
//! trackers, mailing lists, repositories, local files...) into one uniform
//! envelope.
//!
//! A connector only knows how to pull raw records from its source and how
//! to answer a few questions about them (id, update time, category). The
//! core turns each record into an [`Item`](models::Item) with a stable
//! identity, extracted search fields and optional redaction, and takes care
//! of archiving raw traffic, replaying it, caching multi-step fetches and
//! resuming where the last fetch stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Connectors  │──▶│   Backend     │──▶│ ItemStream  │──▶ items
//! │ fs / http   │   │ tag/blocklist │   │ envelope    │
//! └──────┬──────┘   └──────┬───────┘   └────────────┘
//!        │ Client          │
//!        ▼                 ▼
//! ┌─────────────┐   ┌──────────────┐
//! │  Archive    │   │    Cache     │
//! │  (SQLite)   │   │ (JSON lines) │
//! └─────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest connectors                                  # what is configured
//! harvest fetch filesystem:docs --json-line           # fetch local files
//! harvest fetch http_json:tracker --from-date 2024-01-01
//! harvest fetch http_json:tracker --fetch-archive     # replay, no network
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Error taxonomy |
//! | [`fingerprint`] | Deterministic item identity |
//! | [`models`] | Core data types |
//! | [`metadata`] | Envelope builder, search fields, redaction |
//! | [`summary`] | Run summary |
//! | [`traits`] | Connector contract and registry |
//! | [`client`] | Archive-aware request gateway, HTTP transport |
//! | [`db`] | Archive database connection |
//! | [`migrate`] | Archive schema |
//! | [`archive`] | Archives and the archive manager |
//! | [`cache`] | Resumable cache stream with checkpoints |
//! | [`resume`] | Watermarks and offset cursors |
//! | [`backend`] | Fetch driver and item stream |
//! | [`ingest`] | Fetch orchestration and CLI commands |
//! | [`output`] | JSON item writer |
//! | [`progress`] | Progress reporting |
//! | [`sources`] | Connector listing |
//! | [`connector_fs`] | Filesystem connector |
//! | [`connector_http`] | Paged JSON HTTP connector |
//! | [`config`] | TOML configuration parsing |

pub mod archive;
pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod connector_fs;
pub mod connector_http;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod output;
pub mod progress;
pub mod resume;
pub mod sources;
pub mod summary;
pub mod traits;
