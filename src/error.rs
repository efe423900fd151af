//! Error taxonomy shared by every layer of the harvesting core.
//!
//! Fatal conditions abort a fetch and carry a human-readable cause. Non-fatal
//! conditions (a missing search-field path, a classified field that is not
//! present) never become errors: they are logged where they happen and the
//! item is still produced.

/// Errors raised by the harvesting core and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Invalid category, illegal option combination, bad connector settings.
    /// Always raised before any network call.
    #[error("{0}")]
    Config(String),

    /// An archive operation was requested but no archive is associated.
    #[error("archive unavailable: {0}")]
    ArchiveUnavailable(String),

    /// A replay needed an entry the archive does not hold. The archive was
    /// not produced by a fetch that terminated correctly.
    #[error("archive corrupted: {0}")]
    ArchiveCorrupted(String),

    /// Any other archive failure (missing file, invalid file, duplicated entry).
    #[error("archive error: {0}")]
    Archive(String),

    /// The cache stream ended, or produced the wrong kind of entry, while the
    /// checkpoint protocol still expected more.
    #[error("cache corrupted: {0}")]
    CacheCorrupted(String),

    /// Any other cache failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Identity inputs were empty or not strings.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure surfaced by a connector's retrieval loop.
    #[error("connector error: {0}")]
    Connector(String),

    /// The remote rate limit is exhausted and waiting for its reset is not
    /// allowed (or would take too long).
    #[error("rate limit exhausted; {seconds_to_reset}s until reset")]
    RateLimit { seconds_to_reset: u64 },

    /// A payload could not be parsed by its connector.
    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl HarvestError {
    /// Whether the error means a replay source is not trustworthy.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HarvestError::ArchiveCorrupted(_) | HarvestError::CacheCorrupted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
