//! Fetch progress reporting.
//!
//! Reports observable progress during `harvest fetch` so users see which
//! source is being read and how many items came out of it. Progress is
//! emitted on **stderr** so stdout remains parseable when items are written
//! there.

use std::io::Write;

/// A single progress event for a fetch.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchProgressEvent {
    /// Retrieval started; the total is unknown.
    Started { connector: String, category: String },
    /// `fetched` items emitted and `skipped` records dropped so far.
    Fetching {
        connector: String,
        fetched: u64,
        skipped: u64,
    },
    /// The source is exhausted.
    Finished {
        connector: String,
        fetched: u64,
        skipped: u64,
    },
}

/// Reports fetch progress. Implementations write to stderr (human or JSON).
pub trait FetchProgressReporter: Send + Sync {
    fn report(&self, event: FetchProgressEvent);
}

/// Human-friendly progress on stderr: "fetch http_json:tracker  1,234 items (2 skipped)".
pub struct StderrProgress;

impl FetchProgressReporter for StderrProgress {
    fn report(&self, event: FetchProgressEvent) {
        let line = match &event {
            FetchProgressEvent::Started {
                connector,
                category,
            } => format!("fetch {}  {}  starting...\n", connector, category),
            FetchProgressEvent::Fetching {
                connector,
                fetched,
                skipped,
            } => format!(
                "fetch {}  {} items ({} skipped)\n",
                connector,
                format_number(*fetched),
                format_number(*skipped)
            ),
            FetchProgressEvent::Finished {
                connector,
                fetched,
                skipped,
            } => format!(
                "fetch {}  done  {} items ({} skipped)\n",
                connector,
                format_number(*fetched),
                format_number(*skipped)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl FetchProgressReporter for JsonProgress {
    fn report(&self, event: FetchProgressEvent) {
        let obj = match &event {
            FetchProgressEvent::Started {
                connector,
                category,
            } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "started",
                "category": category
            }),
            FetchProgressEvent::Fetching {
                connector,
                fetched,
                skipped,
            } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "fetching",
                "fetched": fetched,
                "skipped": skipped
            }),
            FetchProgressEvent::Finished {
                connector,
                fetched,
                skipped,
            } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "finished",
                "fetched": fetched,
                "skipped": skipped
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl FetchProgressReporter for NoProgress {
    fn report(&self, _event: FetchProgressEvent) {}
}

/// How often, in items, a `Fetching` event is emitted.
pub const REPORT_EVERY: u64 = 100;

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn FetchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
