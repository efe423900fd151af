//! Item output.
//!
//! Writes items as JSON, either pretty-printed and blank-line separated or
//! one object per line (`--json-line`), to a file or to stdout. Keys are
//! emitted in sorted order so output is stable across runs.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::models::Item;

/// Sink for fetched items.
pub struct ItemWriter {
    out: Box<dyn Write + Send>,
    json_line: bool,
    written: u64,
}

impl ItemWriter {
    /// Write to `path`, or to stdout when `None`.
    pub fn open(path: Option<&Path>, json_line: bool) -> Result<Self> {
        let out: Box<dyn Write + Send> = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Box::new(BufWriter::new(File::create(path)?))
            }
            None => Box::new(BufWriter::new(io::stdout())),
        };
        Ok(Self::new(out, json_line))
    }

    pub fn new(out: Box<dyn Write + Send>, json_line: bool) -> Self {
        Self {
            out,
            json_line,
            written: 0,
        }
    }

    pub fn write(&mut self, item: &Item) -> Result<()> {
        // Through Value so map keys come out sorted.
        let value = serde_json::to_value(item)?;
        if self.json_line {
            serde_json::to_writer(&mut self.out, &value)?;
            self.out.write_all(b"\n")?;
        } else {
            if self.written > 0 {
                self.out.write_all(b"\n")?;
            }
            serde_json::to_writer_pretty(&mut self.out, &value)?;
            self.out.write_all(b"\n")?;
        }
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        Ok(self.written)
    }
}
