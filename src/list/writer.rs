//! Writer for the agent file-list format
//!
//! Emits entries in exactly the shape [`super::FileListParser`] reads, so a
//! written list replayed through the parser yields the same entries. Extras
//! are ordered (the map is a `BTreeMap`), which keeps the output byte-stable
//! across runs.

use super::{escape_extra, ListEntry};
use crate::error::{BackupError, Result};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Buffered file-list writer
pub struct FileListWriter {
    out: BufWriter<File>,
}

impl FileListWriter {
    /// Create (truncate) the list file at `path`
    pub async fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).await.map_err(|e| {
            BackupError::Disk(format!("cannot create file list {}: {e}", path.display()))
        })?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Append one entry
    pub async fn write_item(&mut self, entry: &ListEntry) -> Result<()> {
        let mut line = String::with_capacity(entry.name.len() + 32);
        line.push(if entry.is_dir { 'd' } else { 'f' });
        line.push('"');
        for c in entry.name.chars() {
            if c == '"' || c == '\\' {
                line.push('\\');
            }
            line.push(c);
        }
        line.push('"');
        line.push(' ');
        line.push_str(&entry.size.to_string());
        line.push(' ');
        line.push_str(&entry.last_modified.to_string());
        let mut first = true;
        for (key, value) in &entry.extras {
            line.push(if first { '#' } else { '&' });
            first = false;
            line.push_str(&escape_extra(key));
            line.push('=');
            line.push_str(&escape_extra(value));
        }
        line.push('\n');
        self.out
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BackupError::Disk(format!("writing file list entry: {e}")))
    }

    /// Flush buffers and sync the file to disk
    pub async fn finish(self) -> Result<()> {
        let mut out = self.out;
        out.flush()
            .await
            .map_err(|e| BackupError::Disk(format!("flushing file list: {e}")))?;
        out.into_inner()
            .sync_all()
            .await
            .map_err(|e| BackupError::Disk(format!("syncing file list: {e}")))
    }
}
