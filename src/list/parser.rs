//! Streaming decoder for the agent file-list format
//!
//! One logical entry per line:
//!
//! ```text
//! f"<name>" <size> <last_modified>[#k1=v1&k2=v2]\n
//! d"<name>" 0 <last_modified>[#k1=v1&k2=v2]\n
//! ```
//!
//! `d".."` closes the current directory. Names are quoted with `\"` and `\\`
//! escapes; extras values use `%XX` escapes for the separator characters.
//! The parser consumes one byte at a time so entries split across read-buffer
//! boundaries need no special handling, and [`FileListParser::reset`] allows
//! replaying the same stream from offset 0.

use super::unescape_extra;
use crate::error::{BackupError, Result};
use std::collections::BTreeMap;

/// Extra attributes attached to a list entry, keys unique and ordered
pub type Extras = BTreeMap<String, String>;

/// One decoded list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Entry name as the agent sees it; `".."` on a directory close
    pub name: String,
    /// Directory flag
    pub is_dir: bool,
    /// File size in bytes, `0` for directories
    pub size: i64,
    /// Modification time as the agent reported it
    pub last_modified: i64,
    /// Attribute map (`sha512`, `sym_target`, `orig_sep`, ...)
    pub extras: Extras,
}

impl ListEntry {
    /// Whether this entry closes the current directory
    #[must_use]
    pub fn is_leave(&self) -> bool {
        self.is_dir && self.name == ".."
    }

    /// View this entry as a traversal event
    #[must_use]
    pub fn event(&self) -> DirectoryEvent<'_> {
        if self.is_dir {
            if self.name == ".." {
                DirectoryEvent::Leave
            } else {
                DirectoryEvent::Enter {
                    name: &self.name,
                    extras: &self.extras,
                }
            }
        } else {
            DirectoryEvent::File {
                name: &self.name,
                size: self.size,
                last_modified: self.last_modified,
                extras: &self.extras,
            }
        }
    }
}

/// Tagged traversal event view of a [`ListEntry`]
#[derive(Debug, PartialEq, Eq)]
pub enum DirectoryEvent<'a> {
    /// Descend into a directory
    Enter {
        /// Directory name
        name: &'a str,
        /// Attributes of the directory entry
        extras: &'a Extras,
    },
    /// Ascend out of the current directory
    Leave,
    /// A regular file (or symlink, when `sym_target` is present)
    File {
        /// File name
        name: &'a str,
        /// Size in bytes
        size: i64,
        /// Modification time
        last_modified: i64,
        /// Attributes of the file entry
        extras: &'a Extras,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    LineStart,
    QuoteOpen,
    Name,
    NameEscape,
    AfterName,
    Size,
    Modified,
    ExtraKey,
    ExtraValue,
}

/// Restartable streaming file-list parser
#[derive(Debug)]
pub struct FileListParser {
    state: State,
    is_dir: bool,
    name: Vec<u8>,
    num: Vec<u8>,
    size: i64,
    key: Vec<u8>,
    value: Vec<u8>,
    extras: Extras,
}

impl Default for FileListParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FileListParser {
    /// Create a parser at line start
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::LineStart,
            is_dir: false,
            name: Vec::new(),
            num: Vec::new(),
            size: 0,
            key: Vec::new(),
            value: Vec::new(),
            extras: Extras::new(),
        }
    }

    /// Restore the initial state for a replay of the stream
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed one byte; returns a finished entry at each line end
    ///
    /// # Errors
    ///
    /// Returns `BackupError::ListCorrupt` on malformed input. The parser is
    /// not usable afterwards without a [`reset`](Self::reset).
    pub fn next_entry(&mut self, b: u8) -> Result<Option<ListEntry>> {
        match self.state {
            State::LineStart => match b {
                b'f' => {
                    self.is_dir = false;
                    self.state = State::QuoteOpen;
                }
                b'd' => {
                    self.is_dir = true;
                    self.state = State::QuoteOpen;
                }
                b'\n' | b'\r' => {}
                other => {
                    return Err(corrupt(format!("unexpected entry type byte {other:#04x}")));
                }
            },
            State::QuoteOpen => {
                if b == b'"' {
                    self.state = State::Name;
                } else {
                    return Err(corrupt("entry name is not quoted"));
                }
            }
            State::Name => match b {
                b'\\' => self.state = State::NameEscape,
                b'"' => self.state = State::AfterName,
                other => self.name.push(other),
            },
            State::NameEscape => {
                self.name.push(b);
                self.state = State::Name;
            }
            State::AfterName => {
                if b == b' ' {
                    self.state = State::Size;
                } else {
                    return Err(corrupt("missing separator after entry name"));
                }
            }
            State::Size => match b {
                b'0'..=b'9' | b'-' => self.num.push(b),
                b' ' => {
                    self.size = self.take_num("size")?;
                    self.state = State::Modified;
                }
                _ => return Err(corrupt("non-numeric size field")),
            },
            State::Modified => match b {
                b'0'..=b'9' | b'-' => self.num.push(b),
                b'\r' => {}
                b'#' => {
                    self.state = State::ExtraKey;
                }
                b'\n' => return self.emit().map(Some),
                _ => return Err(corrupt("non-numeric modification time field")),
            },
            State::ExtraKey => match b {
                b'=' => self.state = State::ExtraValue,
                b'&' => self.finish_extra(),
                b'\r' => {}
                b'\n' => {
                    self.finish_extra();
                    return self.emit().map(Some);
                }
                other => self.key.push(other),
            },
            State::ExtraValue => match b {
                b'&' => self.finish_extra(),
                b'\r' => {}
                b'\n' => {
                    self.finish_extra();
                    return self.emit().map(Some);
                }
                other => self.value.push(other),
            },
        }
        Ok(None)
    }

    fn take_num(&mut self, what: &str) -> Result<i64> {
        let s = std::str::from_utf8(&self.num)
            .map_err(|_| corrupt(format!("{what} field is not valid text")))?;
        let v = s
            .parse::<i64>()
            .map_err(|_| corrupt(format!("{what} field is not a number")))?;
        self.num.clear();
        Ok(v)
    }

    fn finish_extra(&mut self) {
        if !self.key.is_empty() {
            let key = unescape_extra(&String::from_utf8_lossy(&self.key));
            let value = unescape_extra(&String::from_utf8_lossy(&self.value));
            self.extras.insert(key, value);
        }
        self.key.clear();
        self.value.clear();
    }

    fn emit(&mut self) -> Result<ListEntry> {
        let last_modified = self.take_num("modification time")?;
        let name = String::from_utf8(std::mem::take(&mut self.name))
            .map_err(|_| corrupt("entry name is not valid UTF-8"))?;
        let entry = ListEntry {
            name,
            is_dir: self.is_dir,
            size: self.size,
            last_modified,
            extras: std::mem::take(&mut self.extras),
        };
        self.size = 0;
        self.state = State::LineStart;
        Ok(entry)
    }
}

fn corrupt(msg: impl Into<String>) -> BackupError {
    BackupError::ListCorrupt(msg.into())
}
