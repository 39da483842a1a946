//! On-disk persistence of conversations.
//!
//! Each persisted conversation is one pretty-printed JSON file named
//! `<epoch>_<YYYYmmddTHHMMSSZ>_conversation.json` inside the storage directory.
//! Files are never overwritten: a second conversation persisted within the
//! same second gets a counter, as in `<epoch>_<stamp>_1_conversation.json`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, info};

use crate::conversation::Conversation;
use crate::error::{Error, Result};

/// Suffix shared by every conversation file.
pub const FILE_SUFFIX: &str = "_conversation.json";

const JSON_INDENT: usize = 4;

/// Attempts at a free file name before giving up.
const MAX_COLLISIONS: u32 = 1000;

/// A directory of persisted conversations.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Creates storage rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a conversation persisted at `at`.
    pub fn file_name(at: OffsetDateTime) -> Result<String> {
        let at = at.to_offset(time::UtcOffset::UTC);
        let stamp = at
            .format(format_description!(
                "[year][month][day]T[hour][minute][second]Z"
            ))
            .map_err(|e| {
                Error::serialization(
                    format!("failed to format timestamp: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(format!("{}_{stamp}{FILE_SUFFIX}", at.unix_timestamp()))
    }

    /// Writes `conversation` to a new timestamped file and returns its path.
    pub fn persist(&self, conversation: &Conversation) -> Result<PathBuf> {
        self.persist_at(conversation, OffsetDateTime::now_utc())
    }

    /// Like [`Storage::persist`] with an explicit timestamp.
    pub fn persist_at(&self, conversation: &Conversation, at: OffsetDateTime) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            Error::io(
                format!("failed to create storage directory {}", self.dir.display()),
                err,
            )
        })?;
        let json = conversation.to_json(Some(JSON_INDENT))?;
        let name = Self::file_name(at)?;
        let stem = name.trim_end_matches(FILE_SUFFIX);
        let mut attempt = 0;
        let (path, mut file) = loop {
            let path = if attempt == 0 {
                self.dir.join(&name)
            } else {
                self.dir.join(format!("{stem}_{attempt}{FILE_SUFFIX}"))
            };
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(err) if err.kind() == ErrorKind::AlreadyExists && attempt < MAX_COLLISIONS => {
                    debug!(path = %path.display(), "conversation file exists; trying next name");
                    attempt += 1;
                }
                Err(err) => {
                    return Err(Error::io(
                        format!("failed to create {}", path.display()),
                        err,
                    ));
                }
            }
        };
        file.write_all(json.as_bytes())
            .map_err(|err| Error::io(format!("failed to write {}", path.display()), err))?;
        info!(
            conversation = %conversation.id(),
            path = %path.display(),
            messages = conversation.len(),
            tokens = conversation.tokens(),
            "persisted conversation"
        );
        Ok(path)
    }

    /// Conversation files in this directory, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(Error::io(
                    format!("failed to read storage directory {}", self.dir.display()),
                    err,
                ));
            }
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if let Some(key) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(order_key)
            {
                paths.push((key, path));
            }
        }
        paths.sort();
        Ok(paths.into_iter().map(|(_, path)| path).collect())
    }

    /// The most recently persisted conversation file, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list()?.pop())
    }
}

/// Sorts conversation files by epoch, then by collision counter.
fn order_key(name: &str) -> Option<(i64, u32)> {
    let stem = name.strip_suffix(FILE_SUFFIX)?;
    let mut parts = stem.split('_');
    let epoch = parts.next()?.parse().ok()?;
    let _stamp = parts.next()?;
    let counter = match parts.next() {
        Some(counter) => counter.parse().ok()?,
        None => 0,
    };
    Some((epoch, counter))
}

/// Reads a conversation previously written by [`Storage::persist`].
pub fn load(path: &Path) -> Result<Conversation> {
    let text = fs::read_to_string(path)
        .map_err(|err| Error::io(format!("failed to read {}", path.display()), err))?;
    let conversation = Conversation::from_json(&text)?;
    debug!(
        path = %path.display(),
        messages = conversation.len(),
        "loaded conversation"
    );
    Ok(conversation)
}
