//! Append-only record logs.
//!
//! An [`AppendLog`] holds sequence-numbered entries in memory and, when opened
//! on a path, mirrors every append as one JSON line:
//!
//! ```text
//! {"sequence":0,"appended_at":"2026-01-01T00:00:00Z","record":{...}}
//! ```
//!
//! Entries are never rewritten. Several processes may hold the same file open:
//! every append takes an exclusive `flock` on it, catches up on lines written
//! by other writers since the last read, and only then picks the next sequence
//! number. A torn trailing line left by a crashed writer is cut off before the
//! next append.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One line of an append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<T> {
    /// 0-based position in the log.
    pub sequence: u64,
    pub appended_at: DateTime<Utc>,
    pub record: T,
}

/// Result of [`AppendLog::append_unless`].
#[derive(Debug, Clone, PartialEq)]
pub enum Appended<T> {
    New(LogEntry<T>),
    /// A matching record was already in the log; nothing was written.
    Existing(LogEntry<T>),
}

#[derive(Debug)]
struct LogState<T> {
    entries: Vec<LogEntry<T>>,
    /// Bytes of the backing file already replayed into `entries`.
    offset: u64,
}

/// An append-only, optionally file-backed, sequence of records.
#[derive(Debug)]
pub struct AppendLog<T> {
    path: Option<PathBuf>,
    state: RwLock<LogState<T>>,
}

impl<T> AppendLog<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// A log that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(LogState {
                entries: Vec::new(),
                offset: 0,
            }),
        }
    }

    /// Open a JSONL-backed log, replaying any entries already on disk.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(io_error(&path, source)),
        };

        let mut entries = Vec::new();
        let complete = replay(&path, &bytes, &mut entries)?;
        if complete < bytes.len() {
            warn!(path = %path.display(), bytes = bytes.len() - complete, "Ignoring torn trailing line");
        }
        debug!(path = %path.display(), entries = entries.len(), "Opened append log");
        Ok(Self {
            path: Some(path),
            state: RwLock::new(LogState {
                entries,
                offset: complete as u64,
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a record and return the stored entry.
    ///
    /// The line is flushed and synced before the entry becomes visible to
    /// readers. A failed write leaves the log unchanged.
    pub async fn append(&self, record: T) -> Result<LogEntry<T>, StoreError> {
        self.append_with(|_| record).await
    }

    /// Append the record built from the current last entry.
    ///
    /// `build` runs while the log is locked against every other writer, so the
    /// entry it sees is still the last one when the new record lands.
    pub async fn append_with<F>(&self, build: F) -> Result<LogEntry<T>, StoreError>
    where
        F: FnOnce(Option<&LogEntry<T>>) -> T,
    {
        let mut state = self.state.write().await;
        let mut file = self.lock_and_catch_up(&mut state).await?;
        let record = build(state.entries.last());
        self.commit(&mut state, file.as_mut(), record).await
    }

    /// Append `record` unless an entry matching `exists` is already present,
    /// including entries written by other processes.
    pub async fn append_unless<F>(&self, record: T, exists: F) -> Result<Appended<T>, StoreError>
    where
        F: Fn(&T) -> bool,
    {
        let mut state = self.state.write().await;
        let mut file = self.lock_and_catch_up(&mut state).await?;
        if let Some(existing) = state.entries.iter().find(|e| exists(&e.record)) {
            return Ok(Appended::Existing(existing.clone()));
        }
        self.commit(&mut state, file.as_mut(), record)
            .await
            .map(Appended::New)
    }

    /// Last entry, if any.
    pub async fn last(&self) -> Option<LogEntry<T>> {
        self.state.read().await.entries.last().cloned()
    }

    /// First entry whose record matches `predicate`.
    pub async fn find<F>(&self, predicate: F) -> Option<LogEntry<T>>
    where
        F: Fn(&T) -> bool,
    {
        self.state
            .read()
            .await
            .entries
            .iter()
            .find(|e| predicate(&e.record))
            .cloned()
    }

    /// Whether any record matches `predicate`.
    pub async fn any<F>(&self, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.state
            .read()
            .await
            .entries
            .iter()
            .any(|e| predicate(&e.record))
    }

    /// All entries in append order.
    pub async fn entries(&self) -> Vec<LogEntry<T>> {
        self.state.read().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Lock the backing file and replay whatever other writers appended.
    ///
    /// Returns `None` for in-memory logs. The lock is held until the returned
    /// file is dropped.
    async fn lock_and_catch_up(
        &self,
        state: &mut LogState<T>,
    ) -> Result<Option<tokio::fs::File>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let mut file = lock_exclusive(path).await?;

        let end = file.seek(std::io::SeekFrom::End(0)).await.map_err(|e| io_error(path, e))?;
        if end < state.offset {
            return Err(StoreError::Corrupt {
                path: path.display().to_string(),
                line: state.entries.len(),
                message: format!("file shrank from {} to {end} bytes", state.offset),
            });
        }
        if end == state.offset {
            return Ok(Some(file));
        }

        file.seek(std::io::SeekFrom::Start(state.offset))
            .await
            .map_err(|e| io_error(path, e))?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).await.map_err(|e| io_error(path, e))?;

        let before = state.entries.len();
        let complete = replay(path, &tail, &mut state.entries)?;
        state.offset += complete as u64;
        if complete < tail.len() {
            warn!(
                path = %path.display(),
                bytes = tail.len() - complete,
                "Truncating torn trailing line"
            );
            file.set_len(state.offset).await.map_err(|e| io_error(path, e))?;
        }
        if state.entries.len() > before {
            debug!(
                path = %path.display(),
                replayed = state.entries.len() - before,
                "Caught up on entries from another writer"
            );
        }
        Ok(Some(file))
    }

    async fn commit(
        &self,
        state: &mut LogState<T>,
        file: Option<&mut tokio::fs::File>,
        record: T,
    ) -> Result<LogEntry<T>, StoreError> {
        let entry = LogEntry {
            sequence: state.entries.len() as u64,
            appended_at: Utc::now(),
            record,
        };

        if let (Some(path), Some(file)) = (&self.path, file) {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            if let Err(source) = write_synced(file, line.as_bytes()).await {
                // Leave no partial line behind for the next writer.
                let _ = file.set_len(state.offset).await;
                return Err(io_error(path, source));
            }
            state.offset += line.len() as u64;
        }

        state.entries.push(entry.clone());
        Ok(entry)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Open `path` for appending and block until this process holds its
/// exclusive lock.
async fn lock_exclusive(path: &Path) -> Result<tokio::fs::File, StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(path, e))?;
    }
    let owned = path.to_path_buf();
    let file = tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&owned)?;
        file.lock_exclusive()?;
        Ok::<_, std::io::Error>(file)
    })
    .await
    .map_err(|e| io_error(path, std::io::Error::other(e)))?
    .map_err(|e| io_error(path, e))?;
    Ok(tokio::fs::File::from_std(file))
}

async fn write_synced(file: &mut tokio::fs::File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Parse every newline-terminated line of `bytes` onto `entries`, checking
/// that sequence numbers continue from `entries.len()`.
///
/// Returns the number of bytes consumed; anything after the last newline is
/// an unfinished write and is left alone.
fn replay<T: DeserializeOwned>(
    path: &Path,
    bytes: &[u8],
    entries: &mut Vec<LogEntry<T>>,
) -> Result<usize, StoreError> {
    let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);

    for line in bytes[..complete].split(|b| *b == b'\n') {
        let corrupt = |message: String, line: usize| StoreError::Corrupt {
            path: path.display().to_string(),
            line,
            message,
        };
        let line_no = entries.len() + 1;
        let text = std::str::from_utf8(line).map_err(|e| corrupt(e.to_string(), line_no))?;
        if text.trim().is_empty() {
            continue;
        }
        let entry: LogEntry<T> =
            serde_json::from_str(text).map_err(|e| corrupt(e.to_string(), line_no))?;
        if entry.sequence != entries.len() as u64 {
            return Err(corrupt(
                format!(
                    "expected sequence {}, found {}",
                    entries.len(),
                    entry.sequence
                ),
                line_no,
            ));
        }
        entries.push(entry);
    }
    Ok(complete)
}
