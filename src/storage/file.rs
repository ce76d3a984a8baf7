//! File-backed log store
//!
//! Layout inside the store directory:
//! - `<alias>.log`: the log bytes, position 0 at file offset 0
//! - `<alias>.head.json`: the truncated head position
//!
//! Head truncation is logical: the head position is persisted in the
//! sidecar and the bytes before it become unreadable. Tail truncation
//! shortens the file. Every flush is an fsync; every alias change fsyncs
//! the directory.
//!
//! Blocking file I/O runs on the blocking thread pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::{StorageError, StorageResult};
use super::{LogStore, LogStream};
use crate::sync::lock;

const LOG_EXTENSION: &str = "log";
const HEAD_EXTENSION: &str = "head.json";

/// Persisted head position of a stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct HeadMarker {
    head_position: u64,
    format_version: u8,
}

impl HeadMarker {
    fn new(head_position: u64) -> Self {
        Self {
            head_position,
            format_version: 1,
        }
    }

    fn read(path: &Path) -> StorageResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut contents = String::new();
        File::open(path)
            .and_then(|mut file| file.read_to_string(&mut contents))
            .map_err(|e| {
                StorageError::read_failed(format!("Failed to read head marker: {}", path.display()), e)
            })?;
        let marker = serde_json::from_str(&contents).map_err(|e| {
            StorageError::metadata_corrupt(format!(
                "Failed to parse head marker {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(marker))
    }

    /// Write the marker with fsync of the file and its directory
    fn write(&self, path: &Path) -> StorageResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            StorageError::truncate_failed(
                "Failed to serialize head marker",
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;

        let mut file = File::create(path).map_err(|e| {
            StorageError::truncate_failed(format!("Failed to create head marker: {}", path.display()), e)
        })?;
        file.write_all(json.as_bytes()).map_err(|e| {
            StorageError::truncate_failed(format!("Failed to write head marker: {}", path.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            StorageError::truncate_failed(format!("Failed to fsync head marker: {}", path.display()), e)
        })?;

        if let Some(parent) = path.parent() {
            sync_dir(parent).map_err(|e| {
                StorageError::truncate_failed(
                    format!("Failed to fsync marker directory: {}", parent.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

struct FileState {
    file: File,
    head: u64,
    write: u64,
}

struct FileStreamInner {
    log_path: PathBuf,
    head_path: PathBuf,
    state: Mutex<FileState>,
}

/// One log file
struct FileLogStream {
    inner: Arc<FileStreamInner>,
}

impl FileLogStream {
    fn open(log_path: PathBuf, head_path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;
        let write = file.metadata()?.len();
        Ok(Self {
            inner: Arc::new(FileStreamInner {
                log_path,
                head_path,
                state: Mutex::new(FileState { file, head: 0, write }),
            }),
        })
    }

    async fn run_blocking<T, F>(&self, task: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileStreamInner) -> StorageResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        match tokio::task::spawn_blocking(move || task(&inner)).await {
            Ok(result) => result,
            Err(e) => Err(StorageError::append_failed(
                "storage task did not complete",
                io::Error::new(io::ErrorKind::Other, e.to_string()),
            )),
        }
    }
}

#[async_trait]
impl LogStream for FileLogStream {
    async fn append(&self, bytes: &[u8]) -> StorageResult<()> {
        let bytes = bytes.to_vec();
        self.run_blocking(move |inner| {
            let mut state = lock(&inner.state);
            state.file.write_all(&bytes).map_err(|e| {
                StorageError::append_failed(
                    format!("Failed to append to {}", inner.log_path.display()),
                    e,
                )
            })?;
            state.write += bytes.len() as u64;
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> StorageResult<()> {
        self.run_blocking(|inner| {
            let state = lock(&inner.state);
            state.file.sync_data().map_err(|e| {
                StorageError::flush_failed(
                    format!("Failed to fsync {}", inner.log_path.display()),
                    e,
                )
            })
        })
        .await
    }

    async fn truncate_head(&self, position: u64) -> StorageResult<()> {
        self.run_blocking(move |inner| {
            let mut state = lock(&inner.state);
            if position > state.write {
                return Err(StorageError::truncate_failed(
                    format!("Failed to truncate head of {}", inner.log_path.display()),
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("head {} beyond write position {}", position, state.write),
                    ),
                ));
            }
            if position <= state.head {
                return Ok(());
            }
            HeadMarker::new(position).write(&inner.head_path)?;
            state.head = position;
            Ok(())
        })
        .await
    }

    async fn truncate_tail(&self, position: u64) -> StorageResult<()> {
        self.run_blocking(move |inner| {
            let mut state = lock(&inner.state);
            let error = |e| {
                StorageError::truncate_failed(
                    format!("Failed to truncate tail of {}", inner.log_path.display()),
                    e,
                )
            };
            if position < state.head {
                return Err(error(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("tail {} before head {}", position, state.head),
                )));
            }
            state.file.set_len(position).map_err(error)?;
            state.file.sync_all().map_err(error)?;
            state.write = position;
            Ok(())
        })
        .await
    }

    async fn read_from(&self, position: u64) -> StorageResult<Vec<u8>> {
        self.run_blocking(move |inner| {
            let mut state = lock(&inner.state);
            let error = |e| {
                StorageError::read_failed(format!("Failed to read {}", inner.log_path.display()), e)
            };
            if position < state.head || position > state.write {
                return Err(error(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "read at {} outside [{}, {}]",
                        position, state.head, state.write
                    ),
                )));
            }
            let mut bytes = Vec::with_capacity((state.write - position) as usize);
            state.file.seek(SeekFrom::Start(position)).map_err(error)?;
            state.file.read_to_end(&mut bytes).map_err(error)?;
            Ok(bytes)
        })
        .await
    }

    fn head_position(&self) -> u64 {
        lock(&self.inner.state).head
    }

    fn write_position(&self) -> u64 {
        lock(&self.inner.state).write
    }
}

/// Log store with one file per alias in a directory
#[derive(Debug, Clone)]
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    /// Use `dir` as the store directory, creating it if needed
    pub fn open_dir(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            StorageError::alias_failed(format!("Failed to create log directory: {}", dir.display()), e)
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", alias, LOG_EXTENSION))
    }

    fn head_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", alias, HEAD_EXTENSION))
    }

    fn sync(&self) -> StorageResult<()> {
        sync_dir(&self.dir).map_err(|e| {
            StorageError::alias_failed(format!("Failed to fsync log directory: {}", self.dir.display()), e)
        })
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn open(&self, alias: &str) -> StorageResult<Arc<dyn LogStream>> {
        let log_path = self.log_path(alias);
        if !log_path.exists() {
            return Err(StorageError::not_found(alias));
        }
        let head_path = self.head_path(alias);
        let head = HeadMarker::read(&head_path)?.map(|m| m.head_position);
        let stream = FileLogStream::open(log_path, head_path).map_err(|e| {
            StorageError::alias_failed(format!("Failed to open log '{}'", alias), e)
        })?;
        if let Some(head) = head {
            let mut state = lock(&stream.inner.state);
            if head > state.write {
                return Err(StorageError::metadata_corrupt(format!(
                    "head {} of log '{}' beyond its end {}",
                    head, alias, state.write
                )));
            }
            state.head = head;
        }
        Ok(Arc::new(stream))
    }

    async fn create(&self, alias: &str) -> StorageResult<Arc<dyn LogStream>> {
        let log_path = self.log_path(alias);
        let head_path = self.head_path(alias);
        let error = |e| StorageError::alias_failed(format!("Failed to create log '{}'", alias), e);

        remove_if_exists(&head_path).map_err(error)?;
        File::create(&log_path)
            .and_then(|file| file.sync_all())
            .map_err(error)?;
        self.sync()?;

        let stream = FileLogStream::open(log_path, head_path).map_err(error)?;
        Ok(Arc::new(stream))
    }

    async fn exists(&self, alias: &str) -> StorageResult<bool> {
        Ok(self.log_path(alias).exists())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let error = |e| StorageError::alias_failed(format!("Failed to rename log '{}' to '{}'", from, to), e);
        if !self.log_path(from).exists() {
            return Err(StorageError::not_found(from));
        }
        if self.log_path(to).exists() {
            return Err(error(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "target alias exists",
            )));
        }

        remove_if_exists(&self.head_path(to)).map_err(error)?;
        if self.head_path(from).exists() {
            fs::rename(self.head_path(from), self.head_path(to)).map_err(error)?;
        }
        fs::rename(self.log_path(from), self.log_path(to)).map_err(error)?;
        self.sync()
    }

    async fn delete(&self, alias: &str) -> StorageResult<()> {
        let error = |e| StorageError::alias_failed(format!("Failed to delete log '{}'", alias), e);
        remove_if_exists(&self.log_path(alias)).map_err(error)?;
        remove_if_exists(&self.head_path(alias)).map_err(error)?;
        self.sync()
    }
}
