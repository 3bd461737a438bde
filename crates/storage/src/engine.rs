//! The log store: single-file append log plus in-memory index.
//!
//! All writes append to `data.db` through a buffered writer that is
//! flushed per append; with `sync_writes` a durability barrier is issued
//! before the write returns. Reads look up the index and perform one
//! seek into the data file. The engine is synchronous (blocking I/O);
//! the async boundary is at the caller.

use crate::index::Index;
use crate::record::{self, DecodedEntry};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const DATA_FILE_NAME: &str = "data.db";
const COMPACT_FILE_NAME: &str = "data.db.tmp";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("key not found")]
    NotFound,
    #[error("key has been deleted")]
    Tombstoned,
    #[error("data corruption detected at offset {offset}")]
    Corrupt { offset: u64 },
    #[error("storage engine is closed")]
    Closed,
}

/// Storage statistics surfaced to operators.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub active_keys: usize,
    pub deleted_keys: usize,
    pub data_file_size: u64,
    pub index_size: usize,
    pub total_reads: u64,
    pub total_writes: u64,
}

/// Append-only log store with an in-memory index.
#[derive(Debug)]
pub struct LogStore {
    data_dir: PathBuf,
    path: PathBuf,
    writer: BufWriter<File>,
    index: Index,
    position: u64,
    closed: bool,
    sync_writes: bool,
    total_reads: AtomicU64,
    total_writes: AtomicU64,
}

impl LogStore {
    /// Open or create a log store in `data_dir`, rebuilding the index
    /// from the data file. A torn or corrupt tail is truncated before
    /// new writes are accepted.
    pub fn open(data_dir: &Path, sync_writes: bool) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(DATA_FILE_NAME);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut index = Index::new();
        let mut position = 0u64;

        if file.metadata()?.len() > 0 {
            let mut reader = BufReader::with_capacity(64 * 1024, File::open(&path)?);
            loop {
                match record::read_entry(&mut reader)? {
                    DecodedEntry::Entry(rec, len) => {
                        if rec.is_deleted {
                            index.delete(rec.key, position, rec.timestamp);
                        } else {
                            index.put(rec.key, position, rec.value.len() as u32, rec.timestamp);
                        }
                        position += len as u64;
                    }
                    DecodedEntry::Eof => break,
                    DecodedEntry::Corrupt => {
                        tracing::warn!(
                            "corrupt tail at offset {} in {:?}; truncating",
                            position,
                            path
                        );
                        file.set_len(position)?;
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "log store opened: {} live key(s), {} tombstone(s) recovered from {:?}",
            index.active_count(),
            index.deleted_count(),
            path
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            path,
            writer: BufWriter::with_capacity(64 * 1024, file),
            index,
            position,
            closed: false,
            sync_writes,
            total_reads: AtomicU64::new(0),
            total_writes: AtomicU64::new(0),
        })
    }

    /// Append a live entry and update the index.
    pub fn put(&mut self, key: &[u8], value: &[u8], timestamp: i64) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.total_writes.fetch_add(1, Ordering::Relaxed);

        let offset = self.append(key, value, timestamp, false)?;
        self.index
            .put(key.to_vec(), offset, value.len() as u32, timestamp);
        Ok(())
    }

    /// Append a tombstone and flip the index entry.
    pub fn delete(&mut self, key: &[u8], timestamp: i64) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.total_writes.fetch_add(1, Ordering::Relaxed);

        let offset = self.append(key, &[], timestamp, true)?;
        self.index.delete(key.to_vec(), offset, timestamp);
        Ok(())
    }

    /// Read the latest value for `key`, verifying the stored CRC and
    /// that the entry's key matches.
    pub fn get(&self, key: &[u8]) -> Result<(Vec<u8>, i64), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.total_reads.fetch_add(1, Ordering::Relaxed);

        let entry = self.index.get(key).ok_or(StorageError::NotFound)?;
        if entry.is_deleted {
            return Err(StorageError::Tombstoned);
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut handle = &file;
        match record::read_entry(&mut handle)? {
            DecodedEntry::Entry(rec, _) if rec.key == key => Ok((rec.value, rec.timestamp)),
            _ => Err(StorageError::Corrupt {
                offset: entry.offset,
            }),
        }
    }

    /// Whether `key` exists and is not tombstoned.
    pub fn has(&self, key: &[u8]) -> bool {
        !self.closed && self.index.has(key)
    }

    /// All live keys.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        if self.closed {
            return Vec::new();
        }
        self.index.keys()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.index.active_count()
    }

    /// Flush pending writes and issue a durability barrier.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Rewrite the data file keeping only the latest live entry per key.
    /// Tombstones are dropped. On any error the original file is left
    /// untouched and the engine stays usable.
    pub fn compact(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.writer.flush()?;

        let tmp_path = self.data_dir.join(COMPACT_FILE_NAME);
        let result = self.rewrite_live_entries(&tmp_path);
        let (new_index, new_position) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.writer = BufWriter::with_capacity(64 * 1024, file);
        self.index = new_index;
        self.position = new_position;

        tracing::info!(
            "compaction complete: {} live key(s), {} byte(s)",
            self.index.active_count(),
            self.position
        );
        Ok(())
    }

    /// Storage statistics.
    pub fn stats(&self) -> StoreStats {
        let data_file_size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        StoreStats {
            active_keys: self.index.active_count(),
            deleted_keys: self.index.deleted_count(),
            data_file_size,
            index_size: self.index.len(),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_writes: self.total_writes.load(Ordering::Relaxed),
        }
    }

    /// Flush, sync, and refuse further operations.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.closed = true;
        Ok(())
    }

    fn append(
        &mut self,
        key: &[u8],
        value: &[u8],
        timestamp: i64,
        is_deleted: bool,
    ) -> Result<u64, StorageError> {
        let buf = record::encode_entry(key, value, timestamp, is_deleted);
        let offset = self.position;
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        if self.sync_writes {
            self.writer.get_ref().sync_data()?;
        }
        self.position += buf.len() as u64;
        Ok(offset)
    }

    fn rewrite_live_entries(&self, tmp_path: &Path) -> Result<(Index, u64), StorageError> {
        let tmp = File::create(tmp_path)?;
        let mut tmp_writer = BufWriter::with_capacity(64 * 1024, tmp);
        let mut new_index = Index::new();
        let mut new_position = 0u64;

        let src = File::open(&self.path)?;
        for (key, entry) in self.index.snapshot() {
            if entry.is_deleted {
                continue;
            }

            let mut handle = &src;
            handle.seek(SeekFrom::Start(entry.offset))?;
            let rec = match record::read_entry(&mut handle)? {
                DecodedEntry::Entry(rec, _) if rec.key == key => rec,
                _ => {
                    return Err(StorageError::Corrupt {
                        offset: entry.offset,
                    })
                }
            };

            let buf = record::encode_entry(&rec.key, &rec.value, rec.timestamp, false);
            tmp_writer.write_all(&buf)?;
            new_index.put(rec.key, new_position, rec.value.len() as u32, rec.timestamp);
            new_position += buf.len() as u64;
        }

        tmp_writer.flush()?;
        tmp_writer.get_ref().sync_data()?;
        Ok((new_index, new_position))
    }
}
