//! Append-only log file with crash recovery and suffix rewrite.
//!
//! A [`LogFile`] is a single file of framed [`Record`]s. On open the file
//! is scanned record-by-record; a torn or corrupt tail (from a crash mid
//! append) is cut off at the last valid record boundary. Appends go to the
//! end of the file; suffix truncation is done by rewriting the surviving
//! prefix to a temp file and renaming it into place, so a crash during
//! truncation never leaves a mixed state.

use crate::record::{Record, RecordError};
use crate::Result;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// What recovery found when the file was opened.
#[derive(Debug, Clone, Default)]
pub struct RecoveryInfo {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Bytes discarded from a torn or corrupt tail.
    pub truncated_bytes: u64,
    /// True if a CRC mismatch (not just a short tail) was found.
    pub corruption_detected: bool,
}

struct Inner {
    file: File,
    len: u64,
}

/// Append-only file of CRC32C-framed records.
pub struct LogFile {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl LogFile {
    /// Opens (or creates) the log file at `path`, recovering its contents.
    ///
    /// Scans all records, truncating the file at the first invalid one.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, RecoveryInfo)> {
        let path = path.into();

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut info = RecoveryInfo::default();
        let mut offset = 0usize;
        while offset < data.len() {
            match Record::decode(&data[offset..]) {
                Ok((_, consumed)) => {
                    offset += consumed;
                    info.valid_records += 1;
                }
                Err(RecordError::Incomplete) => break,
                // A garbled length varint is corruption too, not an I/O fault.
                Err(RecordError::CrcMismatch { .. }) | Err(RecordError::Io(_)) => {
                    info.corruption_detected = true;
                    break;
                }
            }
        }
        info.truncated_bytes = (data.len() - offset) as u64;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;

        if info.truncated_bytes > 0 {
            tracing::warn!(
                path = %path.display(),
                truncated_bytes = info.truncated_bytes,
                corruption = info.corruption_detected,
                "discarding invalid log tail"
            );
            file.set_len(offset as u64).await?;
            file.sync_data().await?;
        }
        file.seek(SeekFrom::Start(offset as u64)).await?;

        Ok((
            Self {
                path,
                inner: Mutex::new(Inner {
                    file,
                    len: offset as u64,
                }),
            },
            info,
        ))
    }

    /// Appends a record to the end of the file. Not synced until [`sync`].
    ///
    /// [`sync`]: LogFile::sync
    pub async fn append(&self, record: &Record) -> Result<()> {
        let encoded = record.encode();
        let mut inner = self.inner.lock().await;
        inner.file.write_all(&encoded).await?;
        inner.len += encoded.len() as u64;
        Ok(())
    }

    /// Appends a batch of records under one lock acquisition.
    pub async fn append_batch(&self, records: &[Record]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for record in records {
            let encoded = record.encode();
            inner.file.write_all(&encoded).await?;
            inner.len += encoded.len() as u64;
        }
        Ok(())
    }

    /// Fsyncs all appended data. Durability point for acknowledged writes.
    pub async fn sync(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.file.sync_data().await?;
        Ok(())
    }

    /// Reads and decodes every record in the file, in order.
    pub async fn read_all(&self) -> Result<Vec<Record>> {
        let inner = self.inner.lock().await;
        let data = tokio::fs::read(&self.path).await?;
        drop(inner);

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let (record, consumed) = Record::decode(&data[offset..])?;
            records.push(record);
            offset += consumed;
        }
        Ok(records)
    }

    /// Atomically replaces the file contents with `records`.
    ///
    /// Used for suffix truncation: the caller passes the surviving prefix.
    /// The new contents are written to a temp file, fsynced, and renamed
    /// over the original, then the parent directory is fsynced.
    pub async fn rewrite(&self, records: &[Record]) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path).await?;
        let mut len = 0u64;
        for record in records {
            let encoded = record.encode();
            tmp.write_all(&encoded).await?;
            len += encoded.len() as u64;
        }
        tmp.sync_data().await?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        sync_parent_dir(&self.path).await?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        file.seek(SeekFrom::Start(len)).await?;

        inner.file = file;
        inner.len = len;
        Ok(())
    }

    /// Current byte length of the file (including unsynced appends).
    pub async fn len(&self) -> u64 {
        self.inner.lock().await.len
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent).await?;
            dir.sync_all().await?;
        }
    }
    Ok(())
}
