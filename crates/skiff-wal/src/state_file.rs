//! Atomically-replaced file holding a single serde value.
//!
//! Used for metadata that must be durable before an operation is
//! acknowledged but must never be observed half-written (the consensus
//! core stores its `{current_term, voted_for}` pair here). Every store
//! writes a temp file, fsyncs it, renames it over the original, and
//! fsyncs the parent directory.

use crate::record::Record;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// A single durable value of type `T`, checksummed on disk.
pub struct StateFile<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> StateFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Loads the stored value, or `None` if the file does not exist.
    ///
    /// A corrupt file (failed checksum) is an error, not `None`: losing
    /// this state silently would violate the durability contract.
    pub async fn load(&self) -> Result<Option<T>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (record, _) = Record::decode(&data)?;
        let value = bincode::deserialize(&record.payload)?;
        Ok(Some(value))
    }

    /// Durably replaces the stored value. Atomic with respect to crashes.
    pub async fn store(&self, value: &T) -> Result<()> {
        let payload = bincode::serialize(value)?;
        let encoded = Record::new(payload).encode();

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&encoded).await?;
        tmp.sync_data().await?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        sync_parent_dir(&self.path).await?;
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Meta {
        term: u64,
        voted_for: Option<u32>,
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let state: StateFile<Meta> = StateFile::new(dir.path().join("meta.bin"));
        assert!(state.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let state: StateFile<Meta> = StateFile::new(dir.path().join("meta.bin"));

        let meta = Meta {
            term: 7,
            voted_for: Some(2),
        };
        state.store(&meta).await.unwrap();

        assert_eq!(state.load().await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let state: StateFile<Meta> = StateFile::new(dir.path().join("meta.bin"));

        for term in 1..=5 {
            state
                .store(&Meta {
                    term,
                    voted_for: None,
                })
                .await
                .unwrap();
        }

        let loaded = state.load().await.unwrap().unwrap();
        assert_eq!(loaded.term, 5);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.bin");
        let state: StateFile<Meta> = StateFile::new(&path);

        state
            .store(&Meta {
                term: 3,
                voted_for: Some(1),
            })
            .await
            .unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data[2] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        assert!(state.load().await.is_err());
    }
}
