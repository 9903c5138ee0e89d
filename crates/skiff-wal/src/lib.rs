//! Append-only log file and atomic state file for a single replica.
//!
//! Two durable primitives used by the consensus core:
//! - [`LogFile`]: an append-only file of CRC32C-framed records with
//!   crash recovery (torn tails are truncated at the last valid record)
//!   and whole-file rewrite for suffix truncation.
//! - [`StateFile`]: a small atomically-replaced file holding one serde
//!   value, used for metadata that must never be observed half-written.
//!
//! # Example
//!
//! ```no_run
//! use skiff_wal::{LogFile, Record};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (log, recovery) = LogFile::open("replica-0/log.bin").await?;
//!     println!("recovered {} records", recovery.valid_records);
//!
//!     log.append(&Record::new(b"payload".as_slice())).await?;
//!     log.sync().await?;
//!     Ok(())
//! }
//! ```

pub mod log;
pub mod record;
pub mod state_file;

pub use log::{LogFile, RecoveryInfo};
pub use record::{Record, RecordError};
pub use state_file::StateFile;

use thiserror::Error;

/// Errors from the durable-storage layer.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record error: {0}")]
    Record(#[from] RecordError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, WalError>;
