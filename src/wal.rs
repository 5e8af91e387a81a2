//! Write-ahead log collaborator.
//!
//! The engine only consumes the append half of the WAL; replay and
//! truncation live with the log's owner. Records are length-prefixed
//! bincode frames.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Append interface consumed by the stores.
pub trait WalAppend: Send + Sync {
    fn append(&self, record: &WalRecord) -> Result<()>;
}

/// One logged mutation, keys and values in their packed page form.
#[derive(Debug, Serialize, Deserialize)]
pub enum WalRecord {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

/// Append-only file log.
pub struct FileWal {
    file: Mutex<File>,
}

impl FileWal {
    pub fn open(path: &Path) -> Result<FileWal> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(FileWal {
            file: Mutex::new(file),
        })
    }
}

impl WalAppend for FileWal {
    fn append(&self, record: &WalRecord) -> Result<()> {
        let frame = bincode::serialize(record).expect("wal record serialization cannot fail");
        let mut file = self.file.lock();
        file.write_all(&(frame.len() as u32).to_le_bytes())?;
        file.write_all(&frame)?;
        Ok(())
    }
}
