//! Failsafe log for statements the database rejected.
//!
//! Each record is written as
//!
//! ```text
//! ### 2024-05-01 12:00:00
//! UPDATE ss_user SET ...;
//! ###end
//! ```
//!
//! and is meant for manual replay. The file is never read back.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::error::{RelayError, Result};

pub fn format_record(at: DateTime<Local>, sql: &str) -> String {
    format!("### {}\n{}\n###end\n", at.format("%Y-%m-%d %H:%M:%S"), sql)
}

pub struct FailsafeLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FailsafeLog {
    /// Open for append, creating the file. Fails early when the location is
    /// not writable.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(RelayError::FailsafeWriteFailed)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. A failure here means usage can no longer be kept.
    pub async fn append(&self, sql: &str) -> Result<()> {
        let record = format_record(Local::now(), sql);
        let mut file = self.file.lock().await;
        let written = match file.write_all(record.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| {
            error!(path = %self.path.display(), error = %e, "Failed to write failsafe log");
            RelayError::FailsafeWriteFailed(e)
        })
    }
}
