//! Durable, append-only ledger of uploaded files.
//!
//! One UTF-8 record per line: `<timestamp>,<fileName>,<link>`.

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// `dd.MM.yyyy/hh:mm:ss.mmm`, 24-hour clock.
pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y/%H:%M:%S%.3f";

const LINK_PREFIX: &str = "file://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub timestamp: String,
    pub file_name: String,
    pub link: String,
}

impl TableEntry {
    /// Entry for a file stored just now in `upload_dir`.
    pub fn now(file_name: &str, upload_dir: &Path) -> Self {
        Self {
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
            file_name: file_name.to_string(),
            link: link_for(upload_dir, file_name),
        }
    }

    pub fn to_record(&self) -> String {
        format!("{},{},{}", self.timestamp, self.file_name, self.link)
    }

    /// Parse one record. File names may contain commas; the link starts at
    /// the first `,file://` after the timestamp.
    pub fn parse(line: &str) -> Option<Self> {
        let (timestamp, rest) = line.split_once(',')?;
        let (file_name, link) = match rest.find(&format!(",{}", LINK_PREFIX)) {
            Some(at) => (&rest[..at], &rest[at + 1..]),
            None => rest.rsplit_once(',')?,
        };
        Some(Self {
            timestamp: timestamp.to_string(),
            file_name: file_name.to_string(),
            link: link.to_string(),
        })
    }
}

/// `file:///<uploadDir>/<fileName>`, without doubling the root slash.
pub fn link_for(upload_dir: &Path, file_name: &str) -> String {
    let dir = upload_dir.display().to_string();
    format!("{}/{}/{}", LINK_PREFIX, dir.trim_start_matches('/'), file_name)
}

/// Parse a whole snapshot, skipping blank or unparsable lines.
pub fn parse_table(text: &str) -> Vec<TableEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let entry = TableEntry::parse(line);
            if entry.is_none() {
                tracing::warn!(line, "skipping unparsable table row");
            }
            entry
        })
        .collect()
}

/// The server's ledger file. Appends and reads are serialized.
pub struct TableStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl TableStore {
    /// Open the ledger at `path`, creating an empty one if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::persistence(&path, e))?;
        }

        let existed = fs::try_exists(&path).await.unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::persistence(&path, e))?;

        if existed {
            tracing::info!(path = %path.display(), "using existing table file");
        } else {
            tracing::info!(path = %path.display(), "created table file");
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append one record; returns only after it reached the disk.
    pub async fn append(&self, entry: &TableEntry) -> Result<()> {
        let mut line = entry.to_record();
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::persistence(&self.path, e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::persistence(&self.path, e))?;

        tracing::info!(file_name = %entry.file_name, "appended to table");
        Ok(())
    }

    /// The full ledger as stored.
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        let _guard = self.file.lock().await;
        fs::read(&self.path)
            .await
            .map_err(|e| Error::persistence(&self.path, e))
    }

    pub async fn entries(&self) -> Result<Vec<TableEntry>> {
        let snapshot = self.snapshot().await?;
        Ok(parse_table(&String::from_utf8_lossy(&snapshot)))
    }
}
