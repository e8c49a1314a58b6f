//! JSON-backed history of finished downloads.
//!
//! The whole list lives in one pretty-printed file. Reads are lock-free, while
//! every mutation runs load+modify+save under a single writer lock so two
//! downloads finishing at the same moment cannot overwrite each other.

use std::{
    cmp::Ordering,
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// One finished download as persisted in the history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: String,
    pub title: String,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub duration: u64,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    pub download_date: String,
    #[serde(default)]
    pub filesize: u64,
    pub url: String,
}

/// Older history files may carry fractional or null durations.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .map(|seconds| seconds as u64)
        .unwrap_or(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Date,
    Size,
    Duration,
}

impl SortKey {
    /// Unknown keys yield `None`, which keeps the on-disk order.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "date" => Some(Self::Date),
            "size" => Some(Self::Size),
            "duration" => Some(Self::Duration),
            _ => None,
        }
    }

    fn compare(self, a: &DownloadRecord, b: &DownloadRecord) -> Ordering {
        match self {
            Self::Date => a.download_date.cmp(&b.download_date),
            Self::Size => a.filesize.cmp(&b.filesize),
            Self::Duration => a.duration.cmp(&b.duration),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// Missing means descending; anything other than `desc` is ascending.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("desc") => Self::Desc,
            Some(_) => Self::Asc,
        }
    }
}

/// Stable sort, so records with equal keys keep their on-disk order.
pub fn sort_records(records: &mut [DownloadRecord], key: Option<SortKey>, order: SortOrder) {
    let Some(key) = key else {
        return;
    };
    match order {
        SortOrder::Asc => records.sort_by(|a, b| key.compare(a, b)),
        SortOrder::Desc => records.sort_by(|a, b| key.compare(b, a)),
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("reading {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("history file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("writing {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("encoding history: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct HistoryStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every record and orders it by `key`/`order`.
    pub fn load(
        &self,
        key: Option<SortKey>,
        order: SortOrder,
    ) -> Result<Vec<DownloadRecord>, HistoryError> {
        let mut records = self.read_all()?;
        sort_records(&mut records, key, order);
        Ok(records)
    }

    /// Overwrites the history file with `records`.
    pub fn save(&self, records: &[DownloadRecord]) -> Result<(), HistoryError> {
        let _guard = self.writer.lock();
        self.write_all(records)
    }

    pub fn find(&self, id: &str) -> Result<Option<DownloadRecord>, HistoryError> {
        Ok(self.read_all()?.into_iter().find(|record| record.id == id))
    }

    /// Appends a record. A record with the same id is replaced so ids stay
    /// unique across the file.
    pub fn append(&self, record: DownloadRecord) -> Result<(), HistoryError> {
        let _guard = self.writer.lock();
        let mut records = self.read_all()?;
        let before = records.len();
        records.retain(|existing| existing.id != record.id);
        if records.len() != before {
            debug!(id = %record.id, "replacing existing history entry");
        }
        records.push(record);
        self.write_all(&records)
    }

    /// Removes the record with `id`, returning it. The file is untouched when
    /// no record matches.
    pub fn remove(&self, id: &str) -> Result<Option<DownloadRecord>, HistoryError> {
        let _guard = self.writer.lock();
        let mut records = self.read_all()?;
        let Some(position) = records.iter().position(|record| record.id == id) else {
            return Ok(None);
        };
        let removed = records.remove(position);
        self.write_all(&records)?;
        Ok(Some(removed))
    }

    fn read_all(&self) -> Result<Vec<DownloadRecord>, HistoryError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HistoryError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&raw).map_err(|source| HistoryError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_all(&self, records: &[DownloadRecord]) -> Result<(), HistoryError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let write_err = |source: io::Error| HistoryError::Write {
            path: self.path.clone(),
            source,
        };

        let tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        let mut writer = BufWriter::new(tmp);
        serde_json::to_writer_pretty(&mut writer, records)?;
        writer.write_all(b"\n").map_err(write_err)?;
        let tmp = writer
            .into_inner()
            .map_err(|err| write_err(err.into_error()))?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path)
            .map_err(|err| write_err(err.error))?;
        debug!(path = %self.path.display(), count = records.len(), "history saved");
        Ok(())
    }
}
