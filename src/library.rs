//! Maintenance over stored downloads: deleting, diagnosing and revealing
//! files that the history points at.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    history::{DownloadRecord, HistoryError, HistoryStore},
    security::is_safe_segment,
};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Video not found")]
    NotFound,
    #[error("refusing to touch unsafe file name {0:?}")]
    UnsafeFileName(String),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("launching {program}: {source}")]
    Launch {
        program: String,
        source: io::Error,
    },
}

/// Everything known about one history entry and its file.
#[derive(Debug, Clone, Serialize)]
pub struct RecordDiagnostics {
    pub video_info: DownloadRecord,
    pub file_exists: bool,
    pub absolute_path: String,
    pub download_dir: String,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub exists: bool,
    pub size: Option<u64>,
    pub path: String,
    pub is_file: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryListing {
    pub download_dir: String,
    pub files: Vec<FileEntry>,
    pub dir_exists: bool,
    pub dir_is_absolute: bool,
}

/// Platform file manager used to reveal a folder.
pub fn folder_opener() -> &'static str {
    if cfg!(target_os = "windows") {
        "explorer"
    } else if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    }
}

pub struct Library {
    download_dir: PathBuf,
    history: Arc<HistoryStore>,
    opener: String,
}

impl Library {
    pub fn new(download_dir: impl Into<PathBuf>, history: Arc<HistoryStore>) -> Self {
        Self {
            download_dir: download_dir.into(),
            history,
            opener: folder_opener().to_string(),
        }
    }

    /// Replaces the program launched by [`Library::open_folder`].
    pub fn with_opener(mut self, program: impl Into<String>) -> Self {
        self.opener = program.into();
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn lookup(&self, id: &str) -> Result<(DownloadRecord, PathBuf), LibraryError> {
        let record = self.history.find(id)?.ok_or(LibraryError::NotFound)?;
        if !is_safe_segment(&record.filename) {
            return Err(LibraryError::UnsafeFileName(record.filename));
        }
        let path = self.download_dir.join(&record.filename);
        Ok((record, path))
    }

    /// Removes the media file (if still present) and then the history entry.
    /// Unknown ids change nothing.
    pub fn delete(&self, id: &str) -> Result<DownloadRecord, LibraryError> {
        let (_, path) = self.lookup(id)?;
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed media file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "media file already gone");
            }
            Err(source) => {
                return Err(LibraryError::Io {
                    action: "removing",
                    path,
                    source,
                });
            }
        }
        let removed = self.history.remove(id)?.ok_or(LibraryError::NotFound)?;
        info!(id, title = %removed.title, "deleted download");
        Ok(removed)
    }

    pub fn describe(&self, id: &str) -> Result<RecordDiagnostics, LibraryError> {
        let (record, path) = self.lookup(id)?;
        let metadata = fs::metadata(&path).ok();
        Ok(RecordDiagnostics {
            video_info: record,
            file_exists: metadata.is_some(),
            absolute_path: display_absolute(&path),
            download_dir: display_absolute(&self.download_dir),
            file_size: metadata.map(|meta| meta.len()),
        })
    }

    /// Lists the entries directly inside the download directory, by name.
    pub fn list_files(&self) -> DirectoryListing {
        let dir_exists = self.download_dir.is_dir();
        let files = if dir_exists {
            WalkDir::new(&self.download_dir)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .map(|entry| {
                    let metadata = entry.metadata().ok();
                    FileEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        exists: metadata.is_some(),
                        size: metadata.as_ref().map(|meta| meta.len()),
                        path: entry.path().to_string_lossy().into_owned(),
                        is_file: entry.file_type().is_file(),
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        DirectoryListing {
            download_dir: self.download_dir.to_string_lossy().into_owned(),
            files,
            dir_exists,
            dir_is_absolute: self.download_dir.is_absolute(),
        }
    }

    /// Launches the file manager on the folder holding the record's file and
    /// returns that folder.
    pub async fn open_folder(&self, id: &str) -> Result<PathBuf, LibraryError> {
        let (_, path) = self.lookup(id)?;
        let folder = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.download_dir.clone());

        let mut child = Command::new(&self.opener)
            .arg(&folder)
            .spawn()
            .map_err(|source| LibraryError::Launch {
                program: self.opener.clone(),
                source,
            })?;
        let program = self.opener.clone();
        tokio::spawn(async move {
            if let Err(err) = child.wait().await {
                warn!(%program, error = %err, "file manager did not exit cleanly");
            }
        });
        info!(id, folder = %folder.display(), "opened folder");
        Ok(folder)
    }
}

fn display_absolute(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}
