//! The boundary between the job layer and whatever actually fetches media.
//!
//! Everything the core needs from the extractor goes through [`Engine`]:
//! a metadata-only format listing and a fetch that streams progress events
//! and ends in a typed [`FetchOutcome`] or a classified [`EngineError`].

use std::{io, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Coarse reason a job failed, published to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Unsupported,
    Network,
    Extraction,
    MissingOutput,
    Cancelled,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("video not found: {0}")]
    NotFound(String),
    #[error("unsupported url: {0}")]
    Unsupported(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("running the engine: {0}")]
    Process(#[source] io::Error),
    #[error("unreadable engine output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("download cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotFound(_) => FailureKind::NotFound,
            Self::Unsupported(_) => FailureKind::Unsupported,
            Self::Network(_) => FailureKind::Network,
            Self::Extraction(_) | Self::Parse(_) => FailureKind::Extraction,
            Self::Process(_) => FailureKind::Internal,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// A single encoding as reported by the engine, before any normalization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EngineFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default, deserialize_with = "lenient_bytes")]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub tbr: Option<f64>,
}

fn lenient_bytes<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|bytes| bytes.is_finite() && *bytes >= 0.0)
        .map(|bytes| bytes as u64))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineListing {
    pub title: String,
    #[serde(default)]
    pub formats: Vec<EngineFormat>,
}

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub format_selector: String,
    /// Full output path template, e.g. `/dl/%(title)s.%(ext)s`.
    pub output_template: PathBuf,
    pub merge_format: String,
}

/// Progress callbacks delivered while a fetch runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Downloading {
        video_id: String,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed: f64,
        eta: u64,
    },
    /// One raw transfer finished; muxing may follow.
    Finished { video_id: String },
}

/// Successful fetch. Every field the history needs is required here.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub id: String,
    pub title: String,
    pub duration: u64,
    pub uploader: Option<String>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub final_path: PathBuf,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Metadata-only query; no media bytes are fetched.
    async fn list_formats(&self, url: &str) -> Result<EngineListing, EngineError>;

    /// Fetches and muxes `request.url`, reporting progress into `sink`.
    /// Must return [`EngineError::Cancelled`] promptly once `cancel` fires.
    async fn fetch(
        &self,
        request: &FetchRequest,
        sink: &(dyn Fn(TransferEvent) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, EngineError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_classified() {
        assert_eq!(EngineError::NotFound("x".into()).kind(), FailureKind::NotFound);
        assert_eq!(
            EngineError::Unsupported("x".into()).kind(),
            FailureKind::Unsupported
        );
        assert_eq!(EngineError::Network("x".into()).kind(), FailureKind::Network);
        assert_eq!(EngineError::Cancelled.kind(), FailureKind::Cancelled);
        assert_eq!(
            EngineError::Process(io::Error::other("boom")).kind(),
            FailureKind::Internal
        );
    }

    #[test]
    fn engine_format_tolerates_nulls_and_float_sizes() {
        let raw = r#"{"format_id": "137", "ext": "mp4", "resolution": "1920x1080",
            "filesize": 1048576.0, "fps": null, "vcodec": "avc1", "tbr": 4400.5}"#;
        let format: EngineFormat = serde_json::from_str(raw).unwrap();
        assert_eq!(format.filesize, Some(1_048_576));
        assert_eq!(format.fps, None);
        assert_eq!(format.acodec, None);
        assert_eq!(format.tbr, Some(4400.5));
    }

    #[test]
    fn listing_requires_title() {
        assert!(serde_json::from_str::<EngineListing>(r#"{"formats": []}"#).is_err());
        let listing: EngineListing = serde_json::from_str(r#"{"title": "T"}"#).unwrap();
        assert!(listing.formats.is_empty());
    }
}
