//! [`Engine`] implementation that drives the `yt-dlp` executable.
//!
//! Format listings come from `--dump-single-json`. Downloads run with a custom
//! `--progress-template` so every progress line is machine readable, and a
//! final `--print after_move:` line hands back the metadata of the stored file.

use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{
    Engine, EngineError, EngineListing, FetchOutcome, FetchRequest, TransferEvent,
};

const PROGRESS_PREFIX: &str = "grabtube-progress:";
const INFO_PREFIX: &str = "grabtube-info:";
const RETRIES: &str = "10";
const FRAGMENT_RETRIES: &str = "10";

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    /// Runs `yt-dlp --version`; used at startup to warn about a missing binary.
    pub async fn version(&self) -> Result<String, EngineError> {
        let output = self
            .command()
            .arg("--version")
            .output()
            .await
            .map_err(EngineError::Process)?;
        if !output.status.success() {
            return Err(classify_failure(
                &String::from_utf8_lossy(&output.stderr),
                output.status,
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Engine for YtDlp {
    async fn list_formats(&self, url: &str) -> Result<EngineListing, EngineError> {
        let output = self
            .command()
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg(url)
            .output()
            .await
            .map_err(EngineError::Process)?;

        if !output.status.success() {
            return Err(classify_failure(
                &String::from_utf8_lossy(&output.stderr),
                output.status,
            ));
        }

        let listing: EngineListing = serde_json::from_slice(&output.stdout)?;
        debug!(url, formats = listing.formats.len(), "yt-dlp listed formats");
        Ok(listing)
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        sink: &(dyn Fn(TransferEvent) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, EngineError> {
        let mut child = self
            .command()
            .args(fetch_args(request))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(EngineError::Process)?;
        info!(url = %request.url, format = %request.format_selector, "yt-dlp started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Extraction("yt-dlp stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Extraction("yt-dlp stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(collect_lines(stderr));

        let mut lines = BufReader::new(stdout).lines();
        let mut printed: Option<PrintedInfo> = None;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(EngineError::Cancelled);
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "reading yt-dlp output failed");
                    break;
                }
            };

            match parse_line(&line) {
                OutputLine::Progress(event) => sink(event),
                OutputLine::Info(info) => printed = Some(*info),
                OutputLine::Other => debug!(line = %line, "yt-dlp"),
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(EngineError::Cancelled);
            }
            status = child.wait() => status.map_err(EngineError::Process)?,
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        match printed {
            Some(info) => {
                if !status.success() {
                    warn!(%status, "yt-dlp reported errors but produced a file");
                }
                info.into_outcome()
            }
            None if status.success() => Err(EngineError::Extraction(
                "yt-dlp finished without reporting a file".into(),
            )),
            None => Err(classify_failure(&stderr_text, status)),
        }
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut buf = String::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        buf.push_str(&line);
        buf.push('\n');
    }
    buf
}

fn progress_template() -> String {
    format!(
        "download:{PROGRESS_PREFIX}%(progress.status)s|%(info.id)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s"
    )
}

fn info_template() -> String {
    format!(
        "after_move:{INFO_PREFIX}%(.{{id,title,duration,uploader,description,thumbnail,thumbnails,filepath}})j"
    )
}

fn fetch_args(request: &FetchRequest) -> Vec<String> {
    vec![
        "--format".into(),
        request.format_selector.clone(),
        "--output".into(),
        request.output_template.to_string_lossy().into_owned(),
        "--merge-output-format".into(),
        request.merge_format.clone(),
        "--recode-video".into(),
        request.merge_format.clone(),
        "--no-check-certificate".into(),
        "--retries".into(),
        RETRIES.into(),
        "--fragment-retries".into(),
        FRAGMENT_RETRIES.into(),
        "--skip-unavailable-fragments".into(),
        "--ignore-errors".into(),
        "--no-playlist".into(),
        "--no-simulate".into(),
        "--newline".into(),
        "--progress".into(),
        "--progress-template".into(),
        progress_template(),
        "--print".into(),
        info_template(),
        request.url.clone(),
    ]
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: Option<String>,
}

/// The `--print after_move:` payload. `id` and `title` are mandatory.
#[derive(Debug, Deserialize)]
struct PrintedInfo {
    id: String,
    title: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Option<Vec<Thumbnail>>,
    #[serde(default)]
    filepath: Option<String>,
}

impl PrintedInfo {
    fn into_outcome(self) -> Result<FetchOutcome, EngineError> {
        let final_path = self
            .filepath
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::Extraction(format!("no output path for {}", self.id)))?;
        let thumbnail = self.thumbnail.or_else(|| {
            self.thumbnails
                .and_then(|thumbs| thumbs.into_iter().rev().find_map(|thumb| thumb.url))
        });
        Ok(FetchOutcome {
            id: self.id,
            title: self.title,
            duration: self
                .duration
                .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
                .map(|seconds| seconds as u64)
                .unwrap_or(0),
            uploader: self.uploader,
            description: self.description,
            thumbnail,
            final_path,
        })
    }
}

#[derive(Debug)]
enum OutputLine {
    Progress(TransferEvent),
    Info(Box<PrintedInfo>),
    Other,
}

fn parse_line(line: &str) -> OutputLine {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix(PROGRESS_PREFIX) {
        return parse_progress(rest)
            .map(OutputLine::Progress)
            .unwrap_or(OutputLine::Other);
    }
    if let Some(rest) = trimmed.strip_prefix(INFO_PREFIX) {
        return match serde_json::from_str::<PrintedInfo>(rest) {
            Ok(info) => OutputLine::Info(Box::new(info)),
            Err(err) => {
                warn!(error = %err, "could not parse yt-dlp info line");
                OutputLine::Other
            }
        };
    }
    OutputLine::Other
}

fn parse_progress(rest: &str) -> Option<TransferEvent> {
    let mut fields = rest.split('|').map(str::trim);
    let status = fields.next()?;
    let video_id = fields.next().filter(|id| !id.is_empty() && *id != "NA")?;
    let downloaded = fields.next().and_then(number);
    let total = fields.next().and_then(number);
    let estimate = fields.next().and_then(number);
    let speed = fields.next().and_then(number);
    let eta = fields.next().and_then(number);

    match status {
        "downloading" => Some(TransferEvent::Downloading {
            video_id: video_id.to_string(),
            downloaded_bytes: downloaded.map(|bytes| bytes as u64).unwrap_or(0),
            total_bytes: total.or(estimate).map(|bytes| bytes as u64).unwrap_or(0),
            speed: speed.unwrap_or(0.0),
            eta: eta.map(|seconds| seconds as u64).unwrap_or(0),
        }),
        "finished" => Some(TransferEvent::Finished {
            video_id: video_id.to_string(),
        }),
        _ => None,
    }
}

/// yt-dlp prints `NA` for unknown values.
fn number(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
}

/// Maps yt-dlp's stderr onto a failure class.
fn classify_failure(stderr: &str, status: ExitStatus) -> EngineError {
    let message = stderr
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with("ERROR:"))
        .or_else(|| stderr.lines().rev().find(|line| !line.trim().is_empty()))
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"));
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        EngineError::Unsupported(message)
    } else if lower.contains("video unavailable")
        || lower.contains("http error 404")
        || lower.contains("does not exist")
        || lower.contains("private video")
    {
        EngineError::NotFound(message)
    } else if lower.contains("unable to download")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("http error")
        || lower.contains("name or service not known")
        || lower.contains("network is unreachable")
    {
        EngineError::Network(message)
    } else {
        EngineError::Extraction(message)
    }
}
