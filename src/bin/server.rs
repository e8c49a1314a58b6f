#![forbid(unsafe_code)]

//! Local web front-end: queue downloads, poll their progress, browse and
//! prune the download history, and serve the stored media files.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use grabtube_tools::{
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    engine::{Engine, FailureKind},
    formats::{FormatListing, list_formats},
    history::{DownloadRecord, HistoryStore, SortKey, SortOrder},
    jobs::{JobError, JobRunner, JobSettings},
    library::{DirectoryListing, Library, LibraryError, RecordDiagnostics},
    logging,
    progress::{ProgressReport, ProgressTable},
    security::{ensure_not_root, resolve_under},
    ytdlp::YtDlp,
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SORT: &str = "date";

#[derive(Debug, Parser)]
#[command(name = "server", about = "Local web front-end for yt-dlp downloads")]
struct ServerArgs {
    /// Alternate .env file to read settings from.
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    download_dir: Option<PathBuf>,
    #[arg(long)]
    history_file: Option<PathBuf>,
    #[arg(long)]
    static_dir: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Path to the yt-dlp executable.
    #[arg(long)]
    ytdlp: Option<PathBuf>,
    /// Maximum number of downloads running at once.
    #[arg(long)]
    max_jobs: Option<usize>,
}

impl ServerArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            download_dir: self.download_dir,
            history_file: self.history_file,
            static_dir: self.static_dir,
            host: self.host,
            port: self.port,
            ytdlp: self.ytdlp,
            max_jobs: self.max_jobs,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<dyn Engine>,
    jobs: JobRunner,
    history: Arc<HistoryStore>,
    progress: Arc<ProgressTable>,
    library: Arc<Library>,
    static_dir: Arc<PathBuf>,
    download_dir: Arc<PathBuf>,
}

impl AppState {
    fn new(settings: &RuntimeSettings, engine: Arc<dyn Engine>) -> Self {
        let history = Arc::new(HistoryStore::new(&settings.history_file));
        let progress = Arc::new(ProgressTable::new(settings.progress_ttl));
        let jobs = JobRunner::new(
            Arc::clone(&engine),
            Arc::clone(&history),
            Arc::clone(&progress),
            JobSettings::from(settings),
        );
        let library = Arc::new(Library::new(&settings.download_dir, Arc::clone(&history)));
        Self {
            engine,
            jobs,
            history,
            progress,
            library,
            static_dir: Arc::new(settings.static_dir.clone()),
            download_dir: Arc::new(settings.download_dir.clone()),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    kind: Option<FailureKind>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Maps a library failure; `action` prefixes anything but "not found".
    fn from_library(err: LibraryError, action: &str) -> Self {
        match err {
            LibraryError::NotFound => Self::not_found(err.to_string()),
            other => {
                error!(error = %other, "{action} failed");
                Self::internal(format!("Failed to {action}: {other}"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.message });
        if let Some(kind) = self.kind {
            body["kind"] = json!(kind);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::internal(format!("worker failed: {err}")))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    logging::init(false);
    ensure_not_root("server")?;

    let settings = resolve_runtime_settings(args.into_overrides())?;
    settings.prepare_dirs()?;

    let ytdlp = YtDlp::new(&settings.ytdlp);
    match ytdlp.version().await {
        Ok(version) => info!(%version, program = %ytdlp.program().display(), "found yt-dlp"),
        Err(err) => warn!(error = %err, program = %ytdlp.program().display(), "yt-dlp is not usable; downloads will fail"),
    }

    let state = AppState::new(&settings, Arc::new(ytdlp));
    spawn_progress_sweeper(Arc::clone(&state.progress));
    let app = build_router(state);

    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("expected an IP address for the host, got {}", settings.host))?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(download_dir = %settings.download_dir.display(), "listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running web server")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/download", post(start_download))
        .route("/progress/{id}", get(get_progress))
        .route("/cancel/{job_id}", post(cancel_download))
        .route("/videos", get(list_videos))
        .route("/formats", get(get_formats))
        .route("/delete/{id}", post(delete_video))
        .route("/open_folder/{id}", get(open_folder))
        .route("/debug/video/{id}", get(debug_video))
        .route("/debug/files", get(debug_files))
        .route("/static/{*path}", get(serve_static))
        .route("/downloads/{*path}", get(serve_download))
        .with_state(state)
}

fn spawn_progress_sweeper(progress: Arc<ProgressTable>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = progress.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = progress.len(), "evicted stale progress entries");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

#[derive(Debug, Default, Deserialize)]
struct SortParams {
    sort_by: Option<String>,
    order: Option<String>,
}

impl SortParams {
    fn sort_by(&self) -> &str {
        self.sort_by.as_deref().unwrap_or(DEFAULT_SORT)
    }

    fn order(&self) -> SortOrder {
        SortOrder::parse(self.order.as_deref())
    }
}

async fn load_history(state: &AppState, params: &SortParams) -> ApiResult<Vec<DownloadRecord>> {
    let history = Arc::clone(&state.history);
    let key = SortKey::parse(params.sort_by());
    let order = params.order();
    blocking(move || history.load(key, order))
        .await?
        .map_err(|err| {
            error!(error = %err, "loading history failed");
            ApiError::internal(err.to_string())
        })
}

async fn home(
    State(state): State<AppState>,
    Query(params): Query<SortParams>,
) -> ApiResult<Html<String>> {
    let records = load_history(&state, &params).await?;
    let order = match params.order() {
        SortOrder::Asc => "asc",
        SortOrder::Desc => "desc",
    };
    Ok(Html(render_home(&records, params.sort_by(), order)))
}

async fn list_videos(
    State(state): State<AppState>,
    Query(params): Query<SortParams>,
) -> ApiResult<Json<Vec<DownloadRecord>>> {
    Ok(Json(load_history(&state, &params).await?))
}

/// Unwraps a query extraction, reporting malformed queries in the JSON error shape.
fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    url: String,
    format_id: Option<String>,
}

async fn start_download(
    State(state): State<AppState>,
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let params = query_params(params)?;
    let url = params.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("url must not be empty"));
    }
    match state.jobs.start(url, params.format_id.as_deref()) {
        Ok(handle) => Ok(Json(json!({
            "message": "Download started",
            "job_id": handle.job_id(),
        }))),
        Err(err @ JobError::AlreadyActive(_)) => {
            Err(ApiError::new(StatusCode::CONFLICT, err.to_string()))
        }
        Err(err) => Err(ApiError::internal(err.to_string()).with_kind(err.kind())),
    }
}

async fn get_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Json<ProgressReport> {
    Json(state.progress.get(&id))
}

async fn cancel_download(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    if state.jobs.cancel(&job_id) {
        Ok(Json(json!({ "message": "Download cancelled" })))
    } else {
        Err(ApiError::not_found("Job not found"))
    }
}

#[derive(Debug, Deserialize)]
struct FormatsParams {
    url: String,
}

async fn get_formats(
    State(state): State<AppState>,
    params: Result<Query<FormatsParams>, QueryRejection>,
) -> ApiResult<Json<FormatListing>> {
    let params = query_params(params)?;
    list_formats(state.engine.as_ref(), params.url.trim())
        .await
        .map(Json)
        .map_err(|err| {
            warn!(url = %params.url, error = %err, "format listing failed");
            ApiError::new(StatusCode::BAD_GATEWAY, "Failed to get video formats").with_kind(err.kind())
        })
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let library = Arc::clone(&state.library);
    blocking(move || library.delete(&id))
        .await?
        .map_err(|err| ApiError::from_library(err, "delete video"))?;
    Ok(Json(json!({ "message": "Video deleted successfully" })))
}

async fn open_folder(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    state
        .library
        .open_folder(&id)
        .await
        .map_err(|err| ApiError::from_library(err, "open folder"))?;
    Ok(Json(json!({ "message": "Folder opened successfully" })))
}

async fn debug_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<RecordDiagnostics>> {
    let library = Arc::clone(&state.library);
    blocking(move || library.describe(&id))
        .await?
        .map(Json)
        .map_err(|err| ApiError::from_library(err, "describe video"))
}

async fn debug_files(State(state): State<AppState>) -> ApiResult<Json<DirectoryListing>> {
    let library = Arc::clone(&state.library);
    Ok(Json(blocking(move || library.list_files()).await?))
}

async fn serve_static(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let file = resolve_under(&state.static_dir, &path)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_file(file, &headers).await
}

async fn serve_download(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let file = resolve_under(&state.download_dir, &path)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    stream_file(file, &headers).await
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}

async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        Body::from_stream(ReaderStream::new(file)).into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = guessed
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // "-N" asks for the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn clock(seconds: u64) -> String {
    let (hours, minutes, secs) = (seconds / 3600, seconds / 60 % 60, seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

fn sort_link(label: &str, key: &str, current_key: &str, current_order: &str) -> String {
    let order = if key == current_key && current_order == "desc" {
        "asc"
    } else {
        "desc"
    };
    format!("<a href=\"/?sort_by={key}&amp;order={order}\">{label}</a>")
}

fn render_home(records: &[DownloadRecord], sort_by: &str, order: &str) -> String {
    let mut rows = String::new();
    for record in records {
        let thumb = record
            .thumbnail_url
            .as_deref()
            .map(|url| format!("<img src=\"{}\" alt=\"\" loading=\"lazy\">", escape_html(url)))
            .unwrap_or_default();
        let id = escape_html(&record.id);
        rows.push_str(&format!(
            concat!(
                "<tr data-id=\"{id}\"><td>{thumb}</td>",
                "<td><a href=\"/downloads/{file}\">{title}</a><br><small>{uploader}</small></td>",
                "<td>{duration}</td><td>{size}</td><td>{date}</td>",
                "<td><button onclick=\"openFolder(this.closest('tr').dataset.id)\">Open folder</button>",
                "<button onclick=\"deleteVideo(this.closest('tr').dataset.id)\">Delete</button></td></tr>\n"
            ),
            id = id,
            thumb = thumb,
            file = urlencoding::encode(&record.filename),
            title = escape_html(&record.title),
            uploader = escape_html(record.uploader.as_deref().unwrap_or("")),
            duration = clock(record.duration),
            size = human_size(record.filesize),
            date = escape_html(record.download_date.get(..19).unwrap_or(&record.download_date)),
        ));
    }
    if records.is_empty() {
        rows.push_str("<tr><td colspan=\"6\">No downloads yet.</td></tr>\n");
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>grabtube</title>
<link rel="stylesheet" href="/static/style.css">
</head>
<body>
<h1>grabtube</h1>
<form id="download-form">
  <input id="url" type="url" placeholder="Video URL" required>
  <button type="button" onclick="loadFormats()">Formats</button>
  <select id="format"><option value="best">Best quality</option></select>
  <button type="submit">Download</button>
</form>
<div id="status"></div>
<table>
<thead><tr><th></th><th>Title</th><th>{duration}</th><th>{size}</th><th>{date}</th><th></th></tr></thead>
<tbody>
{rows}</tbody>
</table>
<script>
const q = (id) => document.getElementById(id);
async function loadFormats() {{
  const res = await fetch('/formats?url=' + encodeURIComponent(q('url').value));
  const data = await res.json();
  if (data.error) {{ q('status').textContent = data.error; return; }}
  q('format').innerHTML = data.formats
    .map(f => `<option value="${{f.format_id}}">${{f.display_name}}</option>`).join('');
}}
async function poll(jobId) {{
  const data = await (await fetch('/progress/' + jobId)).json();
  q('status').textContent = data.status + ' ' + Math.round(data.percent || 0) + '%';
  if (data.status === 'finished') {{ location.reload(); return; }}
  if (data.status === 'failed') {{ q('status').textContent = 'failed: ' + data.error.message; return; }}
  setTimeout(() => poll(jobId), 1000);
}}
q('download-form').addEventListener('submit', async (event) => {{
  event.preventDefault();
  const params = new URLSearchParams({{ url: q('url').value, format_id: q('format').value }});
  const data = await (await fetch('/download?' + params, {{ method: 'POST' }})).json();
  if (data.error) {{ q('status').textContent = data.error; return; }}
  poll(data.job_id);
}});
async function deleteVideo(id) {{
  if (!confirm('Delete this video?')) return;
  await fetch('/delete/' + encodeURIComponent(id), {{ method: 'POST' }});
  location.reload();
}}
async function openFolder(id) {{
  await fetch('/open_folder/' + encodeURIComponent(id));
}}
</script>
</body>
</html>
"#,
        duration = sort_link("Duration", "duration", sort_by, order),
        size = sort_link("Size", "size", sort_by, order),
        date = sort_link("Date", "date", sort_by, order),
        rows = rows,
    )
}
