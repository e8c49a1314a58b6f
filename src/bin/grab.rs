#![forbid(unsafe_code)]

//! One-shot command line front-end: list formats, fetch a single URL, or
//! print the download history.

use std::{path::PathBuf, pin::pin, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use grabtube_tools::{
    config::{RuntimeOverrides, resolve_runtime_settings},
    formats::list_formats,
    history::{DownloadRecord, HistoryStore, SortKey, SortOrder},
    jobs::{JobRunner, JobSettings},
    logging,
    progress::{ProgressReport, ProgressStatus, ProgressTable},
    security::ensure_not_root,
    ytdlp::YtDlp,
};
use tokio::signal;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "grab", about = "Download videos with yt-dlp and keep a history")]
struct Cli {
    /// Alternate .env file to read settings from.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    history_file: Option<PathBuf>,
    /// Path to the yt-dlp executable.
    #[arg(long, global = true)]
    ytdlp: Option<PathBuf>,
    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the formats offered for a URL.
    Formats { url: String },
    /// Download a URL into the download directory.
    Download {
        url: String,
        #[arg(long)]
        format_id: Option<String>,
    },
    /// Print the download history.
    History {
        #[arg(long, value_enum, default_value_t = SortArg::Date)]
        sort_by: SortArg,
        #[arg(long, value_enum, default_value_t = OrderArg::Desc)]
        order: OrderArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SortArg {
    Date,
    Size,
    Duration,
}

impl From<SortArg> for SortKey {
    fn from(value: SortArg) -> Self {
        match value {
            SortArg::Date => SortKey::Date,
            SortArg::Size => SortKey::Size,
            SortArg::Duration => SortKey::Duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OrderArg {
    Asc,
    Desc,
}

impl From<OrderArg> for SortOrder {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Asc => SortOrder::Asc,
            OrderArg::Desc => SortOrder::Desc,
        }
    }
}

impl Cli {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            download_dir: self.download_dir.clone(),
            history_file: self.history_file.clone(),
            ytdlp: self.ytdlp.clone(),
            env_path: self.env_file.clone(),
            max_jobs: Some(1),
            ..RuntimeOverrides::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    ensure_not_root("grab")?;

    let settings = resolve_runtime_settings(cli.overrides())?;
    match cli.command {
        Command::Formats { url } => {
            let engine = YtDlp::new(&settings.ytdlp);
            let listing = list_formats(&engine, &url)
                .await
                .with_context(|| format!("listing formats for {url}"))?;
            println!("{}", listing.title);
            for format in &listing.formats {
                println!("{:<24} {}", format.format_id, format.display_name);
            }
        }
        Command::Download { url, format_id } => {
            settings.prepare_dirs()?;
            let history = Arc::new(HistoryStore::new(&settings.history_file));
            let progress = Arc::new(ProgressTable::new(settings.progress_ttl));
            let runner = JobRunner::new(
                Arc::new(YtDlp::new(&settings.ytdlp)),
                history,
                Arc::clone(&progress),
                JobSettings::from(&settings),
            );
            let record = download(&runner, &progress, &url, format_id.as_deref()).await?;
            println!(
                "{} -> {}",
                record.title,
                settings.download_dir.join(&record.filename).display()
            );
        }
        Command::History { sort_by, order } => {
            let history = HistoryStore::new(&settings.history_file);
            let records = history.load(Some(sort_by.into()), order.into())?;
            if records.is_empty() {
                println!("No downloads yet.");
            }
            for record in &records {
                println!("{}", history_line(record));
            }
        }
    }

    Ok(())
}

/// Runs one job to completion, printing progress and cancelling on Ctrl+C.
async fn download(
    runner: &JobRunner,
    progress: &ProgressTable,
    url: &str,
    format_id: Option<&str>,
) -> Result<DownloadRecord> {
    let handle = runner.start(url, format_id)?;
    let job_id = handle.job_id().to_string();
    let cancel = handle.cancel_token();
    info!(%job_id, url, "download started");

    let mut wait = pin!(handle.wait());
    let mut interrupted = pin!(signal::ctrl_c());
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last_line = String::new();

    loop {
        tokio::select! {
            result = &mut wait => {
                return match result {
                    Ok(record) => Ok(record),
                    Err(err) if cancel.is_cancelled() => bail!("download cancelled: {err}"),
                    Err(err) => Err(err).with_context(|| format!("downloading {url}")),
                };
            }
            _ = &mut interrupted, if !cancel.is_cancelled() => {
                warn!(%job_id, "interrupt received, cancelling download");
                cancel.cancel();
            }
            _ = ticker.tick() => {
                let line = progress_line(&progress.get(&job_id));
                if line != last_line {
                    eprintln!("{line}");
                    last_line = line;
                }
            }
        }
    }
}

fn progress_line(report: &ProgressReport) -> String {
    match report {
        ProgressReport::Known(snapshot) => match snapshot.status {
            ProgressStatus::Downloading => format!(
                "downloading {:>5.1}%  {:.1} MiB/s  eta {}s",
                snapshot.percent,
                snapshot.speed / 1024.0 / 1024.0,
                snapshot.eta
            ),
            ProgressStatus::Failed => match &snapshot.error {
                Some(failure) => format!("failed: {}", failure.message),
                None => "failed".to_string(),
            },
            ProgressStatus::Queued => "queued".to_string(),
            ProgressStatus::Merging => "merging".to_string(),
            ProgressStatus::Finished => "finished".to_string(),
            ProgressStatus::NotFound => "waiting".to_string(),
        },
        ProgressReport::Missing(_) => "waiting".to_string(),
    }
}

fn history_line(record: &DownloadRecord) -> String {
    format!(
        "{}  {:>10}  {:>6}s  {}  [{}]",
        record.download_date.get(..19).unwrap_or(&record.download_date),
        record.filesize,
        record.duration,
        record.title,
        record.id
    )
}
