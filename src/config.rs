#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_HISTORY_FILE: &str = "download_history.json";
pub const DEFAULT_STATIC_DIR: &str = "static";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_MAX_JOBS: usize = 3;
pub const DEFAULT_PROGRESS_TTL_SECS: u64 = 600;
pub const DEFAULT_SETTLE_MS: u64 = 2000;

/// Everything the binaries need to know about where files live and how the
/// download engine should be driven.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub download_dir: PathBuf,
    pub history_file: PathBuf,
    pub static_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp: PathBuf,
    pub max_jobs: usize,
    pub progress_ttl: Duration,
    pub settle_delay: Duration,
}

impl RuntimeSettings {
    /// Creates the download and static directories (and the history file's
    /// parent) so later requests never race on a missing folder.
    pub fn prepare_dirs(&self) -> Result<()> {
        for dir in [&self.download_dir, &self.static_dir] {
            fs::create_dir_all(dir).with_context(|| format!("Creating {}", dir.display()))?;
        }
        if let Some(parent) = self.history_file.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Creating {}", parent.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_dir: Option<PathBuf>,
    pub history_file: Option<PathBuf>,
    pub static_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp: Option<PathBuf>,
    pub max_jobs: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    let mut settings = build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides);
    settings.download_dir = std::path::absolute(&settings.download_dir)
        .with_context(|| format!("Resolving {}", settings.download_dir.display()))?;
    Ok(settings)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let path_value = |override_value: Option<PathBuf>, key: &str, default: &str| {
        override_value
            .or_else(|| lookup_value(key, file_vars, &env_lookup).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(default))
    };

    let download_dir = path_value(
        overrides.download_dir,
        "GRABTUBE_DOWNLOAD_DIR",
        DEFAULT_DOWNLOAD_DIR,
    );
    let history_file = path_value(
        overrides.history_file,
        "GRABTUBE_HISTORY_FILE",
        DEFAULT_HISTORY_FILE,
    );
    let static_dir = path_value(
        overrides.static_dir,
        "GRABTUBE_STATIC_DIR",
        DEFAULT_STATIC_DIR,
    );
    let ytdlp = path_value(overrides.ytdlp, "GRABTUBE_YTDLP", DEFAULT_YTDLP);

    let port = overrides
        .port
        .or_else(|| lookup_parsed("GRABTUBE_PORT", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup_value("GRABTUBE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let max_jobs = overrides
        .max_jobs
        .or_else(|| lookup_parsed("GRABTUBE_MAX_JOBS", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_MAX_JOBS)
        .max(1);
    let ttl_secs = lookup_parsed("GRABTUBE_PROGRESS_TTL_SECS", file_vars, &env_lookup)
        .unwrap_or(DEFAULT_PROGRESS_TTL_SECS);
    let settle_ms =
        lookup_parsed("GRABTUBE_SETTLE_MS", file_vars, &env_lookup).unwrap_or(DEFAULT_SETTLE_MS);

    RuntimeSettings {
        download_dir,
        history_file,
        static_dir,
        host,
        port,
        ytdlp,
        max_jobs,
        progress_ttl: Duration::from_secs(ttl_secs),
        settle_delay: Duration::from_millis(settle_ms),
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

fn lookup_parsed<T: FromStr>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    lookup_value(key, file_vars, env_lookup).and_then(|value| value.trim().parse::<T>().ok())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None)
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = settings_from("");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.download_dir, PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        assert_eq!(settings.history_file, PathBuf::from(DEFAULT_HISTORY_FILE));
        assert_eq!(settings.static_dir, PathBuf::from(DEFAULT_STATIC_DIR));
        assert_eq!(settings.ytdlp, PathBuf::from(DEFAULT_YTDLP));
        assert_eq!(settings.max_jobs, DEFAULT_MAX_JOBS);
        assert_eq!(
            settings.progress_ttl,
            Duration::from_secs(DEFAULT_PROGRESS_TTL_SECS)
        );
        assert_eq!(settings.settle_delay, Duration::from_millis(DEFAULT_SETTLE_MS));
    }

    #[test]
    fn reads_values_from_env_file() {
        let settings = settings_from(
            "GRABTUBE_DOWNLOAD_DIR=\"/media/dl\"\nGRABTUBE_PORT=\"9090\"\nGRABTUBE_MAX_JOBS=5\nGRABTUBE_SETTLE_MS=0\n",
        );
        assert_eq!(settings.download_dir, PathBuf::from("/media/dl"));
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.max_jobs, 5);
        assert_eq!(settings.settle_delay, Duration::ZERO);
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("GRABTUBE_DOWNLOAD_DIR=\"/file\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            if key == "GRABTUBE_DOWNLOAD_DIR" {
                Some("/env".to_string())
            } else {
                None
            }
        });
        assert_eq!(settings.download_dir, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export GRABTUBE_DOWNLOAD_DIR="/media"
            GRABTUBE_STATIC_DIR='/www'
            GRABTUBE_HOST =  "0.0.0.0"
            GRABTUBE_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("GRABTUBE_DOWNLOAD_DIR").unwrap(), "/media");
        assert_eq!(vars.get("GRABTUBE_STATIC_DIR").unwrap(), "/www");
        assert_eq!(vars.get("GRABTUBE_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("GRABTUBE_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut vars = HashMap::new();
        vars.insert("GRABTUBE_DOWNLOAD_DIR".to_string(), "/file-dl".to_string());
        vars.insert("GRABTUBE_HOST".to_string(), "file-host".to_string());
        vars.insert("GRABTUBE_PORT".to_string(), "7000".to_string());
        vars.insert("GRABTUBE_YTDLP".to_string(), "/opt/yt-dlp".to_string());

        let overrides = RuntimeOverrides {
            download_dir: Some(PathBuf::from("/override-dl")),
            port: Some(9000),
            host: Some("override-host".into()),
            ..RuntimeOverrides::default()
        };

        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "GRABTUBE_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        );

        assert_eq!(settings.download_dir, PathBuf::from("/override-dl"));
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host, "override-host");
        assert_eq!(settings.ytdlp, PathBuf::from("/opt/yt-dlp"));
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let settings = build_runtime_settings_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(settings.host, DEFAULT_HOST);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from("GRABTUBE_PORT=\"nope\"\nGRABTUBE_MAX_JOBS=many\n");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.max_jobs, DEFAULT_MAX_JOBS);
    }

    #[test]
    fn zero_max_jobs_is_clamped_to_one() {
        let settings = settings_from("GRABTUBE_MAX_JOBS=0\n");
        assert_eq!(settings.max_jobs, 1);
    }

    #[test]
    fn prepare_dirs_creates_folders() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_from("");
        settings.download_dir = dir.path().join("downloads");
        settings.static_dir = dir.path().join("static");
        settings.history_file = dir.path().join("state/history.json");
        settings.prepare_dirs().unwrap();
        assert!(settings.download_dir.is_dir());
        assert!(settings.static_dir.is_dir());
        assert!(dir.path().join("state").is_dir());
    }
}
