//! Turns an engine format listing into the options offered to users.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::debug;

use crate::engine::{Engine, EngineError, EngineFormat};

const UNKNOWN_RESOLUTION: &str = "N/A";

/// Synthetic choices shown ahead of every listing: (format_id, display_name, resolution).
const PRESETS: [(&str, &str, &str); 3] = [
    ("best", "Best quality (may be slower)", "best"),
    ("best[height<=1080]", "1080p (recommended)", "1080p"),
    ("best[height<=720]", "720p (faster)", "720p"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    pub resolution: String,
    pub filesize: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbr: Option<f64>,
    pub display_name: String,
}

impl FormatOption {
    fn preset(format_id: &str, display_name: &str, resolution: &str) -> Self {
        Self {
            format_id: format_id.to_string(),
            ext: None,
            resolution: resolution.to_string(),
            filesize: 0,
            format_note: None,
            fps: None,
            vcodec: None,
            acodec: None,
            tbr: None,
            display_name: display_name.to_string(),
        }
    }

    fn from_engine(format: EngineFormat) -> Self {
        let resolution = format
            .resolution
            .filter(|res| !res.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_RESOLUTION.to_string());
        let mut option = Self {
            format_id: format.format_id,
            ext: Some(format.ext.unwrap_or_default()),
            resolution,
            filesize: format.filesize.unwrap_or(0),
            format_note: Some(format.format_note.unwrap_or_default()),
            fps: format.fps,
            vcodec: Some(format.vcodec.unwrap_or_default()),
            acodec: Some(format.acodec.unwrap_or_else(|| "none".to_string())),
            tbr: Some(format.tbr.unwrap_or(0.0)),
            display_name: String::new(),
        };
        option.display_name = option.describe();
        option
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.resolution != UNKNOWN_RESOLUTION {
            parts.push(self.resolution.clone());
        }
        if let Some(fps) = self.fps.filter(|fps| *fps > 0.0) {
            parts.push(format!("{}fps", compact(fps)));
        }
        if let Some(tbr) = self.tbr.filter(|tbr| *tbr > 0.0) {
            parts.push(format!("{}kbps", tbr.round() as u64));
        }
        if let Some(note) = self.format_note.as_deref().filter(|note| !note.is_empty()) {
            parts.push(note.to_string());
        }
        if self.filesize > 0 {
            parts.push(format!("~{:.1}MB", self.filesize as f64 / 1024.0 / 1024.0));
        }
        parts.join(" - ")
    }

    /// Height from a `WxH` resolution, 0 when there is none.
    pub fn height(&self) -> u32 {
        self.resolution
            .split_once('x')
            .and_then(|(_, height)| height.trim().parse().ok())
            .unwrap_or(0)
    }
}

fn compact(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as u64)
    } else {
        format!("{value}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatListing {
    pub title: String,
    pub formats: Vec<FormatOption>,
}

/// Keeps video-bearing formats, best first, behind the three presets.
pub fn build_options(formats: Vec<EngineFormat>) -> Vec<FormatOption> {
    let mut options: Vec<FormatOption> = formats
        .into_iter()
        .filter(|format| format.vcodec.as_deref() != Some("none"))
        .map(FormatOption::from_engine)
        .collect();

    options.sort_by(|a, b| rank(b, a));

    PRESETS
        .iter()
        .map(|(id, name, resolution)| FormatOption::preset(id, name, resolution))
        .chain(options)
        .collect()
}

fn rank(a: &FormatOption, b: &FormatOption) -> Ordering {
    a.height()
        .cmp(&b.height())
        .then_with(|| a.fps.unwrap_or(0.0).total_cmp(&b.fps.unwrap_or(0.0)))
        .then_with(|| a.tbr.unwrap_or(0.0).total_cmp(&b.tbr.unwrap_or(0.0)))
}

pub async fn list_formats(engine: &dyn Engine, url: &str) -> Result<FormatListing, EngineError> {
    let listing = engine.list_formats(url).await?;
    let reported = listing.formats.len();
    let formats = build_options(listing.formats);
    debug!(url, reported, offered = formats.len(), "format listing built");
    Ok(FormatListing {
        title: listing.title,
        formats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        EngineListing, FailureKind,
        testing::{FetchPlan, ScriptedEngine},
    };

    fn engine_format(id: &str, resolution: Option<&str>, fps: Option<f64>) -> EngineFormat {
        EngineFormat {
            format_id: id.to_string(),
            ext: Some("mp4".into()),
            resolution: resolution.map(str::to_string),
            vcodec: Some("avc1".into()),
            fps,
            ..EngineFormat::default()
        }
    }

    fn ids(options: &[FormatOption]) -> Vec<&str> {
        options.iter().map(|opt| opt.format_id.as_str()).collect()
    }

    #[test]
    fn presets_lead_even_for_empty_listing() {
        let options = build_options(Vec::new());
        assert_eq!(
            ids(&options),
            ["best", "best[height<=1080]", "best[height<=720]"]
        );
        assert_eq!(options[1].resolution, "1080p");
        assert!(options.iter().all(|opt| opt.filesize == 0));
    }

    #[test]
    fn sorts_by_height_then_fps_with_missing_last() {
        let options = build_options(vec![
            engine_format("missing", None, None),
            engine_format("720", Some("1280x720"), Some(60.0)),
            engine_format("1080", Some("1920x1080"), Some(30.0)),
        ]);
        assert_eq!(&ids(&options)[3..], ["1080", "720", "missing"]);
    }

    #[test]
    fn ties_break_on_fps_then_bitrate() {
        let mut slow = engine_format("slow", Some("1280x720"), Some(30.0));
        slow.tbr = Some(900.0);
        let mut rich = engine_format("rich", Some("1280x720"), Some(30.0));
        rich.tbr = Some(2500.0);
        let smooth = engine_format("smooth", Some("1280x720"), Some(60.0));
        let options = build_options(vec![slow, rich, smooth]);
        assert_eq!(&ids(&options)[3..], ["smooth", "rich", "slow"]);
    }

    #[test]
    fn audio_only_formats_are_dropped_but_unknown_codec_kept() {
        let mut audio = engine_format("140", Some("audio only"), None);
        audio.vcodec = Some("none".into());
        let mut unknown = engine_format("x", Some("640x360"), None);
        unknown.vcodec = None;
        let options = build_options(vec![audio, unknown]);
        assert_eq!(&ids(&options)[3..], ["x"]);
        assert_eq!(options[3].vcodec.as_deref(), Some(""));
        assert_eq!(options[3].acodec.as_deref(), Some("none"));
    }

    #[test]
    fn display_name_joins_known_fragments() {
        let format = EngineFormat {
            format_id: "137".into(),
            resolution: Some("1920x1080".into()),
            fps: Some(30.0),
            tbr: Some(4400.6),
            format_note: Some("1080p".into()),
            filesize: Some(10 * 1024 * 1024 + 512 * 1024),
            vcodec: Some("avc1".into()),
            ..EngineFormat::default()
        };
        let option = FormatOption::from_engine(format);
        assert_eq!(
            option.display_name,
            "1920x1080 - 30fps - 4401kbps - 1080p - ~10.5MB"
        );

        let bare = FormatOption::from_engine(EngineFormat {
            format_id: "0".into(),
            ..EngineFormat::default()
        });
        assert_eq!(bare.resolution, "N/A");
        assert_eq!(bare.display_name, "");
    }

    #[test]
    fn presets_serialize_without_engine_fields() {
        let value = serde_json::to_value(&build_options(Vec::new())[0]).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "format_id": "best",
                "resolution": "best",
                "filesize": 0,
                "display_name": "Best quality (may be slower)",
            })
        );
    }

    #[tokio::test]
    async fn lists_through_engine() {
        let engine = ScriptedEngine::with_listing(EngineListing {
            title: "Clip".into(),
            formats: vec![engine_format("18", Some("640x360"), Some(25.0))],
        });
        let listing = list_formats(&engine, "https://example.com/v").await.unwrap();
        assert_eq!(listing.title, "Clip");
        assert_eq!(listing.formats.len(), 4);
        assert_eq!(listing.formats[3].display_name, "640x360 - 25fps");
    }

    #[tokio::test]
    async fn engine_failure_is_passed_through() {
        let engine = ScriptedEngine::new(FetchPlan::NoFile);
        let err = list_formats(&engine, "ftp://nope").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Unsupported);
    }
}
