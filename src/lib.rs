#![forbid(unsafe_code)]

//! Shared building blocks for the grabtube binaries: a local web front-end
//! (`server`) and a one-shot command line tool (`grab`) that both drive
//! yt-dlp and keep a JSON history of finished downloads.

pub mod config;
pub mod engine;
pub mod formats;
pub mod history;
pub mod jobs;
pub mod library;
pub mod logging;
pub mod progress;
pub mod security;
pub mod ytdlp;
