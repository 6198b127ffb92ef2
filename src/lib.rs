//! Paste a video link, get an MP3: yt-dlp fetches the best audio stream and
//! FFmpeg converts it, all behind a single web page.

pub mod config;
pub mod handlers;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod session;
pub mod state;
pub mod util;
