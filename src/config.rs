use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::job::Bitrate;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub max_concurrent_jobs: usize,

    pub ytdlp_bin: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_bin: Option<PathBuf>,
    // Preferred: explicit yt-dlp proxy (e.g. socks5://127.0.0.1:7890).
    pub ytdlp_proxy: Option<String>,
    // Whether to let yt-dlp inherit http_proxy/https_proxy from the service environment.
    pub inherit_proxy_env: bool,

    // Parent for per-job scratch directories; None means the OS temp dir.
    pub temp_root: Option<PathBuf>,
    // Empty means any http(s) host is accepted.
    pub allowed_hosts: Vec<String>,
    pub default_bitrate: Bitrate,

    pub session_ttl_secs: u64,
    pub session_sweep_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AppConfigFile {
    listen_addr: Option<String>,
    max_concurrent_jobs: Option<usize>,

    ytdlp_bin: Option<String>,
    ytdlp_path: Option<String>,
    ffmpeg_bin: Option<String>,
    ytdlp_proxy: Option<String>,
    inherit_proxy_env: Option<bool>,

    temp_root: Option<String>,
    allowed_hosts: Option<Vec<String>>,
    default_bitrate: Option<u32>,

    session_ttl_secs: Option<u64>,
    session_sweep_secs: Option<u64>,
}

fn default_ytdlp_path() -> String {
    // Prefer inheriting PATH from the service process; override via config.toml when needed
    // (e.g. to include Homebrew ffmpeg).
    std::env::var("PATH").unwrap_or_else(|_| {
        "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string()
    })
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.and_then(|s| {
        let s = s.trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    })
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::build(AppConfigFile::default(), Bitrate::default())
    }
}

impl AppConfig {
    /// Read `path`; a missing file means "use the defaults".
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!(
                "[CONFIG] {} not found, using built-in defaults",
                path.to_string_lossy()
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config file: {}",
                path.to_string_lossy().as_ref()
            )
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: AppConfigFile = toml::from_str(raw).context("Failed to parse config.toml")?;
        Self::from_file(file)
    }

    fn from_file(file: AppConfigFile) -> Result<Self> {
        let default_bitrate = match file.default_bitrate {
            Some(kbps) => Bitrate::try_from(kbps)
                .map_err(|e| anyhow!("Invalid default_bitrate: {}", e))?,
            None => Bitrate::default(),
        };

        let cfg = Self::build(file, default_bitrate);

        if cfg.max_concurrent_jobs == 0 {
            return Err(anyhow!("Invalid max_concurrent_jobs: 0 (expected at least 1)"));
        }
        if cfg.session_sweep_secs == 0 {
            return Err(anyhow!("Invalid session_sweep_secs: 0 (expected at least 1)"));
        }

        Ok(cfg)
    }

    fn build(file: AppConfigFile, default_bitrate: Bitrate) -> Self {
        Self {
            listen_addr: file
                .listen_addr
                .unwrap_or_else(|| "127.0.0.1:8501".to_string()),
            max_concurrent_jobs: file.max_concurrent_jobs.unwrap_or(4),

            ytdlp_bin: PathBuf::from(file.ytdlp_bin.unwrap_or_else(|| "yt-dlp".to_string())),
            ytdlp_path: file.ytdlp_path.unwrap_or_else(default_ytdlp_path),
            ffmpeg_bin: non_blank(file.ffmpeg_bin).map(PathBuf::from),
            ytdlp_proxy: non_blank(file.ytdlp_proxy),
            inherit_proxy_env: file.inherit_proxy_env.unwrap_or(false),

            temp_root: non_blank(file.temp_root).map(PathBuf::from),
            allowed_hosts: file
                .allowed_hosts
                .unwrap_or_else(|| vec!["youtube.com".to_string(), "youtu.be".to_string()])
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            default_bitrate,

            session_ttl_secs: file.session_ttl_secs.unwrap_or(3600),
            session_sweep_secs: file.session_sweep_secs.unwrap_or(60),
        }
    }
}
