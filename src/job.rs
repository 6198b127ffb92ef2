use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// MP3 bitrates offered by the page, in kbps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u32")]
pub enum Bitrate {
    K64,
    K96,
    K128,
    K160,
    K192,
    K256,
    K320,
}

impl Bitrate {
    pub const ALL: [Bitrate; 7] = [
        Bitrate::K64,
        Bitrate::K96,
        Bitrate::K128,
        Bitrate::K160,
        Bitrate::K192,
        Bitrate::K256,
        Bitrate::K320,
    ];

    pub fn kbps(self) -> u32 {
        match self {
            Bitrate::K64 => 64,
            Bitrate::K96 => 96,
            Bitrate::K128 => 128,
            Bitrate::K160 => 160,
            Bitrate::K192 => 192,
            Bitrate::K256 => 256,
            Bitrate::K320 => 320,
        }
    }
}

impl Default for Bitrate {
    fn default() -> Self {
        Bitrate::K192
    }
}

impl From<Bitrate> for u32 {
    fn from(b: Bitrate) -> u32 {
        b.kbps()
    }
}

impl TryFrom<u32> for Bitrate {
    type Error = JobError;

    fn try_from(kbps: u32) -> Result<Self, Self::Error> {
        Bitrate::ALL
            .into_iter()
            .find(|b| b.kbps() == kbps)
            .ok_or(JobError::UnsupportedBitrate(kbps))
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} kbps", self.kbps())
    }
}

/// One user submission. Only constructible through [`JobRequest::new`], so a
/// value of this type has already passed validation.
#[derive(Debug, Clone)]
pub struct JobRequest {
    url: Url,
    bitrate: Bitrate,
    normalize: bool,
}

impl JobRequest {
    pub fn new(
        raw_url: &str,
        bitrate_kbps: u32,
        normalize: bool,
        allowed_hosts: &[String],
    ) -> Result<Self, JobError> {
        let url = validate_url(raw_url, allowed_hosts)?;
        let bitrate = Bitrate::try_from(bitrate_kbps)?;
        Ok(Self {
            url,
            bitrate,
            normalize,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn bitrate(&self) -> Bitrate {
        self.bitrate
    }

    pub fn normalize(&self) -> bool {
        self.normalize
    }
}

/// Accepts http(s) URLs whose host is in `allowed_hosts` (or a subdomain of
/// one). An empty allow-list accepts any host.
pub fn validate_url(raw: &str, allowed_hosts: &[String]) -> Result<Url, JobError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(JobError::InvalidUrl("missing url".to_string()));
    }
    let url = Url::parse(raw).map_err(|e| JobError::InvalidUrl(format!("{raw}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(JobError::InvalidUrl(format!(
            "{raw}: only http and https links are supported"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| JobError::InvalidUrl(format!("{raw}: no host")))?
        .to_ascii_lowercase();

    if allowed_hosts.is_empty() {
        return Ok(url);
    }
    let allowed = allowed_hosts.iter().any(|h| {
        let h = h.trim().trim_start_matches('.').to_ascii_lowercase();
        host == h || host.ends_with(&format!(".{h}"))
    });
    if !allowed {
        return Err(JobError::UnsupportedHost {
            host,
            allowed: allowed_hosts.join(", "),
        });
    }
    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Extraction,
    Conversion,
    Filesystem,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Extraction => "extraction",
            ErrorKind::Conversion => "conversion",
            ErrorKind::Filesystem => "filesystem",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Please enter a valid video URL ({0})")]
    InvalidUrl(String),

    #[error("Links from {host} are not supported (allowed: {allowed})")]
    UnsupportedHost { host: String, allowed: String },

    #[error("Unsupported bitrate {0} kbps (allowed: 64, 96, 128, 160, 192, 256, 320)")]
    UnsupportedBitrate(u32),

    #[error("Failed to start yt-dlp ({bin}): {source}")]
    EngineMissing {
        bin: String,
        #[source]
        source: io::Error,
    },

    #[error("Download failed: {message}")]
    Extraction {
        message: String,
        stderr_tail: Option<String>,
    },

    #[error("FFmpeg was not found on the search path; install it or set ffmpeg_bin in config.toml")]
    ConverterMissing,

    #[error("MP3 conversion failed: {message}")]
    Conversion {
        message: String,
        stderr_tail: Option<String>,
    },

    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::InvalidUrl(_)
            | JobError::UnsupportedHost { .. }
            | JobError::UnsupportedBitrate(_) => ErrorKind::Validation,
            JobError::EngineMissing { .. } | JobError::Extraction { .. } => ErrorKind::Extraction,
            JobError::ConverterMissing | JobError::Conversion { .. } => ErrorKind::Conversion,
            JobError::Filesystem { .. } => ErrorKind::Filesystem,
        }
    }

    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            JobError::Extraction { stderr_tail, .. } | JobError::Conversion { stderr_tail, .. } => {
                stderr_tail.as_deref()
            }
            _ => None,
        }
    }

    pub(crate) fn filesystem(context: impl Into<String>, source: io::Error) -> Self {
        JobError::Filesystem {
            context: context.into(),
            source,
        }
    }
}

/// Fields yt-dlp prints about the media once the MP3 has been moved into place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default, alias = "duration")]
    pub duration_sec: Option<f64>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default, skip_serializing)]
    pub filepath: Option<PathBuf>,
}
