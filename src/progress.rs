//! Progress relay between the yt-dlp child process and the page.
//!
//! The orchestrator turns engine output into [`ProgressEvent`]s and pushes them
//! into a [`ProgressSink`]. [`ProgressRelay`] is the sink the page reads from:
//! it keeps only the latest status and never lets the reported stage or byte
//! count move backwards.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::job::ErrorKind;
use crate::util::human_size;

/// Prefixes written by the `--progress-template` / `--print` arguments we pass to yt-dlp.
pub const DOWNLOAD_MARKER: &str = "[ytmp3:download]";
pub const POSTPROCESS_MARKER: &str = "[ytmp3:postprocess]";
pub const METADATA_MARKER: &str = "[ytmp3:metadata]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Downloading,
    Converting,
    Done,
    Error,
}

impl Stage {
    fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub stage: Stage,
}

impl ProgressEvent {
    pub fn stage(stage: Stage) -> Self {
        Self {
            bytes_done: 0,
            bytes_total: None,
            stage,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);

    /// Record a failure; the stage becomes [`Stage::Error`].
    fn fail(&self, kind: ErrorKind, message: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressStatus {
    pub stage: Stage,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    /// `None` while the total size is unknown.
    pub percent: Option<f64>,
    pub text: String,
    pub error: Option<ErrorReport>,
}

impl Default for ProgressStatus {
    fn default() -> Self {
        Self {
            stage: Stage::Downloading,
            bytes_done: 0,
            bytes_total: None,
            percent: None,
            text: "Preparing...".to_string(),
            error: None,
        }
    }
}

impl ProgressStatus {
    fn apply(&mut self, event: ProgressEvent) {
        if self.stage.is_terminal() || event.stage < self.stage {
            return;
        }
        self.stage = event.stage;
        if event.bytes_total.is_some() {
            self.bytes_total = event.bytes_total;
        }
        self.bytes_done = self.bytes_done.max(event.bytes_done);

        match self.stage {
            Stage::Downloading => {
                self.percent = self
                    .bytes_total
                    .filter(|t| *t > 0)
                    .map(|t| (self.bytes_done as f64 / t as f64 * 100.0).min(100.0));
                self.text = match self.bytes_total {
                    Some(t) => format!(
                        "Downloading... {} / {}",
                        human_size(self.bytes_done),
                        human_size(t)
                    ),
                    None => format!("Downloading... {}", human_size(self.bytes_done)),
                };
            }
            Stage::Converting => {
                self.percent = Some(100.0);
                self.text = "Download complete. Converting to MP3...".to_string();
            }
            Stage::Done => {
                self.percent = Some(100.0);
                self.text = "Ready!".to_string();
            }
            Stage::Error => {
                if self.error.is_none() {
                    self.error = Some(ErrorReport {
                        kind: ErrorKind::Extraction,
                        message: "yt-dlp reported a download error".to_string(),
                    });
                }
                self.text = "Failed".to_string();
            }
        }
    }

    fn record_error(&mut self, kind: ErrorKind, message: &str) {
        if self.stage == Stage::Done {
            return;
        }
        self.stage = Stage::Error;
        self.text = format!("Failed: {message}");
        self.error = Some(ErrorReport {
            kind,
            message: message.to_string(),
        });
    }
}

/// Shared, overwrite-in-place progress state for one session.
#[derive(Debug, Clone, Default)]
pub struct ProgressRelay {
    inner: Arc<Mutex<ProgressStatus>>,
}

impl ProgressRelay {
    pub fn snapshot(&self) -> ProgressStatus {
        match self.inner.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reset(&self) {
        self.with_status(|s| *s = ProgressStatus::default());
    }

    fn with_status(&self, f: impl FnOnce(&mut ProgressStatus)) {
        let mut g = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut g);
    }
}

impl ProgressSink for ProgressRelay {
    fn emit(&self, event: ProgressEvent) {
        self.with_status(|s| s.apply(event));
    }

    fn fail(&self, kind: ErrorKind, message: &str) {
        self.with_status(|s| s.record_error(kind, message));
    }
}

fn parse_bytes(field: &str) -> Option<u64> {
    if let Ok(n) = field.parse::<u64>() {
        return Some(n);
    }
    // Estimates come through as floats ("3145728.0"); "NA" means unknown.
    field
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| f as u64)
}

/// Parse one line of yt-dlp output into a progress event.
///
/// Understands the marker lines produced by our progress templates and the
/// stock `[ExtractAudio]` banner; everything else yields `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(DOWNLOAD_MARKER) {
        let mut fields = rest.split_whitespace();
        let status = fields.next()?;
        let done = fields.next().and_then(parse_bytes).unwrap_or(0);
        let total = fields.next().and_then(parse_bytes);
        let estimate = fields.next().and_then(parse_bytes);
        let stage = match status {
            "downloading" => Stage::Downloading,
            "finished" => Stage::Converting,
            "error" => Stage::Error,
            _ => return None,
        };
        return Some(ProgressEvent {
            bytes_done: done,
            bytes_total: total.or(estimate),
            stage,
        });
    }
    if let Some(rest) = line.strip_prefix(POSTPROCESS_MARKER) {
        return match rest.split_whitespace().next()? {
            "started" | "processing" | "finished" => Some(ProgressEvent::stage(Stage::Converting)),
            _ => None,
        };
    }
    if line.starts_with("[ExtractAudio]") {
        return Some(ProgressEvent::stage(Stage::Converting));
    }
    None
}
