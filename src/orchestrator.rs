use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::config::AppConfig;
use crate::job::{Bitrate, JobError, JobRequest, MediaMetadata};
use crate::progress::{
    parse_progress_line, ProgressEvent, ProgressSink, Stage, DOWNLOAD_MARKER, METADATA_MARKER,
    POSTPROCESS_MARKER,
};
use crate::util;

const STDERR_TAIL_LINES: usize = 50;
const OTHER_AUDIO_EXTENSIONS: &[&str] = &["m4a", "webm", "opus", "ogg", "wav", "aac"];

/// A finished MP3 waiting to be served. The file lives in its own temporary
/// directory, which is deleted when the artifact (or its [`TempDir`]) is dropped.
#[derive(Debug)]
pub struct Artifact {
    dir: TempDir,
    path: PathBuf,
    pub title: String,
    pub file_name: String,
    pub size: u64,
    pub bitrate: Bitrate,
    pub metadata: MediaMetadata,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Hand over ownership of the backing directory so a response body can keep it alive.
    pub fn into_parts(self) -> (TempDir, PathBuf) {
        (self.dir, self.path)
    }
}

struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(STDERR_TAIL_LINES),
        }
    }

    fn push(&mut self, line: &str) {
        if self.lines.len() >= STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn render(&self) -> String {
        if self.lines.is_empty() {
            return "no stderr output captured".to_string();
        }
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn build_ytdlp_base_command(cfg: &AppConfig) -> Command {
    let mut cmd = Command::new(&cfg.ytdlp_bin);
    cmd.env("PATH", &cfg.ytdlp_path);

    if !cfg.inherit_proxy_env {
        // Avoid being accidentally bound to a dead local proxy (common in shell env).
        cmd.env_remove("http_proxy")
            .env_remove("https_proxy")
            .env_remove("HTTP_PROXY")
            .env_remove("HTTPS_PROXY")
            .env_remove("no_proxy")
            .env_remove("NO_PROXY");
    }

    if let Some(p) = &cfg.ytdlp_proxy {
        cmd.arg("--proxy").arg(p);
    }

    cmd.arg("--no-playlist")
        .arg("--no-cache-dir")
        .arg("--no-part")
        .arg("--newline");

    cmd
}

fn build_ytdlp_command(
    cfg: &AppConfig,
    request: &JobRequest,
    ffmpeg: &Path,
    work_dir: &Path,
) -> Command {
    let mut cmd = build_ytdlp_base_command(cfg);

    let mut pp_args = String::from("ExtractAudio:-vn");
    if request.normalize() {
        // EBU R128 loudness normalisation.
        pp_args.push_str(" -af loudnorm");
    }

    // The media title is unknown until yt-dlp resolves it, so the scratch file
    // is named by id and renamed once the title is printed.
    let out_template = work_dir.join("%(id)s.%(ext)s");

    cmd.arg("-f")
        .arg("bestaudio/best")
        .arg("--ffmpeg-location")
        .arg(ffmpeg)
        .arg("--extract-audio")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--audio-quality")
        .arg(format!("{}K", request.bitrate().kbps()))
        .arg("--postprocessor-args")
        .arg(pp_args)
        .arg("-o")
        .arg(out_template)
        .arg("--progress")
        .arg("--progress-template")
        .arg(format!(
            "download:{DOWNLOAD_MARKER} %(progress.status)s %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s"
        ))
        .arg("--progress-template")
        .arg(format!(
            "postprocess:{POSTPROCESS_MARKER} %(progress.status)s %(progress.postprocessor)s"
        ))
        .arg("--no-simulate")
        .arg("--print")
        .arg(format!(
            "after_move:{METADATA_MARKER} %(.{{id,title,uploader,channel,duration,webpage_url,upload_date,filepath}})j"
        ))
        .arg(request.url().as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf).trim_end().to_string();
    buf.clear();
    line
}

fn handle_engine_line(line: &str, sink: &dyn ProgressSink, metadata: &mut Option<MediaMetadata>) {
    if let Some(event) = parse_progress_line(line) {
        sink.emit(event);
        return;
    }
    if let Some(raw) = line.trim().strip_prefix(METADATA_MARKER) {
        match serde_json::from_str::<MediaMetadata>(raw.trim()) {
            Ok(m) => *metadata = Some(m),
            Err(e) => log::warn!("[YTDLP] Unreadable metadata line ({}): {}", e, raw),
        }
    }
}

/// Pick the error class from yt-dlp's stderr. Missing/failed FFmpeg shows up as a
/// post-processing error; everything else means the source could not be fetched.
fn classify_failure(status: ExitStatus, tail: &StderrTail) -> JobError {
    const CONVERSION_MARKERS: &[&str] = &[
        "ffmpeg not found",
        "ffprobe and ffmpeg not found",
        "ffprobe not found",
        "postprocessing:",
        "conversion failed",
    ];

    let rendered = tail.render();
    let reason = tail
        .lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .map(|l| l.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| format!("yt-dlp exited with error (status={})", status));

    let lower = rendered.to_ascii_lowercase();
    if CONVERSION_MARKERS.iter().any(|m| lower.contains(m)) {
        JobError::Conversion {
            message: reason,
            stderr_tail: Some(rendered),
        }
    } else {
        JobError::Extraction {
            message: reason,
            stderr_tail: Some(rendered),
        }
    }
}

fn has_extension(p: &Path, wanted: &str) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

/// Locate the MP3 yt-dlp produced, or explain why there is none.
async fn find_output(work_dir: &Path, metadata: &MediaMetadata) -> Result<PathBuf, JobError> {
    if let Some(p) = &metadata.filepath {
        if p.starts_with(work_dir) && has_extension(p, "mp3") && tokio::fs::metadata(p).await.is_ok() {
            return Ok(p.clone());
        }
    }

    let mut mp3: Option<PathBuf> = None;
    let mut other_audio: Vec<String> = Vec::new();

    let mut entries = tokio::fs::read_dir(work_dir)
        .await
        .map_err(|e| JobError::filesystem("Failed to read work dir", e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| JobError::filesystem("Failed to scan work dir", e))?
    {
        let p = entry.path();
        if has_extension(&p, "mp3") {
            mp3.get_or_insert(p);
        } else if OTHER_AUDIO_EXTENSIONS.iter().any(|ext| has_extension(&p, ext)) {
            other_audio.push(entry.file_name().to_string_lossy().to_string());
        }
    }

    match mp3 {
        Some(p) => Ok(p),
        None if !other_audio.is_empty() => Err(JobError::Conversion {
            message: format!(
                "audio download succeeded but no MP3 was produced (found: {}); check the FFmpeg installation",
                other_audio.join(", ")
            ),
            stderr_tail: None,
        }),
        None => Err(JobError::Extraction {
            message: "no audio files found in the output directory".to_string(),
            stderr_tail: None,
        }),
    }
}

/// `ID3` tag or an MPEG audio frame sync.
pub fn looks_like_mp3(header: &[u8]) -> bool {
    header.starts_with(b"ID3") || (header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0)
}

async fn verify_mp3(path: &Path) -> Result<u64, JobError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| JobError::filesystem("MP3 output missing", e))?;
    if meta.len() == 0 {
        return Err(JobError::Conversion {
            message: "conversion produced an empty file".to_string(),
            stderr_tail: None,
        });
    }

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| JobError::filesystem("Failed to open MP3 output", e))?;
    let mut header = Vec::with_capacity(3);
    file.take(3)
        .read_to_end(&mut header)
        .await
        .map_err(|e| JobError::filesystem("Failed to read MP3 output", e))?;
    if !looks_like_mp3(&header) {
        return Err(JobError::Conversion {
            message: "output is not a valid MP3 stream".to_string(),
            stderr_tail: None,
        });
    }
    Ok(meta.len())
}

fn scratch_dir(cfg: &AppConfig, prefix: &str) -> Result<TempDir, JobError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let dir = match &cfg.temp_root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    };
    dir.map_err(|e| JobError::filesystem("Failed to create temporary directory", e))
}

async fn move_into(src: &Path, dest: &Path) -> Result<(), JobError> {
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    // Different filesystems; the source goes away with the work dir.
    tokio::fs::copy(src, dest)
        .await
        .map(|_| ())
        .map_err(|e| JobError::filesystem("Failed to move MP3 into place", e))
}

/// Fetch best audio for `request` and convert it to MP3.
///
/// Progress goes to `sink`; on failure the sink also receives the error kind and
/// message. The scratch directory is removed on every exit path.
pub async fn run(
    request: &JobRequest,
    cfg: &AppConfig,
    sink: &dyn ProgressSink,
) -> Result<Artifact, JobError> {
    let outcome = run_inner(request, cfg, sink).await;
    match &outcome {
        Ok(artifact) => {
            log::info!(
                "[JOB] Done: {} ({})",
                artifact.file_name,
                util::human_size(artifact.size)
            );
            sink.emit(ProgressEvent::stage(Stage::Done));
        }
        Err(e) => {
            log::warn!("[JOB] Failed ({}): {}", e.kind(), e);
            sink.fail(e.kind(), &e.to_string());
        }
    }
    outcome
}

async fn run_inner(
    request: &JobRequest,
    cfg: &AppConfig,
    sink: &dyn ProgressSink,
) -> Result<Artifact, JobError> {
    let ffmpeg = util::find_ffmpeg(cfg.ffmpeg_bin.as_deref(), &cfg.ytdlp_path)
        .ok_or(JobError::ConverterMissing)?;

    let work_dir = scratch_dir(cfg, "ytmp3-")?;
    let mut cmd = build_ytdlp_command(cfg, request, &ffmpeg, work_dir.path());

    log::info!(
        "[JOB] Start: url={} bitrate={} normalize={}",
        request.url(),
        request.bitrate(),
        request.normalize()
    );

    let mut child = cmd.spawn().map_err(|e| JobError::EngineMissing {
        bin: cfg.ytdlp_bin.to_string_lossy().to_string(),
        source: e,
    })?;
    if let Some(pid) = child.id() {
        log::debug!("[YTDLP] started (pid={})", pid);
    }

    sink.emit(ProgressEvent::stage(Stage::Downloading));

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(o), Some(e)) => (o, e),
        _ => {
            return Err(JobError::filesystem(
                "Failed to capture yt-dlp output",
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing pipe"),
            ))
        }
    };

    let mut out_reader = BufReader::new(stdout);
    let mut err_reader = BufReader::new(stderr);
    let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
    let mut tail = StderrTail::new();
    let mut metadata: Option<MediaMetadata> = None;
    let (mut out_open, mut err_open) = (true, true);

    // With --print yt-dlp runs quietly and may route progress to either stream.
    // Both pipes are drained to EOF; lines are decoded lossily.
    while out_open || err_open {
        tokio::select! {
            read = out_reader.read_until(b'\n', &mut out_buf), if out_open => match read {
                Ok(0) => out_open = false,
                Ok(_) => {
                    let l = take_line(&mut out_buf);
                    handle_engine_line(&l, sink, &mut metadata);
                }
                Err(e) => return Err(JobError::filesystem("Failed reading yt-dlp stdout", e)),
            },
            read = err_reader.read_until(b'\n', &mut err_buf), if err_open => match read {
                Ok(0) => err_open = false,
                Ok(_) => {
                    let l = take_line(&mut err_buf);
                    if !l.is_empty() {
                        log::debug!("[YTDLP] {}", l);
                        handle_engine_line(&l, sink, &mut metadata);
                        tail.push(&l);
                    }
                }
                Err(e) => return Err(JobError::filesystem("Failed reading yt-dlp stderr", e)),
            },
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| JobError::filesystem("Failed waiting for yt-dlp", e))?;
    if !status.success() {
        return Err(classify_failure(status, &tail));
    }

    let metadata = metadata.unwrap_or_default();
    let produced = find_output(work_dir.path(), &metadata).await?;
    let size = verify_mp3(&produced).await?;

    let title = metadata
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| util::FALLBACK_FILENAME.to_string());
    let file_name = format!("{}.mp3", util::sanitize(&title));

    let out_dir = scratch_dir(cfg, "ytmp3-out-")?;
    let dest = out_dir.path().join(&file_name);
    move_into(&produced, &dest).await?;

    work_dir
        .close()
        .map_err(|e| JobError::filesystem("Failed to remove temporary directory", e))?;

    Ok(Artifact {
        dir: out_dir,
        path: dest,
        title,
        file_name,
        size,
        bitrate: request.bitrate(),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tail_of(lines: &[&str]) -> StderrTail {
        let mut t = StderrTail::new();
        for l in lines {
            t.push(l);
        }
        t
    }

    #[cfg(unix)]
    fn failed_status() -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(1 << 8)
    }

    #[test]
    fn tail_keeps_last_lines_only() {
        let mut t = StderrTail::new();
        assert_eq!(t.render(), "no stderr output captured");
        for i in 0..(STDERR_TAIL_LINES + 5) {
            t.push(&format!("line {i}"));
        }
        assert_eq!(t.lines.len(), STDERR_TAIL_LINES);
        assert_eq!(t.lines.front().map(String::as_str), Some("line 5"));
    }

    #[cfg(unix)]
    #[test]
    fn private_video_is_an_extraction_error() {
        let tail = tail_of(&[
            "[youtube] abc: Downloading webpage",
            "ERROR: [youtube] abc: Private video. Sign in if you've been granted access to this video",
        ]);
        match classify_failure(failed_status(), &tail) {
            JobError::Extraction { message, stderr_tail } => {
                assert!(message.starts_with("[youtube] abc: Private video"));
                assert!(stderr_tail.unwrap().contains("Downloading webpage"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_problems_are_conversion_errors() {
        for line in [
            "ERROR: Postprocessing: audio conversion failed: Error opening output files",
            "ERROR: ffprobe and ffmpeg not found. Please install or provide the path using --ffmpeg-location",
        ] {
            let err = classify_failure(failed_status(), &tail_of(&[line]));
            assert!(matches!(err, JobError::Conversion { .. }), "{line}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn silent_failure_reports_exit_status() {
        let err = classify_failure(failed_status(), &tail_of(&[]));
        assert!(err.to_string().contains("yt-dlp exited with error"));
    }

    #[test]
    fn recognises_mp3_headers() {
        assert!(looks_like_mp3(b"ID3\x04\x00"));
        assert!(looks_like_mp3(&[0xFF, 0xFB, 0x90]));
        assert!(!looks_like_mp3(b"\x1aE\xdf\xa3"));
        assert!(!looks_like_mp3(b"ftypM4A"));
        assert!(!looks_like_mp3(&[]));
    }

    #[tokio::test]
    async fn find_output_diagnoses_missing_mp3() {
        let dir = tempfile::tempdir().unwrap();
        let none = find_output(dir.path(), &MediaMetadata::default()).await.unwrap_err();
        assert!(matches!(none, JobError::Extraction { .. }));

        std::fs::write(dir.path().join("abc.m4a"), b"....").unwrap();
        let conv = find_output(dir.path(), &MediaMetadata::default()).await.unwrap_err();
        assert!(matches!(conv, JobError::Conversion { .. }));
        assert!(conv.to_string().contains("abc.m4a"));

        std::fs::write(dir.path().join("abc.mp3"), b"ID3").unwrap();
        let found = find_output(dir.path(), &MediaMetadata::default()).await.unwrap();
        assert_eq!(found, dir.path().join("abc.mp3"));
    }

    #[test]
    fn engine_lines_are_decoded_lossily() {
        let mut buf = b"WARNING: bad byte \xff here\r\n".to_vec();
        assert_eq!(take_line(&mut buf), "WARNING: bad byte \u{fffd} here");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn unreadable_work_dir_is_a_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("plain-file");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let err = find_output(&not_a_dir, &MediaMetadata::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::job::ErrorKind::Filesystem);
    }

    #[tokio::test]
    async fn verify_rejects_empty_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.mp3");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(verify_mp3(&empty).await, Err(JobError::Conversion { .. })));

        let webm = dir.path().join("fake.mp3");
        std::fs::write(&webm, b"\x1aE\xdf\xa3 webm").unwrap();
        assert!(matches!(verify_mp3(&webm).await, Err(JobError::Conversion { .. })));

        let good = dir.path().join("good.mp3");
        std::fs::write(&good, b"ID3 payload").unwrap();
        assert_eq!(verify_mp3(&good).await.unwrap(), 11);
    }
}
