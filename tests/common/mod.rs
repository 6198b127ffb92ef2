#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempDir;
use ytmp3::config::AppConfig;
use ytmp3::job::ErrorKind;
use ytmp3::progress::{ProgressEvent, ProgressSink};

pub const TEST_URL: &str = "https://www.youtube.com/watch?v=abc123";
pub const FAKE_MP3: &[u8] = b"ID3fake-mp3-payload";

/// Behaves like a successful `yt-dlp -x --audio-format mp3` run.
pub const ENGINE_OK: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
dir="${out%/*}"
echo "[youtube] abc123: Downloading webpage" >&2
echo "[ytmp3:download] downloading 1024 4096 NA"
echo "[ytmp3:download] downloading 4096 4096 NA"
echo "[ytmp3:download] finished 4096 4096 NA"
echo "[ytmp3:postprocess] started ExtractAudio"
printf 'ID3fake-mp3-payload' > "$dir/abc123.mp3"
echo "[ytmp3:postprocess] finished ExtractAudio"
echo "[ytmp3:metadata] {\"id\":\"abc123\",\"title\":\"My / Song: Live?\",\"uploader\":\"Someone\",\"duration\":212,\"filepath\":\"$dir/abc123.mp3\"}"
"#;

pub const ENGINE_PRIVATE_VIDEO: &str = r#"#!/bin/sh
echo "[youtube] abc123: Downloading webpage" >&2
echo "ERROR: [youtube] abc123: Private video. Sign in if you've been granted access to this video" >&2
exit 1
"#;

pub const ENGINE_CONVERSION_FAILS: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
dir="${out%/*}"
echo "[ytmp3:download] downloading 4096 4096 NA"
echo "[ytmp3:download] finished 4096 4096 NA"
printf 'm4a-bytes' > "$dir/abc123.m4a"
echo "ERROR: Postprocessing: audio conversion failed: Error opening output files: Invalid argument" >&2
exit 1
"#;

pub const ENGINE_NO_MP3: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
dir="${out%/*}"
printf 'webm-bytes' > "$dir/abc123.webm"
exit 0
"#;

pub fn engine_slow() -> String {
    ENGINE_OK.replacen("dir=\"${out%/*}\"", "dir=\"${out%/*}\"\n/bin/sleep 1", 1)
}

/// Writes a non UTF-8 warning followed by well over a pipe buffer of stderr
/// chatter before producing the MP3.
pub fn engine_noisy_stderr() -> String {
    let noise = r#"printf 'WARNING: bad byte \377 in title\n' >&2
printf 'garbage \377\376 on stdout\n'
i=0
while [ $i -lt 3000 ]; do
  echo "[debug] padding line $i of chatter that nobody reads" >&2
  i=$((i+1))
done"#;
    ENGINE_OK.replacen("dir=\"${out%/*}\"", &format!("dir=\"${{out%/*}}\"\n{noise}"), 1)
}

/// [`ENGINE_OK`] that first writes its argv, one argument per line, to `log`.
pub fn engine_recording_args(log: &Path) -> String {
    ENGINE_OK.replacen(
        "#!/bin/sh\n",
        &format!("#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\n", log.display()),
        1,
    )
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Scratch area for one test: `root` receives the job temp dirs, `bin` holds
/// the fake yt-dlp and ffmpeg executables.
pub struct Sandbox {
    pub root: TempDir,
    pub bin: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            bin: tempfile::tempdir().unwrap(),
        }
    }

    pub fn config(&self, engine: &str) -> AppConfig {
        let ytdlp = write_script(self.bin.path(), "yt-dlp", engine);
        let ffmpeg = write_script(self.bin.path(), "ffmpeg", "#!/bin/sh\nexit 0\n");
        let mut cfg = AppConfig::default();
        cfg.ytdlp_bin = ytdlp;
        cfg.ffmpeg_bin = Some(ffmpeg);
        cfg.ytdlp_path = self.bin.path().to_string_lossy().to_string();
        cfg.temp_root = Some(self.root.path().to_path_buf());
        cfg
    }

    /// Like [`Sandbox::config`] but with no ffmpeg anywhere on the search path.
    pub fn config_without_ffmpeg(&self, engine: &str) -> AppConfig {
        let mut cfg = self.config(engine);
        std::fs::remove_file(self.bin.path().join("ffmpeg")).unwrap();
        cfg.ffmpeg_bin = None;
        cfg
    }

    pub fn args_log(&self) -> PathBuf {
        self.bin.path().join("argv.txt")
    }

    /// Arguments the fake engine received on its last run.
    pub fn recorded_args(&self) -> Vec<String> {
        std::fs::read_to_string(self.args_log())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn leftovers(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.root.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
    pub failures: Mutex<Vec<(ErrorKind, String)>>,
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn fail(&self, kind: ErrorKind, message: &str) {
        self.failures.lock().unwrap().push((kind, message.to_string()));
    }
}
