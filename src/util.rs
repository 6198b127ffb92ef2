use std::path::{Path, PathBuf};

/// Upper bound for a sanitized name, in bytes. The ".mp3" suffix still fits
/// under the 255 byte limit common to Linux, macOS and Windows filesystems.
pub const MAX_FILENAME_BYTES: usize = 200;

pub const FALLBACK_FILENAME: &str = "audio";

const RESERVED_WINDOWS_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn is_forbidden(c: char) -> bool {
    matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

fn is_reserved_stem(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_WINDOWS_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(stem.trim_end()))
}

fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Turns a media title into a file name that is safe on every common filesystem.
///
/// Path separators, wildcard/quote characters and control characters are dropped,
/// whitespace runs collapse to one space, leading and trailing dots/spaces are
/// removed and Windows device names get a `_` prefix. The result is at most
/// [`MAX_FILENAME_BYTES`] long, never empty, and `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_space = false;
    for c in title.chars().filter(|c| !is_forbidden(*c) || c.is_whitespace()) {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches(&[' ', '.'][..]);
    let mut name = if is_reserved_stem(trimmed) {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    };

    truncate_at_char_boundary(&mut name, MAX_FILENAME_BYTES);
    let end = name.trim_end_matches(&[' ', '.'][..]).len();
    name.truncate(end);

    if name.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        name
    }
}

pub fn human_size(num: u64) -> String {
    let mut value = num as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

/// Resolve ffmpeg: an explicit configured path wins, otherwise every entry of
/// `search_path` is probed for an executable `ffmpeg` (or `ffmpeg.exe`).
pub fn find_ffmpeg(explicit: Option<&Path>, search_path: &str) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return is_executable(p).then(|| p.to_path_buf());
    }
    std::env::split_paths(search_path)
        .flat_map(|dir| [dir.join("ffmpeg"), dir.join("ffmpeg.exe")])
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(p)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(p: &Path) -> bool {
    p.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_well_formed(input: &str) {
        let out = sanitize(input);
        assert!(!out.is_empty(), "empty output for {input:?}");
        assert!(out.len() <= MAX_FILENAME_BYTES, "too long for {input:?}");
        assert!(!out.chars().any(is_forbidden), "forbidden char in {out:?}");
        assert_eq!(sanitize(&out), out, "not idempotent for {input:?}");
    }

    #[test]
    fn strips_path_separators_and_wildcards() {
        assert_eq!(sanitize(r#"AC/DC: Back in Black? <Live> "1980" |HQ|*"#), "ACDC Back in Black Live 1980 HQ");
        assert_eq!(sanitize("..\\..\\etc\\passwd"), "etcpasswd");
    }

    #[test]
    fn keeps_unicode_and_emoji() {
        assert_eq!(sanitize("Café del Mar 🎵 ミックス"), "Café del Mar 🎵 ミックス");
    }

    #[test]
    fn collapses_whitespace_and_control_chars() {
        assert_eq!(sanitize("  a\t\tb\n\r c\u{7}d  "), "a b cd");
    }

    #[test]
    fn falls_back_when_nothing_survives() {
        assert_eq!(sanitize(""), FALLBACK_FILENAME);
        assert_eq!(sanitize("///???"), FALLBACK_FILENAME);
        assert_eq!(sanitize(" . .. "), FALLBACK_FILENAME);
    }

    #[test]
    fn prefixes_windows_device_names() {
        assert_eq!(sanitize("con"), "_con");
        assert_eq!(sanitize("LPT1.mix"), "_LPT1.mix");
        assert_eq!(sanitize("Console"), "Console");
    }

    #[test]
    fn bounds_length_on_char_boundary() {
        let long = "é".repeat(500);
        let out = sanitize(&long);
        assert!(out.len() <= MAX_FILENAME_BYTES);
        assert_eq!(out.chars().count(), MAX_FILENAME_BYTES / 2);
    }

    #[test]
    fn output_is_always_well_formed() {
        let long_mixed = format!("{}. . .{}", "word ".repeat(60), "🎶".repeat(80));
        let cases = [
            "Rick Astley - Never Gonna Give You Up (Official Music Video)",
            "...hidden",
            "trailing dots...",
            "CON",
            "aux.",
            "/",
            "\u{0}\u{1}\u{1f}",
            "a/b\\c:d*e?f\"g<h>i|j",
            long_mixed.as_str(),
        ];
        for case in cases {
            assert_well_formed(case);
        }
    }

    const TITLE_PIECES: &[&str] = &[
        "/", "\\", ":", "*", "?", "\"", "<", ">", "|", " ", "\t", "\n", "\u{0}", "\u{7f}",
        "\u{a0}", ".", "..", "a", "Z", "é", "🎵", "ミ", "CON", "nul", "Lpt9", "com1.", "_",
    ];

    #[test]
    fn every_short_combination_is_well_formed() {
        for a in TITLE_PIECES {
            for b in TITLE_PIECES {
                for c in TITLE_PIECES {
                    assert_well_formed(&format!("{a}{b}{c}"));
                }
            }
        }
    }

    #[test]
    fn random_long_titles_are_well_formed() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
        for _ in 0..2000 {
            let len = rng.gen_range(0..160);
            let title: String = (0..len)
                .map(|_| TITLE_PIECES[rng.gen_range(0..TITLE_PIECES.len())])
                .collect();
            assert_well_formed(&title);
        }
    }

    #[test]
    fn human_size_picks_unit() {
        assert_eq!(human_size(0), "0.0 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[cfg(unix)]
    #[test]
    fn finds_ffmpeg_on_search_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        assert!(find_ffmpeg(None, dir.path().to_str().unwrap()).is_none());

        let bin = dir.path().join("ffmpeg");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let search = format!("/nonexistent-dir:{}", dir.path().display());
        assert_eq!(find_ffmpeg(None, &search), Some(bin.clone()));
        assert_eq!(find_ffmpeg(Some(&bin), ""), Some(bin));
        assert!(find_ffmpeg(Some(Path::new("/nonexistent/ffmpeg")), &search).is_none());
    }
}
