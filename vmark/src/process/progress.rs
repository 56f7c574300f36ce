//! Progress-line recognition.
//!
//! A progress predicate only decides how a line is displayed and whether it is
//! captured; it never influences scheduling.

use std::sync::{Arc, LazyLock};

use regex::Regex;

/// Classifies an output line as progress (`true`) or diagnostic text.
pub type ProgressPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

static UPLOAD_PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[KMG]?B/s.*\s+in\s+").unwrap());

/// Predicate for ffmpeg status lines.
pub fn ffmpeg() -> ProgressPredicate {
    Arc::new(is_ffmpeg_progress)
}

/// Predicate for the storage CLI's transfer status lines.
pub fn upload() -> ProgressPredicate {
    Arc::new(is_upload_progress)
}

/// Build a predicate from any closure.
pub fn from_fn<F>(f: F) -> ProgressPredicate
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// FFmpeg progress format:
/// `frame=X fps=X q=X size=XkB time=HH:MM:SS.ms bitrate=Xkbits/s speed=Xx`
///
/// `time=` plus `frame=` or `size=` is required so unrelated lines mentioning
/// a time are not swallowed.
pub fn is_ffmpeg_progress(line: &str) -> bool {
    line.contains("time=") && (line.contains("frame=") || line.contains("size="))
}

/// Upload tool lines look like `↑ 12.5MB/100MB 2.1MB/s in 6s, left 40s ...`.
pub fn is_upload_progress(line: &str) -> bool {
    UPLOAD_PROGRESS.is_match(line)
}

/// Parse time string in HH:MM:SS.ms format to seconds.
///
/// ```ignore
/// assert_eq!(parse_time("00:00:10.50"), Some(10.5));
/// assert_eq!(parse_time("invalid"), None);
/// ```
pub fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse the `time=` field of an ffmpeg status line.
pub fn parse_time_field(line: &str) -> Option<f64> {
    let time_start = line.find("time=")?;
    let time_str = &line[time_start + 5..];
    let end = time_str.find(' ').unwrap_or(time_str.len());
    parse_time(&time_str[..end])
}

/// Parse the `speed=` multiplier (e.g. `speed=1.25x`).
pub fn parse_speed(line: &str) -> Option<f64> {
    let speed_start = line.find("speed=")?;
    let speed_str = &line[speed_start + 6..];
    let end = speed_str.find('x')?;
    speed_str[..end].trim().parse().ok()
}

/// Parse the `frame=` counter.
pub fn parse_frame(line: &str) -> Option<u64> {
    let frame_start = line.find("frame=")?;
    let frame_str = line[frame_start + 6..].trim_start();
    let end = frame_str
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(frame_str.len());
    frame_str[..end].parse().ok()
}

/// Shorten an ffmpeg status line to the fields worth showing on a display row.
pub fn summarize_ffmpeg(line: &str) -> String {
    let mut parts = Vec::new();
    if let Some(frame) = parse_frame(line) {
        parts.push(format!("frame {frame}"));
    }
    if let Some(secs) = parse_time_field(line) {
        let total = secs as u64;
        parts.push(format!(
            "{:02}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        ));
    }
    if let Some(speed) = parse_speed(line) {
        parts.push(format!("{speed:.2}x"));
    }
    if parts.is_empty() {
        line.to_string()
    } else {
        parts.join("  ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str =
        "frame=  100 fps=25 q=-1.0 size=    1024kB time=00:01:04.00 bitrate=2097.2kbits/s speed=1.50x";

    #[test]
    fn test_ffmpeg_progress_detection() {
        assert!(is_ffmpeg_progress(STATUS));
        assert!(is_ffmpeg_progress("size=512kB time=00:00:10.00"));
        assert!(!is_ffmpeg_progress("time=00:00:10.00"));
        assert!(!is_ffmpeg_progress("Input #0, mov,mp4,m4a, from 'a.mp4':"));
    }

    #[test]
    fn test_upload_progress_detection() {
        assert!(is_upload_progress(
            "[1] ↑ 12.50MB/100.00MB 2.10MB/s in 6s, left 41s ............"
        ));
        assert!(!is_upload_progress("上传文件成功, 保存到网盘路径: /apps/a.mp4"));
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("00:00"), None);
        assert_eq!(parse_time(""), None);
    }

    #[test]
    fn test_parse_fields() {
        assert_eq!(parse_time_field(STATUS), Some(64.0));
        assert_eq!(parse_speed(STATUS), Some(1.5));
        assert_eq!(parse_frame(STATUS), Some(100));
        assert_eq!(parse_frame("no frame here"), None);
    }

    #[test]
    fn test_summarize_ffmpeg() {
        assert_eq!(summarize_ffmpeg(STATUS), "frame 100  00:01:04  1.50x");
        assert_eq!(summarize_ffmpeg("something else"), "something else");
    }

    #[test]
    fn test_from_fn() {
        let predicate = from_fn(|line| line.contains('%'));
        assert!(predicate("5%"));
        assert!(!predicate("done"));
    }
}
