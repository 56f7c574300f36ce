//! Application configuration.
//!
//! Every recognized option is a field with a default; unknown keys are
//! rejected so typos surface at startup instead of silently falling back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// File name looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "vmark.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub encode: EncodeConfig,
    pub watermark: WatermarkConfig,
    pub assets: AssetsConfig,
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutsConfig,
    pub upload: UploadConfig,
    pub display: DisplayConfig,
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory scanned (recursively) for source videos.
    pub source_dir: PathBuf,
    /// Root for stage, frame, result and asset directories.
    pub target_dir: PathBuf,
    /// Directory holding the progress and finished-recipient records.
    pub state_dir: PathBuf,
    /// One recipient per line, `name` or `name,alias`.
    pub recipients_file: PathBuf,
    /// Directory for rotated log files.
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("origin"),
            target_dir: PathBuf::from("target"),
            state_dir: PathBuf::from("state"),
            recipients_file: PathBuf::from("origin/recipients.txt"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// Encoder settings used to build ffmpeg command lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncodeConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub scale_width: u32,
    pub scale_height: u32,
    /// CRF for the intermediate (stage) encode of invisible-mark items.
    pub stage_crf: u32,
    pub stage_preset: String,
    /// CRF for final results.
    pub crf: u32,
    pub preset: String,
    /// Logo drift speed in pixels per second.
    pub horizontal_speed: u32,
    pub vertical_speed: u32,
    /// Extension (with leading dot) of produced videos.
    pub result_extension: String,
    /// Replaces the default codec options for plain-mark encodes when set.
    pub ffmpeg_options: Option<String>,
    /// Extensions (with leading dot) recognized as source media.
    pub source_extensions: Vec<String>,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            scale_width: 1280,
            scale_height: 720,
            stage_crf: 24,
            stage_preset: "fast".to_string(),
            crf: 17,
            preset: "slow".to_string(),
            horizontal_speed: 20,
            vertical_speed: 40,
            result_extension: ".mp4".to_string(),
            ffmpeg_options: None,
            source_extensions: default_source_extensions(),
        }
    }
}

fn default_source_extensions() -> Vec<String> {
    [".mp4", ".avi", ".mkv", ".wmv", ".mov", ".m4v", ".mts"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Invisible-mark settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatermarkConfig {
    /// 0: no item gets the invisible mark, 1: every item, n: every n-th item.
    pub step: u32,
    /// Prefix prepended to the recipient name for the visible logo text.
    pub logo_text_prefix: String,
    /// Strength parameter handed to the embedder as the last seed component.
    pub quality: u32,
    /// Number of random sampling points per video.
    pub sample_times: u32,
    /// Consecutive frames taken at each sampling point.
    pub sample_period: u32,
    /// Keep the intermediate stage encode after a successful compose.
    pub keep_stage_file: bool,
    /// Placeholders: `{frame}`, `{mark}`, `{seed}`, `{output}`.
    pub embed_command: String,
    /// Placeholders: `{frame}`, `{width}`, `{height}`, `{seed}`, `{output}`.
    pub extract_command: String,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            step: 1,
            logo_text_prefix: String::new(),
            quality: 35,
            sample_times: 5,
            sample_period: 1,
            keep_stage_file: true,
            embed_command: "blind-watermark embed --seed {seed} --input {frame} --mark {mark} --output {output}"
                .to_string(),
            extract_command:
                "blind-watermark extract --seed {seed} --shape {width}x{height} --input {frame} --output {output}"
                    .to_string(),
        }
    }
}

/// Per-recipient overlay and QR generation commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssetsConfig {
    /// Placeholders: `{text}`, `{output}`.
    pub logo_command: String,
    /// Placeholders: `{text}`, `{output}`.
    pub qrcode_command: String,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            logo_command:
                "magick -background white -fill red -pointsize 24 -bordercolor white -border 5 label:{text} {output}"
                    .to_string(),
            qrcode_command: "qrencode -s 4 -o {output} {text}".to_string(),
        }
    }
}

/// Concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Capacity of the bounded pool. The exclusive pool is always 1.
    pub bounded_capacity: usize,
    /// Give incomplete recipients a second pass before the run ends.
    pub retry_missed: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            bounded_capacity: 2,
            retry_missed: true,
        }
    }
}

/// Supervisor timeouts in seconds. Zero disables a timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub ffmpeg_idle_secs: u64,
    pub ffmpeg_total_secs: u64,
    pub probe_total_secs: u64,
    pub tool_idle_secs: u64,
    pub upload_total_secs: u64,
    pub upload_idle_secs: u64,
    /// Wait between the graceful termination request and the forced kill.
    pub terminate_grace_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_idle_secs: 300,
            ffmpeg_total_secs: 0,
            probe_total_secs: 120,
            tool_idle_secs: 300,
            upload_total_secs: 3600,
            upload_idle_secs: 30,
            terminate_grace_secs: 5,
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl TimeoutsConfig {
    pub fn ffmpeg_idle(&self) -> Option<Duration> {
        non_zero_secs(self.ffmpeg_idle_secs)
    }

    pub fn ffmpeg_total(&self) -> Option<Duration> {
        non_zero_secs(self.ffmpeg_total_secs)
    }

    pub fn probe_total(&self) -> Option<Duration> {
        non_zero_secs(self.probe_total_secs)
    }

    pub fn tool_idle(&self) -> Option<Duration> {
        non_zero_secs(self.tool_idle_secs)
    }

    pub fn upload_total(&self) -> Option<Duration> {
        non_zero_secs(self.upload_total_secs)
    }

    pub fn upload_idle(&self) -> Option<Duration> {
        non_zero_secs(self.upload_idle_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Remote storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Upload each result right after it is produced.
    pub enabled: bool,
    /// Storage CLI binary.
    pub tool: String,
    pub remote_root: String,
    /// Course folder under each recipient's remote directory.
    pub course_name: String,
    pub delete_after_upload: bool,
    /// Concurrent uploads during `vmark upload`.
    pub concurrency: usize,
    /// Relative size difference under which a remote file counts as uploaded.
    pub size_tolerance: f64,
    /// Text the storage CLI prints on a successful upload.
    pub success_marker: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tool: "BaiduPCS-Go".to_string(),
            remote_root: "/apps/bypy".to_string(),
            course_name: String::new(),
            delete_after_upload: false,
            concurrency: 3,
            size_tolerance: 0.1,
            success_marker: "上传文件成功".to_string(),
        }
    }
}

impl UploadConfig {
    /// Remote directory for one recipient and file kind (`videos`, `metadata`).
    pub fn remote_dir(&self, kind: &str, recipient: &str) -> String {
        let root = self.remote_root.trim_end_matches('/');
        if self.course_name.is_empty() {
            format!("{root}/{kind}/{recipient}")
        } else {
            format!("{root}/{kind}/{recipient}/{}", self.course_name)
        }
    }
}

/// Terminal output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    /// Render subprocess progress on dedicated terminal rows.
    pub dedicated_lines: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            dedicated_lines: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the default locations when `None`.
    ///
    /// Lookup order without an explicit path: `./vmark.toml`, then
    /// `<config dir>/vmark/config.toml`, then built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_locations().into_iter().find(|p| p.is_file()) {
                Some(found) => Self::from_file(&found)?,
                None => {
                    debug!("No configuration file found, using defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            locations.push(dir.join("vmark").join("config.toml"));
        }
        locations
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config", path, e))?;
        let config = Self::from_toml(&contents)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency.bounded_capacity == 0 {
            return Err(Error::config("concurrency.bounded_capacity must be at least 1"));
        }
        if self.encode.scale_width == 0 || self.encode.scale_height == 0 {
            return Err(Error::config("encode scale must be non-zero"));
        }
        if !self.encode.result_extension.starts_with('.') {
            return Err(Error::config(format!(
                "encode.result_extension must start with '.', got {:?}",
                self.encode.result_extension
            )));
        }
        if self.watermark.sample_times == 0 || self.watermark.sample_period == 0 {
            return Err(Error::config(
                "watermark.sample_times and watermark.sample_period must be at least 1",
            ));
        }
        for key in ["{frame}", "{mark}", "{seed}", "{output}"] {
            if !self.watermark.embed_command.contains(key) {
                return Err(Error::config(format!(
                    "watermark.embed_command is missing the {key} placeholder"
                )));
            }
        }
        for key in ["{text}", "{output}"] {
            if !self.assets.logo_command.contains(key) || !self.assets.qrcode_command.contains(key)
            {
                return Err(Error::config(format!(
                    "asset commands must contain the {key} placeholder"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.upload.size_tolerance) {
            return Err(Error::config("upload.size_tolerance must be within 0.0..=1.0"));
        }
        if self.upload.concurrency == 0 {
            return Err(Error::config("upload.concurrency must be at least 1"));
        }
        if self.upload.enabled && self.upload.course_name.trim().is_empty() {
            return Err(Error::config(
                "upload.course_name is required when upload.enabled is set",
            ));
        }
        Ok(())
    }

    /// Whether an item at `position` in the discovery listing gets the invisible mark.
    pub fn needs_invisible_mark(&self, position: usize) -> bool {
        match self.watermark.step {
            0 => false,
            1 => true,
            step => position % step as usize == 0,
        }
    }
}
