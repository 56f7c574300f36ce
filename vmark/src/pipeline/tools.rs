//! External collaborators: media probing, the watermark transform and asset generation.
//!
//! Each is a trait so the pipeline can be driven with other implementations;
//! the shipped ones run command-line tools through the [`ProcessSupervisor`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AssetsConfig, WatermarkConfig};
use crate::pipeline::commands::render_template;
use crate::process::{ProcessSupervisor, RunOptions, RunOutput};
use crate::{Error, Result};

/// Seed handed to the watermark transform: two random components and the quality.
pub type Seed = [u32; 3];

/// Size of the mark image, needed again to recover it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkShape {
    pub width: u32,
    pub height: u32,
}

/// Stream properties of a video (or a still image).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
    pub fps: f64,
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

/// The invisible-mark transform.
#[async_trait]
pub trait Watermarker: Send + Sync {
    /// Write `frame` with `mark` embedded to `output`.
    async fn embed(&self, frame: &Path, mark: &Path, seed: &Seed, output: &Path) -> Result<()>;

    /// Recover the mark of `shape` from `frame` into `output`.
    async fn extract(
        &self,
        frame: &Path,
        shape: MarkShape,
        seed: &Seed,
        output: &Path,
    ) -> Result<()>;
}

/// Per-recipient overlay and QR images.
#[async_trait]
pub trait AssetGenerator: Send + Sync {
    async fn logo(&self, text: &str, output: &Path) -> Result<()>;
    async fn qrcode(&self, text: &str, output: &Path) -> Result<()>;
}

/// Run a tool command, requiring exit 0 and, when given, an output file.
async fn run_tool(
    supervisor: &ProcessSupervisor,
    tool: &str,
    command: &str,
    options: RunOptions,
    expected: Option<&Path>,
) -> Result<RunOutput> {
    let output = supervisor
        .run(command, options)
        .await
        .map_err(|e| Error::external(tool, e.to_string()))?;
    if !output.success() {
        let detail = output
            .stderr
            .as_deref()
            .and_then(|s| s.lines().last())
            .unwrap_or_default();
        return Err(Error::external(
            tool,
            format!("exit code {:?} {detail}", output.exit_code),
        ));
    }
    if let Some(path) = expected
        && !path.exists()
    {
        return Err(Error::external(
            tool,
            format!("expected output {} was not produced", path.display()),
        ));
    }
    Ok(output)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    nb_read_packets: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001`.
pub fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((num, den)) => (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

/// Extract [`MediaInfo`] from `ffprobe -of json` output.
pub fn parse_probe_output(json: &str) -> Result<MediaInfo> {
    let parsed: ProbeOutput = serde_json::from_str(json)?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| Error::external("ffprobe", "no video stream"))?;

    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(Error::external("ffprobe", "stream has no dimensions"));
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(1.0);
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse().ok())
        .or_else(|| stream.nb_read_packets.as_deref().and_then(|n| n.parse().ok()))
        .unwrap_or(0);

    Ok(MediaInfo {
        width,
        height,
        frame_count,
        fps,
    })
}

/// [`MediaProbe`] backed by `ffprobe`.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    supervisor: ProcessSupervisor,
    ffprobe: String,
    timeout: Option<Duration>,
}

impl FfprobeProbe {
    pub fn new(supervisor: ProcessSupervisor, ffprobe: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            supervisor,
            ffprobe: ffprobe.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let command = format!(
            "{} -v error -select_streams v:0 -count_packets \
             -show_entries stream=width,height,r_frame_rate,avg_frame_rate,nb_frames,nb_read_packets \
             -of json {}",
            process_utils::quote_arg(&self.ffprobe),
            process_utils::quote_arg(&path.to_string_lossy())
        );
        let options = RunOptions::new().capture().total_timeout(self.timeout);
        let output = run_tool(&self.supervisor, "ffprobe", &command, options, None).await?;
        let info = parse_probe_output(output.stdout.as_deref().unwrap_or_default())?;
        debug!(path = %path.display(), ?info, "Probed media");
        Ok(info)
    }
}

fn seed_arg(seed: &Seed) -> String {
    seed.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// [`Watermarker`] running the configured embed/extract command templates.
#[derive(Debug, Clone)]
pub struct CommandWatermarker {
    supervisor: ProcessSupervisor,
    embed_template: String,
    extract_template: String,
    idle_timeout: Option<Duration>,
}

impl CommandWatermarker {
    pub fn new(
        supervisor: ProcessSupervisor,
        config: &WatermarkConfig,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            supervisor,
            embed_template: config.embed_command.clone(),
            extract_template: config.extract_command.clone(),
            idle_timeout,
        }
    }
}

#[async_trait]
impl Watermarker for CommandWatermarker {
    async fn embed(&self, frame: &Path, mark: &Path, seed: &Seed, output: &Path) -> Result<()> {
        let seed = seed_arg(seed);
        let frame_arg = frame.to_string_lossy().into_owned();
        let mark_arg = mark.to_string_lossy().into_owned();
        let output_arg = output.to_string_lossy().into_owned();
        let command = render_template(
            &self.embed_template,
            &[
                ("frame", frame_arg.as_str()),
                ("mark", mark_arg.as_str()),
                ("seed", seed.as_str()),
                ("output", output_arg.as_str()),
            ],
        );
        let options = RunOptions::new().capture().idle_timeout(self.idle_timeout);
        run_tool(&self.supervisor, "watermark", &command, options, Some(output)).await?;
        Ok(())
    }

    async fn extract(
        &self,
        frame: &Path,
        shape: MarkShape,
        seed: &Seed,
        output: &Path,
    ) -> Result<()> {
        let seed = seed_arg(seed);
        let width = shape.width.to_string();
        let height = shape.height.to_string();
        let frame_arg = frame.to_string_lossy().into_owned();
        let output_arg = output.to_string_lossy().into_owned();
        let command = render_template(
            &self.extract_template,
            &[
                ("frame", frame_arg.as_str()),
                ("width", width.as_str()),
                ("height", height.as_str()),
                ("seed", seed.as_str()),
                ("output", output_arg.as_str()),
            ],
        );
        let options = RunOptions::new().capture().idle_timeout(self.idle_timeout);
        run_tool(&self.supervisor, "watermark", &command, options, Some(output)).await?;
        Ok(())
    }
}

/// [`AssetGenerator`] running the configured logo and QR command templates.
#[derive(Debug, Clone)]
pub struct CommandAssetGenerator {
    supervisor: ProcessSupervisor,
    config: AssetsConfig,
    idle_timeout: Option<Duration>,
}

impl CommandAssetGenerator {
    pub fn new(
        supervisor: ProcessSupervisor,
        config: AssetsConfig,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            supervisor,
            config,
            idle_timeout,
        }
    }

    async fn render(&self, tool: &str, template: &str, text: &str, output: &Path) -> Result<()> {
        let output_arg = output.to_string_lossy().into_owned();
        let command = render_template(template, &[("text", text), ("output", output_arg.as_str())]);
        let options = RunOptions::new().capture().idle_timeout(self.idle_timeout);
        run_tool(&self.supervisor, tool, &command, options, Some(output)).await?;
        Ok(())
    }
}

#[async_trait]
impl AssetGenerator for CommandAssetGenerator {
    async fn logo(&self, text: &str, output: &Path) -> Result<()> {
        self.render("logo", &self.config.logo_command, text, output)
            .await
    }

    async fn qrcode(&self, text: &str, output: &Path) -> Result<()> {
        self.render("qrcode", &self.config.qrcode_command, text, output)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("25"), Some(25.0));
    }

    #[test]
    fn test_parse_probe_output_video() {
        let json = r#"{"streams":[{"width":1920,"height":1080,"r_frame_rate":"30/1",
            "avg_frame_rate":"30/1","nb_frames":"900","nb_read_packets":"900"}]}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.frame_count, 900);
        assert_eq!(info.fps, 30.0);
    }

    #[test]
    fn test_parse_probe_output_falls_back_to_packets() {
        let json = r#"{"streams":[{"width":200,"height":200,"r_frame_rate":"25/1",
            "avg_frame_rate":"0/0","nb_read_packets":"1"}]}"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.frame_count, 1);
        assert_eq!(info.fps, 25.0);
    }

    #[test]
    fn test_parse_probe_output_without_stream() {
        assert!(parse_probe_output(r#"{"streams":[]}"#).is_err());
        assert!(parse_probe_output("not json").is_err());
    }

    #[test]
    fn test_seed_arg() {
        assert_eq!(seed_arg(&[12, 9876, 35]), "12,9876,35");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_asset_generator_requires_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("logo.png");
        let config = AssetsConfig {
            logo_command: "printf %s {text} > {output}".to_string(),
            qrcode_command: "true {text} {output}".to_string(),
        };
        let generator = CommandAssetGenerator::new(ProcessSupervisor::default(), config, None);

        generator.logo("alice", &output).await.unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "alice");

        let missing = dir.path().join("qr.png");
        let err = generator.qrcode("alice", &missing).await.unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_watermarker_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let frame = dir.path().join("1.png");
        let mark = dir.path().join("mark.png");
        let output = dir.path().join("out.png");
        std::fs::write(&frame, b"frame").unwrap();
        std::fs::write(&mark, b"mark").unwrap();

        let config = WatermarkConfig {
            embed_command: "cat {frame} {mark} > {output}; echo {seed} >> {output}".to_string(),
            ..WatermarkConfig::default()
        };
        let marker = CommandWatermarker::new(ProcessSupervisor::default(), &config, None);
        marker.embed(&frame, &mark, &[1, 2, 35], &output).await.unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "framemark1,2,35\n");
    }
}
