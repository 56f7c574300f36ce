//! Command lines for the encoder and template-driven tools.

use std::path::Path;

use process_utils::quote_arg;

use crate::config::EncodeConfig;

fn path_arg(path: &Path) -> String {
    quote_arg(&path.to_string_lossy())
}

/// Substitute `{key}` placeholders with shell-quoted values.
///
/// Unknown placeholders are left as written.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in values {
        rendered = rendered.replace(&format!("{{{key}}}"), &quote_arg(value));
    }
    rendered
}

/// Round down to an even pixel count (yuv420p needs even dimensions), minimum 2.
pub fn even(dimension: u32) -> u32 {
    (dimension & !1).max(2)
}

/// Target frame size: configured scale, never larger than the source.
pub fn fit_scale(config: &EncodeConfig, width: u32, height: u32) -> (u32, u32) {
    (
        even(config.scale_width.min(width)),
        even(config.scale_height.min(height)),
    )
}

/// Which quality settings a compress pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressTarget {
    /// Intermediate file that will be decoded into frames again.
    Stage,
    /// Final deliverable.
    Result,
}

/// ffmpeg invocations used by the pipeline.
#[derive(Debug, Clone)]
pub struct FfmpegCommands {
    config: EncodeConfig,
}

impl FfmpegCommands {
    pub fn new(config: EncodeConfig) -> Self {
        Self { config }
    }

    fn ffmpeg(&self) -> String {
        format!("{} -hide_banner -nostdin", quote_arg(&self.config.ffmpeg_path))
    }

    /// Crop/scale to `width`x`height` and overlay a logo that drifts across the frame.
    pub fn compress_with_logo(
        &self,
        source: &Path,
        logo: &Path,
        output: &Path,
        (width, height): (u32, u32),
        target: CompressTarget,
    ) -> String {
        let hs = self.config.horizontal_speed;
        let vs = self.config.vertical_speed;
        let filter = format!(
            "[0:v]crop={width}:{height},scale={width}:{height}[v];\
             [v][1:v]overlay=\
             x='if(gte(mod(t*{hs},main_w),main_w-w),main_w-w,mod(t*{hs},main_w))':\
             y='if(gte(mod(t*{vs},main_h),main_h-h),main_h-h,mod(t*{vs},main_h-h))'"
        );
        let options = match target {
            CompressTarget::Stage => format!(
                "-c:a copy -crf {} -preset {}",
                self.config.stage_crf,
                quote_arg(&self.config.stage_preset)
            ),
            CompressTarget::Result => match &self.config.ffmpeg_options {
                Some(options) => options.clone(),
                None => format!(
                    "-c:a copy -crf {} -preset {}",
                    self.config.crf,
                    quote_arg(&self.config.preset)
                ),
            },
        };
        format!(
            "{} -i {} -i {} -filter_complex {} {} -y {}",
            self.ffmpeg(),
            path_arg(source),
            path_arg(logo),
            quote_arg(&filter),
            options,
            path_arg(output)
        )
    }

    /// Decode every frame to `frames_dir/<n>.png`, numbered from 1.
    pub fn extract_frames(&self, video: &Path, fps: f64, frames_dir: &Path) -> String {
        format!(
            "{} -i {} -vf fps={fps} -start_number 1 {}",
            self.ffmpeg(),
            path_arg(video),
            path_arg(&frames_dir.join("%d.png"))
        )
    }

    /// Copy the audio track without re-encoding.
    pub fn extract_audio(&self, video: &Path, output: &Path) -> String {
        format!(
            "{} -i {} -vn -c:a copy -y {}",
            self.ffmpeg(),
            path_arg(video),
            path_arg(output)
        )
    }

    /// Encode numbered frames plus an audio track into the final video.
    pub fn compose(&self, frames_dir: &Path, fps: f64, audio: &Path, output: &Path) -> String {
        format!(
            "{} -framerate {fps} -f image2 -start_number 1 -i {} -i {} \
             -c:v libx264 -crf {} -preset {} -pix_fmt yuv420p -c:a copy -y {}",
            self.ffmpeg(),
            path_arg(&frames_dir.join("%d.png")),
            path_arg(audio),
            self.config.crf,
            quote_arg(&self.config.preset),
            path_arg(output)
        )
    }

    /// Write frame number `frame` (1-based) of `video` to `output`.
    pub fn extract_frame(&self, video: &Path, frame: u64, output: &Path) -> String {
        let filter = format!("select=eq(n\\,{})", frame.saturating_sub(1));
        format!(
            "{} -i {} -vf {} -vsync 0 -frames:v 1 -y {}",
            self.ffmpeg(),
            path_arg(video),
            quote_arg(&filter),
            path_arg(output)
        )
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn commands() -> FfmpegCommands {
        FfmpegCommands::new(EncodeConfig::default())
    }

    #[test]
    fn test_render_template_quotes_values() {
        let rendered = render_template(
            "tool --text {text} --out {output} {unknown}",
            &[("text", "Alice O'Neil"), ("output", "/tmp/a.png")],
        );
        assert_eq!(
            rendered,
            r"tool --text 'Alice O'\''Neil' --out '/tmp/a.png' {unknown}"
        );
    }

    #[test]
    fn test_fit_scale() {
        let config = EncodeConfig::default();
        assert_eq!(fit_scale(&config, 1920, 1080), (1280, 720));
        assert_eq!(fit_scale(&config, 853, 481), (852, 480));
    }

    #[test]
    fn test_compress_stage_uses_stage_quality() {
        let cmd = commands().compress_with_logo(
            Path::new("/src/v1.mp4"),
            Path::new("/img/alice.png"),
            Path::new("/stage/v1.mp4"),
            (1280, 720),
            CompressTarget::Stage,
        );
        assert!(cmd.starts_with("'ffmpeg' -hide_banner"));
        assert!(cmd.contains("crop=1280:720,scale=1280:720"));
        assert!(cmd.contains("-crf 24 -preset 'fast'"));
        assert!(cmd.ends_with("-y '/stage/v1.mp4'"));
    }

    #[test]
    fn test_compress_result_prefers_custom_options() {
        let mut config = EncodeConfig::default();
        config.ffmpeg_options = Some("-c:v h264_nvenc -cq 23".to_string());
        let cmd = FfmpegCommands::new(config).compress_with_logo(
            Path::new("a.mp4"),
            Path::new("l.png"),
            Path::new("o.mp4"),
            (640, 360),
            CompressTarget::Result,
        );
        assert!(cmd.contains("-c:v h264_nvenc -cq 23"));
        assert!(!cmd.contains("-crf 17"));
    }

    #[test]
    fn test_compose_and_extract() {
        let c = commands();
        let compose = c.compose(
            Path::new("/f"),
            25.0,
            Path::new("/s/v1.aac"),
            Path::new("/r/v1.mp4"),
        );
        assert!(compose.contains("-framerate 25 -f image2 -start_number 1 -i '/f/%d.png'"));
        assert!(compose.contains("-crf 17 -preset 'slow' -pix_fmt yuv420p"));

        let frames = c.extract_frames(Path::new("/s/v1.mp4"), 29.97, Path::new("/f"));
        assert!(frames.contains("-vf fps=29.97"));

        let frame = c.extract_frame(Path::new("v.mp4"), 10, Path::new("/r/10.png"));
        assert!(frame.contains(r"'select=eq(n\,9)'"));
    }
}
