//! Stage sequences of one item, driven by ffmpeg and the external tools.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, EncodeConfig, TimeoutsConfig, WatermarkConfig};
use crate::discovery::{Item, ItemClass, Recipient};
use crate::pipeline::commands::{CompressTarget, FfmpegCommands, fit_scale};
use crate::pipeline::gate::PoolKind;
use crate::pipeline::layout::Layout;
use crate::pipeline::metadata::ItemMetadata;
use crate::pipeline::orchestrator::ItemProcessor;
use crate::pipeline::stage::{Stage, StageRunner};
use crate::pipeline::tools::{
    AssetGenerator, CommandAssetGenerator, CommandWatermarker, FfprobeProbe, MarkShape,
    MediaProbe, Seed, Watermarker,
};
use crate::process::{RunOptions, progress};
use crate::{Error, Result};

/// Pick `times` random frames in `1..=frame_count`, each extended by
/// `period` consecutive frames. Returned ascending without duplicates.
pub fn sample_frames<R: Rng>(frame_count: u64, times: u32, period: u32, rng: &mut R) -> Vec<u64> {
    if frame_count == 0 {
        return Vec::new();
    }
    let mut frames = BTreeSet::new();
    for _ in 0..times {
        let start: u64 = rng.random_range(1..=frame_count);
        for offset in 0..u64::from(period.max(1)) {
            let frame = start + offset;
            if frame <= frame_count {
                frames.insert(frame);
            }
        }
    }
    frames.into_iter().collect()
}

/// Two random components in `1..=9999` followed by the quality.
pub fn new_seed<R: Rng>(quality: u32, rng: &mut R) -> Seed {
    [
        rng.random_range(1..=9999),
        rng.random_range(1..=9999),
        quality,
    ]
}

/// Count `<n>.png` files written by frame extraction.
async fn count_frames(dir: &Path) -> Result<u64> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io_path("reading", dir, e))?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let numbered = path.extension().is_some_and(|ext| ext == "png")
            && path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem.parse::<u64>().is_ok());
        if numbered {
            count += 1;
        }
    }
    Ok(count)
}

/// Remove `dir` with its contents and create it empty again.
async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io_path("removing", dir, e)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::io_path("creating", dir, e))
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}

/// [`ItemProcessor`] producing watermarked videos with ffmpeg.
pub struct MediaItemProcessor {
    layout: Layout,
    commands: FfmpegCommands,
    encode: EncodeConfig,
    watermark: WatermarkConfig,
    timeouts: TimeoutsConfig,
    runner: StageRunner,
    probe: Arc<dyn MediaProbe>,
    watermarker: Arc<dyn Watermarker>,
    assets: Arc<dyn AssetGenerator>,
}

impl MediaItemProcessor {
    /// Processor with the command-line collaborators described by `config`.
    pub fn from_config(config: &AppConfig, runner: StageRunner) -> Self {
        let supervisor = runner.supervisor().clone();
        let probe = FfprobeProbe::new(
            supervisor.clone(),
            config.encode.ffprobe_path.clone(),
            config.timeouts.probe_total(),
        );
        let watermarker =
            CommandWatermarker::new(supervisor.clone(), &config.watermark, config.timeouts.tool_idle());
        let assets = CommandAssetGenerator::new(
            supervisor,
            config.assets.clone(),
            config.timeouts.tool_idle(),
        );
        Self::new(
            config,
            runner,
            Arc::new(probe),
            Arc::new(watermarker),
            Arc::new(assets),
        )
    }

    pub fn new(
        config: &AppConfig,
        runner: StageRunner,
        probe: Arc<dyn MediaProbe>,
        watermarker: Arc<dyn Watermarker>,
        assets: Arc<dyn AssetGenerator>,
    ) -> Self {
        Self {
            layout: Layout::from_config(config),
            commands: FfmpegCommands::new(config.encode.clone()),
            encode: config.encode.clone(),
            watermark: config.watermark.clone(),
            timeouts: config.timeouts.clone(),
            runner,
            probe,
            watermarker,
            assets,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn ffmpeg_options(&self, display_id: String) -> RunOptions {
        RunOptions::new()
            .capture()
            .progress(progress::ffmpeg())
            .display_id(display_id)
            .idle_timeout(self.timeouts.ffmpeg_idle())
            .total_timeout(self.timeouts.ffmpeg_total())
    }

    async fn process_plain(&self, recipient: &str, item: &Item) -> Result<()> {
        let source = self.probe.probe(&item.source).await?;
        let size = fit_scale(&self.encode, source.width, source.height);
        let result = self.layout.result_file(recipient, &item.id);

        let command = self.commands.compress_with_logo(
            &item.source,
            &self.layout.logo_image(recipient),
            &result,
            size,
            CompressTarget::Result,
        );
        let stage = Stage::new(format!("compress {}", item.id), PoolKind::Bounded, command)
            .options(self.ffmpeg_options(format!("{recipient}/{}", item.id)))
            .expect_file(&result);
        self.runner.execute(stage).await?;
        Ok(())
    }

    async fn process_invisible(&self, recipient: &str, item: &Item) -> Result<()> {
        let id = item.id.as_str();
        let display_id = format!("{recipient}/{id}");

        let source = self.probe.probe(&item.source).await?;
        let size = fit_scale(&self.encode, source.width, source.height);
        let stage_file = self.layout.stage_file(recipient, id);
        let command = self.commands.compress_with_logo(
            &item.source,
            &self.layout.logo_image(recipient),
            &stage_file,
            size,
            CompressTarget::Stage,
        );
        let compress = Stage::new(format!("compress {id}"), PoolKind::Exclusive, command)
            .options(self.ffmpeg_options(display_id.clone()))
            .expect_file(&stage_file);
        self.runner.execute(compress).await?;

        let staged = self.probe.probe(&stage_file).await?;
        let frames_dir = self.layout.frames_dir(recipient);
        reset_dir(&frames_dir).await?;
        let extract = Stage::new(
            format!("extract frames {id}"),
            PoolKind::Exclusive,
            self.commands.extract_frames(&stage_file, staged.fps, &frames_dir),
        )
        .options(self.ffmpeg_options(display_id.clone()));
        self.runner.execute(extract).await?;

        let total_frames = count_frames(&frames_dir).await?;
        if total_frames == 0 {
            return Err(Error::process_failure(
                format!("extract frames {id}"),
                "no frames were written",
            ));
        }

        let (frames, seed) = {
            let mut rng = rand::rng();
            let frames = sample_frames(
                total_frames,
                self.watermark.sample_times,
                self.watermark.sample_period,
                &mut rng,
            );
            (frames, new_seed(self.watermark.quality, &mut rng))
        };
        debug!(recipient, item = id, ?frames, "Sampled frames");

        let mark = self.layout.qrcode_image(recipient);
        let mark_info = self.probe.probe(&mark).await?;
        let shape = MarkShape {
            width: mark_info.width,
            height: mark_info.height,
        };

        self.runner
            .run_task(
                &format!("embed {id}"),
                PoolKind::Exclusive,
                self.embed_frames(recipient, &frames, &mark, &seed),
            )
            .await?;

        let audio = self.layout.audio_file(recipient, id);
        let extract_audio = Stage::new(
            format!("extract audio {id}"),
            PoolKind::Exclusive,
            self.commands.extract_audio(&stage_file, &audio),
        )
        .options(self.ffmpeg_options(display_id.clone()))
        .expect_file(&audio);
        self.runner.execute(extract_audio).await?;

        let result = self.layout.result_file(recipient, id);
        let compose = Stage::new(
            format!("compose {id}"),
            PoolKind::Exclusive,
            self.commands
                .compose(&frames_dir, staged.fps, &audio, &result),
        )
        .options(self.ffmpeg_options(display_id))
        .expect_file(&result);
        self.runner.execute(compose).await?;

        let video = result
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        let metadata = ItemMetadata::new(
            video,
            frames,
            staged.fps,
            total_frames,
            seed,
            shape,
            (source.width, source.height),
        );
        metadata
            .write(&self.layout.metadata_file(recipient, id))
            .await?;

        if !self.watermark.keep_stage_file {
            remove_if_exists(&stage_file).await;
        }
        Ok(())
    }

    /// Embed the mark into every sampled frame, replacing the frame in place.
    async fn embed_frames(
        &self,
        recipient: &str,
        frames: &[u64],
        mark: &Path,
        seed: &Seed,
    ) -> Result<()> {
        let frames_dir = self.layout.frames_dir(recipient);
        let marked_dir = self.layout.marked_dir(recipient);
        for frame in frames {
            let original = frames_dir.join(format!("{frame}.png"));
            let marked = marked_dir.join(format!("{frame}.png"));
            self.watermarker
                .embed(&original, mark, seed, &marked)
                .await?;
            tokio::fs::rename(&marked, &original)
                .await
                .map_err(|e| Error::io_path("replacing", &original, e))?;
        }
        debug!(recipient, count = frames.len(), "Embedded mark");
        Ok(())
    }

    /// Drop the per-item scratch files, whatever the outcome.
    async fn clean_work_files(&self, recipient: &str, id: &str) {
        let frames_dir = self.layout.frames_dir(recipient);
        if let Err(e) = reset_dir(&frames_dir).await {
            warn!(recipient, error = %e, "Failed to clear frames directory");
        }
        remove_if_exists(&self.layout.audio_file(recipient, id)).await;
    }
}

#[async_trait]
impl ItemProcessor for MediaItemProcessor {
    async fn prepare(&self, recipient: &Recipient) -> Result<()> {
        let name = recipient.name.as_str();
        for dir in self.layout.recipient_dirs(name) {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::io_path("creating", &dir, e))?;
        }

        let text = format!("{}{}", self.watermark.logo_text_prefix, name);
        let logo = self.layout.logo_image(name);
        if !logo.is_file() {
            self.assets.logo(&text, &logo).await?;
            debug!(recipient = name, path = %logo.display(), "Generated logo");
        }
        let qrcode = self.layout.qrcode_image(name);
        if !qrcode.is_file() {
            self.assets.qrcode(&text, &qrcode).await?;
            debug!(recipient = name, path = %qrcode.display(), "Generated QR code");
        }
        Ok(())
    }

    async fn process(&self, recipient: &Recipient, item: &Item) -> bool {
        let name = recipient.name.as_str();
        let result = match item.class {
            ItemClass::PlainMark => self.process_plain(name, item).await,
            ItemClass::InvisibleMark => {
                let result = self.process_invisible(name, item).await;
                self.clean_work_files(name, &item.id).await;
                result
            }
        };
        match result {
            Ok(()) => {
                info!(recipient = name, item = %item.id, "Produced result");
                true
            }
            Err(e) => {
                warn!(recipient = name, item = %item.id, error = %e, "Item processing failed");
                false
            }
        }
    }
}
