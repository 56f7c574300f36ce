//! Recover the invisible mark from a distributed copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::pipeline::commands::FfmpegCommands;
use crate::pipeline::gate::PoolKind;
use crate::pipeline::layout::Layout;
use crate::pipeline::metadata::ItemMetadata;
use crate::pipeline::stage::{Stage, StageRunner};
use crate::pipeline::tools::Watermarker;
use crate::process::RunOptions;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Recovered mark images, one per frame that succeeded.
    pub recovered: Vec<PathBuf>,
    /// Frame numbers that could not be extracted or decoded.
    pub failed: Vec<u64>,
}

pub struct Recovery {
    layout: Layout,
    commands: FfmpegCommands,
    runner: StageRunner,
    watermarker: Arc<dyn Watermarker>,
    idle_timeout: Option<std::time::Duration>,
}

impl Recovery {
    pub fn new(
        layout: Layout,
        commands: FfmpegCommands,
        runner: StageRunner,
        watermarker: Arc<dyn Watermarker>,
        idle_timeout: Option<std::time::Duration>,
    ) -> Self {
        Self {
            layout,
            commands,
            runner,
            watermarker,
            idle_timeout,
        }
    }

    /// Extract every frame listed in `metadata_file` from `video` and decode its mark.
    ///
    /// Frames are handled independently; a failure is logged and the next frame
    /// is tried. Only unreadable metadata or unusable output directories fail
    /// the whole recovery.
    pub async fn recover(&self, metadata_file: &Path, video: &Path) -> Result<RecoveryReport> {
        let metadata = ItemMetadata::read(metadata_file).await?;
        let frames_dir = self.layout.recover_dir();
        let results_dir = self.layout.recover_result_dir();
        for dir in [&frames_dir, &results_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::io_path("creating", dir, e))?;
        }

        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        info!(
            video = %video.display(),
            frames = metadata.frames.len(),
            "Recovering mark"
        );

        let mut report = RecoveryReport::default();
        for &frame in &metadata.frames {
            let frame_file = frames_dir.join(format!("{stem}_{frame}.png"));
            let result_file = results_dir.join(format!("{stem}_{frame}.png"));

            let extract = Stage::new(
                format!("extract frame {frame}"),
                PoolKind::Exclusive,
                self.commands.extract_frame(video, frame, &frame_file),
            )
            .options(RunOptions::new().capture().idle_timeout(self.idle_timeout))
            .expect_file(&frame_file);
            if !self.runner.run(extract).await {
                report.failed.push(frame);
                continue;
            }

            match self
                .watermarker
                .extract(&frame_file, metadata.shape, &metadata.seed, &result_file)
                .await
            {
                Ok(()) => report.recovered.push(result_file),
                Err(e) => {
                    warn!(frame, error = %e, "Failed to decode mark");
                    report.failed.push(frame);
                }
            }
        }

        info!(
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            output = %results_dir.display(),
            "Recovery finished"
        );
        Ok(report)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::EncodeConfig;
    use crate::pipeline::gate::ConcurrencyGate;
    use crate::pipeline::tools::{MarkShape, Seed};
    use crate::process::ProcessSupervisor;
    use async_trait::async_trait;

    struct RecordingWatermarker {
        fail_frame: &'static str,
        seen: parking_lot::Mutex<Vec<(MarkShape, Seed)>>,
    }

    #[async_trait]
    impl Watermarker for RecordingWatermarker {
        async fn embed(&self, _: &Path, _: &Path, _: &Seed, _: &Path) -> Result<()> {
            unreachable!("recovery never embeds")
        }

        async fn extract(&self, frame: &Path, shape: MarkShape, seed: &Seed, output: &Path) -> Result<()> {
            self.seen.lock().push((shape, *seed));
            if frame.to_string_lossy().ends_with(self.fail_frame) {
                return Err(Error::external("watermark", "no mark found"));
            }
            std::fs::write(output, b"mark")?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_recover_skips_failed_frames() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = dir.path().join("fake-ffmpeg");
        std::fs::write(&ffmpeg, "#!/bin/sh\nfor last; do :; done\necho f > \"$last\"\n").unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let metadata_file = dir.path().join("v1.json");
        let shape = MarkShape {
            width: 64,
            height: 64,
        };
        ItemMetadata::new("v1.mp4", vec![2, 5, 9], 25.0, 10, [11, 22, 35], shape, (1280, 720))
            .write(&metadata_file)
            .await
            .unwrap();

        let watermarker = Arc::new(RecordingWatermarker {
            fail_frame: "_5.png",
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let recovery = Recovery::new(
            Layout::new(dir.path().join("target"), ".mp4"),
            FfmpegCommands::new(EncodeConfig {
                ffmpeg_path: ffmpeg.to_string_lossy().into_owned(),
                ..EncodeConfig::default()
            }),
            StageRunner::new(ProcessSupervisor::default(), ConcurrencyGate::new(1)),
            watermarker.clone(),
            None,
        );

        let report = recovery
            .recover(&metadata_file, &dir.path().join("v1.mp4"))
            .await
            .unwrap();

        assert_eq!(report.recovered.len(), 2);
        assert_eq!(report.failed, vec![5]);
        assert!(report.recovered.iter().all(|p| p.is_file()));
        assert!(
            watermarker
                .seen
                .lock()
                .iter()
                .all(|(s, seed)| *s == shape && *seed == [11, 22, 35])
        );
    }

    #[tokio::test]
    async fn test_missing_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Recovery::new(
            Layout::new(dir.path(), ".mp4"),
            FfmpegCommands::new(EncodeConfig::default()),
            StageRunner::new(ProcessSupervisor::default(), ConcurrencyGate::new(1)),
            Arc::new(RecordingWatermarker {
                fail_frame: "",
                seen: parking_lot::Mutex::new(Vec::new()),
            }),
            None,
        );
        let err = recovery
            .recover(&dir.path().join("nope.json"), Path::new("v.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
