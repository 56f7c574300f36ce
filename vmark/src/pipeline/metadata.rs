//! Per-item record of where and how the invisible mark was embedded.

use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::pipeline::tools::{MarkShape, Seed};
use crate::{Error, Result};

pub const ALGORITHM: &str = "image";

/// Everything needed to recover a mark from a distributed copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub algorithm: String,
    /// Local time the record was written, `%Y-%m-%d %H:%M:%S`.
    pub date: String,
    pub version: String,
    /// Result file name the record belongs to.
    pub video: String,
    /// Marked frame numbers, 1-based and ascending.
    pub frames: Vec<u64>,
    pub fps: f64,
    pub total_frames: u64,
    pub seed: Seed,
    pub shape: MarkShape,
    /// Source width and height before scaling.
    pub source_size: (u32, u32),
}

impl ItemMetadata {
    pub fn new(
        video: impl Into<String>,
        frames: Vec<u64>,
        fps: f64,
        total_frames: u64,
        seed: Seed,
        shape: MarkShape,
        source_size: (u32, u32),
    ) -> Self {
        Self {
            algorithm: ALGORITHM.to_string(),
            date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            video: video.into(),
            frames,
            fps,
            total_frames,
            seed,
            shape,
            source_size,
        }
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| Error::io_path("writing", path, e))
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::io_path("reading", path, e))?;
        let metadata: Self = serde_json::from_str(&json)?;
        if metadata.algorithm != ALGORITHM {
            return Err(Error::validation(format!(
                "{} uses unsupported algorithm {:?}",
                path.display(),
                metadata.algorithm
            )));
        }
        Ok(metadata)
    }
}
