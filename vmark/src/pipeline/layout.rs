//! Working directory layout under the target root.

use std::path::{Path, PathBuf};

use crate::config::AppConfig;

/// Where every intermediate and final file of a run lives.
#[derive(Debug, Clone)]
pub struct Layout {
    target: PathBuf,
    result_extension: String,
}

impl Layout {
    pub fn new(target: impl Into<PathBuf>, result_extension: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            result_extension: result_extension.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.paths.target_dir.clone(),
            config.encode.result_extension.clone(),
        )
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Intermediate encodes of invisible-mark items.
    pub fn stage_dir(&self, recipient: &str) -> PathBuf {
        self.target.join("stage").join(recipient)
    }

    /// All decoded frames of the item being marked.
    pub fn frames_dir(&self, recipient: &str) -> PathBuf {
        self.target.join("frames").join(recipient)
    }

    /// Embedder output before it replaces the original frame.
    pub fn marked_dir(&self, recipient: &str) -> PathBuf {
        self.target.join("marked").join(recipient)
    }

    pub fn result_dir(&self, recipient: &str) -> PathBuf {
        self.target.join("result").join("videos").join(recipient)
    }

    pub fn metadata_dir(&self, recipient: &str) -> PathBuf {
        self.target.join("result").join("metadata").join(recipient)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.target.join("images")
    }

    pub fn qrcode_dir(&self) -> PathBuf {
        self.target.join("qrcode")
    }

    pub fn recover_dir(&self) -> PathBuf {
        self.target.join("recover")
    }

    pub fn recover_result_dir(&self) -> PathBuf {
        self.target.join("recover_result")
    }

    pub fn logo_image(&self, recipient: &str) -> PathBuf {
        self.images_dir().join(format!("{recipient}.png"))
    }

    pub fn qrcode_image(&self, recipient: &str) -> PathBuf {
        self.qrcode_dir().join(format!("{recipient}.png"))
    }

    pub fn stage_file(&self, recipient: &str, item: &str) -> PathBuf {
        self.stage_dir(recipient)
            .join(format!("{item}{}", self.result_extension))
    }

    pub fn audio_file(&self, recipient: &str, item: &str) -> PathBuf {
        self.stage_dir(recipient).join(format!("{item}.aac"))
    }

    pub fn result_file(&self, recipient: &str, item: &str) -> PathBuf {
        self.result_dir(recipient)
            .join(format!("{item}{}", self.result_extension))
    }

    pub fn metadata_file(&self, recipient: &str, item: &str) -> PathBuf {
        self.metadata_dir(recipient).join(format!("{item}.json"))
    }

    /// Directories a recipient needs before any item runs.
    pub fn recipient_dirs(&self, recipient: &str) -> Vec<PathBuf> {
        vec![
            self.images_dir(),
            self.qrcode_dir(),
            self.stage_dir(recipient),
            self.frames_dir(recipient),
            self.marked_dir(recipient),
            self.result_dir(recipient),
            self.metadata_dir(recipient),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = Layout::new("/work", ".mp4");
        assert_eq!(
            layout.result_file("alice", "v1"),
            PathBuf::from("/work/result/videos/alice/v1.mp4")
        );
        assert_eq!(
            layout.metadata_file("alice", "v1"),
            PathBuf::from("/work/result/metadata/alice/v1.json")
        );
        assert_eq!(
            layout.stage_file("bob", "v2"),
            PathBuf::from("/work/stage/bob/v2.mp4")
        );
        assert_eq!(layout.qrcode_image("bob"), PathBuf::from("/work/qrcode/bob.png"));
        assert_eq!(layout.recipient_dirs("bob").len(), 7);
    }
}
