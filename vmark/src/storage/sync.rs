//! Bringing a recipient's results in line with remote storage.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{RemoteEntry, RemoteStorage, size_matches};
use crate::config::UploadConfig;
use crate::discovery::{Item, Recipient};
use crate::pipeline::layout::Layout;
use crate::pipeline::orchestrator::ResultSink;
use crate::state::{StateStore, natural_cmp};
use crate::{Error, Result};

/// Which result tree a file belongs to; also the remote folder name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Videos,
    Metadata,
}

impl FileKind {
    fn as_str(self) -> &'static str {
        match self {
            FileKind::Videos => "videos",
            FileKind::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub uploaded: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    /// Local files left alone: empty, unfinished, or already remote.
    pub skipped: usize,
}

/// Recursively list regular files under `dir` in natural order. A missing
/// directory has no files.
async fn list_local_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io_path("reading", &current, e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(files)
}

/// Uploads result files, shared by the batch sync and the per-item sink.
///
/// All uploads through one instance share `upload.concurrency` permits.
pub struct UploadSync {
    storage: Arc<dyn RemoteStorage>,
    state: Arc<StateStore>,
    layout: Layout,
    config: UploadConfig,
    limit: Arc<Semaphore>,
}

impl UploadSync {
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        state: Arc<StateStore>,
        layout: Layout,
        config: UploadConfig,
    ) -> Self {
        let limit = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            storage,
            state,
            layout,
            config,
            limit,
        }
    }

    fn local_dir(&self, kind: FileKind, recipient: &str) -> PathBuf {
        match kind {
            FileKind::Videos => self.layout.result_dir(recipient),
            FileKind::Metadata => self.layout.metadata_dir(recipient),
        }
    }

    /// Upload every local result of `recipient` that is missing remotely.
    pub async fn sync_recipient(&self, recipient: &str) -> Result<SyncReport> {
        let completed = self.state.completed(recipient).await?;
        let mut report = SyncReport::default();
        let mut jobs = Vec::new();

        for kind in [FileKind::Videos, FileKind::Metadata] {
            let local_files = list_local_files(&self.local_dir(kind, recipient)).await?;
            if local_files.is_empty() {
                continue;
            }
            let remote_dir = self.config.remote_dir(kind.as_str(), recipient);
            let remote = self.storage.list(&remote_dir, true).await?;
            debug!(recipient, kind = kind.as_str(), remote = remote.len(), "Listed remote files");

            for path in local_files {
                match self.plan(&path, kind, &completed, &remote).await {
                    Some(replace) => jobs.push((path, remote_dir.clone(), kind, replace)),
                    None => report.skipped += 1,
                }
            }
        }

        info!(recipient, pending = jobs.len(), skipped = report.skipped, "Uploading results");
        let results = join_all(jobs.into_iter().map(|(path, remote_dir, kind, replace)| async move {
            let ok = self.upload_file(&path, &remote_dir, kind, replace).await;
            (path, ok)
        }))
        .await;

        for (path, ok) in results {
            if ok {
                report.uploaded.push(path);
            } else {
                report.failed.push(path);
            }
        }
        info!(
            recipient,
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "Upload sync finished"
        );
        Ok(report)
    }

    /// `None` when `path` should not be uploaded; otherwise whether a remote
    /// copy of a different size has to be replaced.
    async fn plan(
        &self,
        path: &Path,
        kind: FileKind,
        completed: &BTreeSet<String>,
        remote: &[RemoteEntry],
    ) -> Option<bool> {
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat local file");
                return None;
            }
        };
        if size == 0 {
            return None;
        }

        if kind == FileKind::Videos {
            let id = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !completed.contains(&id) {
                info!(path = %path.display(), "Result not completed yet, not uploading");
                return None;
            }
        }

        let name = path.file_name()?.to_string_lossy();
        let mut replace = false;
        for entry in remote.iter().filter(|entry| entry.file_name() == name) {
            if size_matches(entry.size, size, self.config.size_tolerance) {
                return None;
            }
            replace = true;
        }
        Some(replace)
    }

    /// Upload one file, optionally replacing a stale remote copy. Failures
    /// are logged and reported as `false`.
    async fn upload_file(&self, path: &Path, remote_dir: &str, kind: FileKind, replace: bool) -> bool {
        let Ok(_permit) = self.limit.acquire().await else {
            return false;
        };

        if replace && let Some(name) = path.file_name() {
            let remote_file = format!("{remote_dir}/{}", name.to_string_lossy());
            match self.storage.remove(&remote_file).await {
                Ok(true) => debug!(remote_file, "Removed stale remote copy"),
                Ok(false) => debug!(remote_file, "Stale remote copy not removed"),
                Err(e) => warn!(remote_file, error = %e, "Failed to remove stale remote copy"),
            }
        }

        match self.storage.upload(path, remote_dir).await {
            Ok(true) => {
                if kind == FileKind::Videos && self.config.delete_after_upload {
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => info!(path = %path.display(), "Deleted uploaded result"),
                        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete uploaded result"),
                    }
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(path = %path.display(), remote_dir, error = %e, "Upload failed");
                false
            }
        }
    }
}

/// [`ResultSink`] uploading each finished item's video and metadata.
pub struct UploadSink {
    sync: Arc<UploadSync>,
}

impl UploadSink {
    pub fn new(sync: Arc<UploadSync>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl ResultSink for UploadSink {
    async fn deliver(&self, recipient: &Recipient, item: &Item) -> Result<bool> {
        let name = recipient.name.as_str();
        let layout = &self.sync.layout;
        let video = layout.result_file(name, &item.id);
        let metadata = layout.metadata_file(name, &item.id);

        let mut ok = true;
        for (path, kind) in [(video, FileKind::Videos), (metadata, FileKind::Metadata)] {
            if !path.is_file() {
                continue;
            }
            let remote_dir = self.sync.config.remote_dir(kind.as_str(), name);
            ok &= self.sync.upload_file(&path, &remote_dir, kind, false).await;
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemoryStorage {
        remote: Vec<RemoteEntry>,
        uploads: parking_lot::Mutex<Vec<(PathBuf, String)>>,
        removed: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteStorage for MemoryStorage {
        async fn upload(&self, local: &Path, remote_dir: &str) -> Result<bool> {
            self.uploads
                .lock()
                .push((local.to_path_buf(), remote_dir.to_string()));
            Ok(true)
        }

        async fn list(&self, _remote_dir: &str, _recursive: bool) -> Result<Vec<RemoteEntry>> {
            Ok(self.remote.clone())
        }

        async fn remove(&self, remote_file: &str) -> Result<bool> {
            self.removed.lock().push(remote_file.to_string());
            Ok(true)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: Layout,
        state: Arc<StateStore>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().join("target"), ".mp4");
        let state = Arc::new(StateStore::new(&dir.path().join("state")));
        std::fs::create_dir_all(layout.result_dir("alice")).unwrap();
        std::fs::create_dir_all(layout.metadata_dir("alice")).unwrap();
        Fixture {
            _dir: dir,
            layout,
            state,
        }
    }

    fn entry(name: &str, size: u64) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            size,
            is_dir: false,
        }
    }

    #[tokio::test]
    async fn test_sync_uploads_only_what_is_needed() {
        let f = fixture().await;
        f.state.add_completed("alice", ["v1", "v2", "v3"]).await.unwrap();

        std::fs::write(f.layout.result_file("alice", "v1"), vec![0u8; 1000]).unwrap();
        std::fs::write(f.layout.result_file("alice", "v2"), vec![0u8; 1000]).unwrap();
        std::fs::write(f.layout.result_file("alice", "v3"), b"").unwrap();
        std::fs::write(f.layout.result_file("alice", "v4"), vec![0u8; 1000]).unwrap();
        std::fs::write(f.layout.metadata_file("alice", "v1"), b"{}").unwrap();

        let storage = Arc::new(MemoryStorage {
            remote: vec![entry("v1.mp4", 1040), entry("/x/week1/v2.mp4", 10)],
            ..Default::default()
        });
        let config = UploadConfig {
            remote_root: "/r".to_string(),
            ..UploadConfig::default()
        };
        let sync = UploadSync::new(storage.clone(), f.state.clone(), f.layout.clone(), config);

        let report = sync.sync_recipient("alice").await.unwrap();

        // v1 matches remotely, v3 is empty, v4 is not completed
        assert_eq!(report.skipped, 3);
        assert_eq!(report.uploaded.len(), 2);
        assert!(report.failed.is_empty());

        let uploads = storage.uploads.lock();
        assert!(uploads.contains(&(f.layout.result_file("alice", "v2"), "/r/videos/alice".to_string())));
        assert!(uploads.contains(&(f.layout.metadata_file("alice", "v1"), "/r/metadata/alice".to_string())));
        assert_eq!(*storage.removed.lock(), vec!["/r/videos/alice/v2.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_sink_uploads_item_and_deletes_video() {
        let f = fixture().await;
        std::fs::write(f.layout.result_file("alice", "v1"), b"video").unwrap();
        std::fs::write(f.layout.metadata_file("alice", "v1"), b"{}").unwrap();

        let storage = Arc::new(MemoryStorage::default());
        let config = UploadConfig {
            delete_after_upload: true,
            ..UploadConfig::default()
        };
        let sync = Arc::new(UploadSync::new(
            storage.clone(),
            f.state.clone(),
            f.layout.clone(),
            config,
        ));
        let sink = UploadSink::new(sync);
        let item = Item {
            id: "v1".to_string(),
            source: PathBuf::from("v1.mp4"),
            position: 0,
            class: crate::discovery::ItemClass::PlainMark,
        };

        assert!(sink.deliver(&Recipient::new("alice"), &item).await.unwrap());
        assert_eq!(storage.uploads.lock().len(), 2);
        assert!(!f.layout.result_file("alice", "v1").exists());
        assert!(f.layout.metadata_file("alice", "v1").exists());
    }
}
