//! Durable per-recipient completion records.
//!
//! Two files live in the state directory:
//! - `progress.json`: recipient name to the naturally sorted list of completed item ids;
//! - `finished.txt`: one finished recipient per line.
//!
//! Completed sets only ever grow. Every write re-reads the file and merges, so
//! entries added by another writer are kept.

pub mod natural;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

pub use natural::{natural_cmp, sort_natural};

pub const PROGRESS_FILE: &str = "progress.json";
pub const FINISHED_FILE: &str = "finished.txt";

type Progress = BTreeMap<String, Vec<String>>;

/// File-backed completion store.
#[derive(Debug)]
pub struct StateStore {
    progress_path: PathBuf,
    finished_path: PathBuf,
    /// Serializes read-merge-write cycles; both files are shared by all recipients.
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self::with_paths(state_dir.join(PROGRESS_FILE), state_dir.join(FINISHED_FILE))
    }

    pub fn with_paths(progress_path: PathBuf, finished_path: PathBuf) -> Self {
        Self {
            progress_path,
            finished_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn progress_path(&self) -> &Path {
        &self.progress_path
    }

    async fn read_progress(&self) -> Result<Progress> {
        let contents = match tokio::fs::read_to_string(&self.progress_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Progress::new()),
            Err(e) => return Err(Error::io_path("reading", &self.progress_path, e)),
        };
        if contents.trim().is_empty() {
            return Ok(Progress::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    /// Every recipient's completed ids, each list in natural order.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.read_progress().await
    }

    pub async fn completed(&self, recipient: &str) -> Result<BTreeSet<String>> {
        let mut progress = self.read_progress().await?;
        Ok(progress
            .remove(recipient)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default())
    }

    /// Merge `ids` into the recipient's completed set and persist.
    ///
    /// Empty input does not touch the file. Re-adding a present id is a no-op.
    pub async fn add_completed<I, S>(&self, recipient: &str, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let mut progress = self.read_progress().await?;
        let entry = progress.entry(recipient.to_string()).or_default();

        let mut merged: BTreeSet<String> = entry.drain(..).collect();
        let before = merged.len();
        merged.extend(ids);
        if merged.len() == before {
            debug!(recipient, "Completed ids already recorded");
            return Ok(());
        }

        let mut list: Vec<String> = merged.into_iter().collect();
        sort_natural(&mut list);
        let added = list.len() - before;
        *entry = list;

        let json = serde_json::to_string_pretty(&progress)?;
        write_atomically(&self.progress_path, json.as_bytes()).await?;
        debug!(recipient, added, "Recorded completed items");
        Ok(())
    }

    /// `discovered` minus the completed set, in the caller's order.
    pub async fn pending(&self, recipient: &str, discovered: &[String]) -> Result<Vec<String>> {
        let completed = self.completed(recipient).await?;
        Ok(discovered
            .iter()
            .filter(|id| !completed.contains(*id))
            .cloned()
            .collect())
    }

    /// Finished recipients in the order they finished.
    pub async fn finished(&self) -> Result<Vec<String>> {
        let contents = match tokio::fs::read_to_string(&self.finished_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io_path("reading", &self.finished_path, e)),
        };
        let mut seen = HashSet::new();
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && seen.insert(name.to_string()))
            .map(str::to_string)
            .collect())
    }

    pub async fn is_finished(&self, recipient: &str) -> Result<bool> {
        Ok(self.finished().await?.iter().any(|name| name == recipient))
    }

    /// Record `recipient` as finished. Idempotent.
    pub async fn mark_finished(&self, recipient: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut names = self.finished().await?;
        if names.iter().any(|name| name == recipient) {
            return Ok(());
        }
        names.push(recipient.to_string());

        let mut contents = names.join("\n");
        contents.push('\n');
        write_atomically(&self.finished_path, contents.as_bytes()).await?;
        info!(recipient, "Recipient finished");
        Ok(())
    }
}

/// Replace `path` with `contents` through a synced sibling `.tmp` file and a rename.
async fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io_path("creating directory", parent, e))?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| Error::io_path("creating", &temp_path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| Error::io_path("writing", &temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::io_path("syncing", &temp_path, e))?;
    drop(file);
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| Error::io_path("replacing", path, e))?;
    Ok(())
}
