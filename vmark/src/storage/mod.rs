//! Remote storage reached through a command-line client.

pub mod sync;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::process::{ProcessSupervisor, RunOptions, progress};
use crate::state::sort_natural;
use crate::Result;

pub use sync::{SyncReport, UploadSink, UploadSync};

/// One row of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    /// Entry name; nested entries of a recursive listing carry their directory path.
    pub name: String,
    /// Size in bytes, 0 for directories.
    pub size: u64,
    pub is_dir: bool,
}

impl RemoteEntry {
    /// Final path component of `name`.
    pub fn file_name(&self) -> &str {
        let name = self.name.trim_end_matches('/');
        name.rsplit('/').next().unwrap_or(name)
    }
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Upload `local` into `remote_dir`. `Ok(false)` means the client reported failure.
    async fn upload(&self, local: &Path, remote_dir: &str) -> Result<bool>;

    /// List `remote_dir`, descending into subdirectories when `recursive`.
    async fn list(&self, remote_dir: &str, recursive: bool) -> Result<Vec<RemoteEntry>>;

    /// Delete one remote file. A missing file is not an error.
    async fn remove(&self, remote_file: &str) -> Result<bool>;
}

/// Parse a human size such as `82.67MB`, `1.5 GB`, `1024B` or `2.5K` into bytes.
///
/// Unparseable input yields 0.
pub fn parse_file_size(size: &str) -> u64 {
    static SIZE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*([KMGT]?)B?").unwrap());

    let upper = size.trim().to_uppercase();
    let Some(caps) = SIZE_RE.captures(&upper) else {
        return 0;
    };
    let Ok(value) = caps[1].parse::<f64>() else {
        return 0;
    };
    let multiplier: u64 = match &caps[2] {
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => 1,
    };
    (value * multiplier as f64) as u64
}

/// Whether a remote size string is within `tolerance` (a fraction) of `local_size`.
pub fn size_matches(remote_size: u64, local_size: u64, tolerance: f64) -> bool {
    if remote_size == 0 || local_size == 0 {
        return false;
    }
    let difference = remote_size.abs_diff(local_size) as f64 / local_size as f64;
    difference <= tolerance
}

/// Parse the table printed by `<client> ls <dir>`.
///
/// Rows follow the header line starting with `#` that names the size column:
/// `index size date time name`, a trailing `/` on the name marks a directory.
pub fn parse_listing(output: &str) -> Vec<RemoteEntry> {
    static ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*\d+\s+(\S+)\s+(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})\s+(.+)$").unwrap()
    });

    let mut lines = output.lines();
    if !lines
        .by_ref()
        .any(|line| line.trim().starts_with('#') && line.contains("文件大小"))
    {
        return Vec::new();
    }

    lines
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("总:") && !line.starts_with("----"))
        .filter_map(|line| ROW_RE.captures(line))
        .map(|caps| {
            let name = caps[3].trim().to_string();
            let is_dir = name.ends_with('/');
            RemoteEntry {
                size: if is_dir { 0 } else { parse_file_size(&caps[1]) },
                name,
                is_dir,
            }
        })
        .collect()
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_end_matches('/'))
}

/// Queue the subdirectories of `dir` in natural order.
fn push_dirs(queue: &mut VecDeque<String>, dir: &str, entries: &[RemoteEntry]) {
    let mut dirs: Vec<String> = entries
        .iter()
        .filter(|entry| entry.is_dir)
        .map(|entry| join_remote(dir, &entry.name))
        .collect();
    sort_natural(&mut dirs);
    queue.extend(dirs);
}

/// [`RemoteStorage`] driving a `BaiduPCS-Go` compatible client.
#[derive(Debug, Clone)]
pub struct PcsCliStorage {
    supervisor: ProcessSupervisor,
    tool: String,
    success_marker: String,
    total_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl PcsCliStorage {
    pub fn new(supervisor: ProcessSupervisor, config: &UploadConfig) -> Self {
        Self {
            supervisor,
            tool: config.tool.clone(),
            success_marker: config.success_marker.clone(),
            total_timeout: None,
            idle_timeout: None,
        }
    }

    pub fn with_timeouts(mut self, total: Option<Duration>, idle: Option<Duration>) -> Self {
        self.total_timeout = total;
        self.idle_timeout = idle;
        self
    }

    fn command(&self, args: &[&str]) -> String {
        let mut command = process_utils::quote_arg(&self.tool);
        for arg in args {
            command.push(' ');
            command.push_str(&process_utils::quote_arg(arg));
        }
        command
    }

    async fn list_one(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>> {
        let command = self.command(&["ls", remote_dir]);
        let output = self
            .supervisor
            .run(&command, RunOptions::new().capture().idle_timeout(self.idle_timeout))
            .await?;
        if !output.success() {
            debug!(remote_dir, exit_code = ?output.exit_code, "Listing failed, treating as empty");
            return Ok(Vec::new());
        }
        Ok(parse_listing(output.stdout.as_deref().unwrap_or_default()))
    }
}

#[async_trait]
impl RemoteStorage for PcsCliStorage {
    async fn upload(&self, local: &Path, remote_dir: &str) -> Result<bool> {
        if !local.is_file() {
            info!(path = %local.display(), "File no longer exists, skipping upload");
            return Ok(false);
        }
        let local_arg = local.to_string_lossy();
        let command = self.command(&["upload", local_arg.as_ref(), remote_dir]);
        let display_id = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| local_arg.to_string());
        let options = RunOptions::new()
            .capture()
            .progress(progress::upload())
            .display_id(display_id)
            .total_timeout(self.total_timeout)
            .idle_timeout(self.idle_timeout);

        let output = self.supervisor.run(&command, options).await?;
        if output.success() && output.stdout_contains(&self.success_marker) {
            info!(path = %local.display(), remote_dir, "Upload succeeded");
            return Ok(true);
        }
        warn!(
            path = %local.display(),
            remote_dir,
            exit_code = ?output.exit_code,
            "Upload did not report success"
        );
        Ok(false)
    }

    async fn list(&self, remote_dir: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        let entries = self.list_one(remote_dir).await?;
        if !recursive {
            return Ok(entries);
        }

        let mut files = Vec::new();
        let mut queue = VecDeque::new();
        push_dirs(&mut queue, remote_dir, &entries);
        files.extend(entries.into_iter().filter(|entry| !entry.is_dir));

        while let Some(dir) = queue.pop_front() {
            let entries = self.list_one(&dir).await?;
            push_dirs(&mut queue, &dir, &entries);
            files.extend(
                entries
                    .into_iter()
                    .filter(|entry| !entry.is_dir)
                    .map(|entry| RemoteEntry {
                        name: join_remote(&dir, &entry.name),
                        ..entry
                    }),
            );
        }
        debug!(remote_dir, files = files.len(), "Listed remote directory");
        Ok(files)
    }

    async fn remove(&self, remote_file: &str) -> Result<bool> {
        let command = self.command(&["rm", remote_file]);
        let output = self
            .supervisor
            .run(&command, RunOptions::new().capture().idle_timeout(self.idle_timeout))
            .await?;
        Ok(output.success() && output.stdout_contains("操作成功"))
    }
}
