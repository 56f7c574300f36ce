//! Source and recipient discovery.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::state::natural_cmp;
use crate::{Error, Result};

/// A named participant who receives a copy of every item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    /// External contact name, when it differs from `name`.
    pub alias: Option<String>,
}

impl Recipient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }
}

/// Processing class of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemClass {
    /// Gets the visible logo and an invisible mark in sampled frames.
    InvisibleMark,
    /// Gets the visible logo only.
    PlainMark,
}

impl std::fmt::Display for ItemClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemClass::InvisibleMark => write!(f, "invisible"),
            ItemClass::PlainMark => write!(f, "plain"),
        }
    }
}

/// One source video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Source file stem; unique across the listing.
    pub id: String,
    pub source: PathBuf,
    /// Index in the full, naturally ordered listing.
    pub position: usize,
    pub class: ItemClass,
}

/// Parse recipients text: `name` or `name,alias` per line.
///
/// Blank lines and `#` comments are ignored; later duplicates are dropped.
pub fn parse_recipients(text: &str) -> Vec<Recipient> {
    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, alias) = match line.split_once(',') {
            Some((name, alias)) => (name.trim(), Some(alias.trim())),
            None => (line, None),
        };
        if name.is_empty() {
            continue;
        }
        if !seen.insert(name.to_string()) {
            debug!(name, "Duplicate recipient ignored");
            continue;
        }
        recipients.push(Recipient {
            name: name.to_string(),
            alias: alias.filter(|a| !a.is_empty()).map(str::to_string),
        });
    }
    recipients
}

/// Read the recipients file. A missing file yields no recipients.
pub fn load_recipients(path: &Path) -> Result<Vec<Recipient>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse_recipients(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Recipients file not found");
            Ok(Vec::new())
        }
        Err(e) => Err(Error::io_path("reading", path, e)),
    }
}

fn is_candidate(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.starts_with("output") {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
}

fn walk(dir: &Path, extensions: &[String], found: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io_path("listing", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io_path("listing", dir, e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| Error::io_path("inspecting", &path, e))?;
        if file_type.is_dir() {
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !hidden {
                walk(&path, extensions, found)?;
            }
        } else if is_candidate(&path, extensions) {
            found.push(path);
        }
    }
    Ok(())
}

fn stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

/// Source files under `dir` (recursive), naturally ordered by stem.
///
/// Hidden files and files named `output*` are skipped. When two files share a
/// stem, the first in order wins and the other is reported.
pub fn discover_sources(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if dir.is_file() {
        return Ok(vec![dir.to_path_buf()]);
    }
    if !dir.exists() {
        warn!(dir = %dir.display(), "Source directory does not exist");
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    walk(dir, extensions, &mut found)?;
    found.sort_by(|a, b| {
        let a_stem = stem(a).unwrap_or_default();
        let b_stem = stem(b).unwrap_or_default();
        natural_cmp(&a_stem, &b_stem).then_with(|| a.cmp(b))
    });

    let mut seen = HashSet::new();
    found.retain(|path| match stem(path) {
        Some(id) if seen.insert(id.clone()) => true,
        Some(id) => {
            warn!(id, path = %path.display(), "Duplicate item id, ignoring file");
            false
        }
        None => false,
    });
    Ok(found)
}

/// Assign ids, positions and classes to a naturally ordered listing.
pub fn classify(sources: Vec<PathBuf>, config: &AppConfig) -> Vec<Item> {
    sources
        .into_iter()
        .enumerate()
        .filter_map(|(position, source)| {
            let id = stem(&source)?;
            let class = if config.needs_invisible_mark(position) {
                ItemClass::InvisibleMark
            } else {
                ItemClass::PlainMark
            };
            Some(Item {
                id,
                source,
                position,
                class,
            })
        })
        .collect()
}

/// Discover and classify every item under the configured source directory.
pub fn discover_items(config: &AppConfig) -> Result<Vec<Item>> {
    let sources = discover_sources(&config.paths.source_dir, &config.encode.source_extensions)?;
    let items = classify(sources, config);
    debug!(count = items.len(), "Discovered items");
    Ok(items)
}
