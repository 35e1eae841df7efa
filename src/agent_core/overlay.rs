//! Virtual file overlay.
//!
//! An in-memory projection of the project as it would look after applying
//! the complete file directives in a buffer. Untouched paths read through
//! to disk. The overlay is always rebuilt from the whole buffer, never
//! patched.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use super::tags::{file_directives, FileDirective};

/// Normalize a model-supplied path to a project-relative one.
///
/// Returns `None` for absolute paths and anything containing `..`. `.`
/// components are dropped, so `"."` maps to the empty path.
pub fn project_relative(raw: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw.trim()).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Overlay key: relative path with `/` separators.
fn overlay_key(raw: &str) -> Option<String> {
    let rel = project_relative(raw)?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEntry {
    Content(String),
    Deleted,
}

/// Proposed file state keyed by relative path.
#[derive(Debug, Clone)]
pub struct VirtualFileOverlay {
    root: PathBuf,
    entries: BTreeMap<String, OverlayEntry>,
}

impl VirtualFileOverlay {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Build from every complete directive in `buffer`, in order.
    pub fn build(root: impl Into<PathBuf>, buffer: &str) -> Self {
        let mut overlay = Self::new(root);
        for directive in file_directives(buffer) {
            overlay.apply(&directive);
        }
        overlay
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn apply(&mut self, directive: &FileDirective) {
        match directive {
            FileDirective::Write { path, content } => match overlay_key(path) {
                Some(key) => {
                    self.entries.insert(key, OverlayEntry::Content(content.clone()));
                }
                None => tracing::warn!(path = %path, "ignoring write outside the project"),
            },
            FileDirective::Delete { path } => match overlay_key(path) {
                Some(key) => {
                    self.entries.insert(key, OverlayEntry::Deleted);
                }
                None => tracing::warn!(path = %path, "ignoring delete outside the project"),
            },
            FileDirective::Rename { from, to } => {
                let (Some(from_key), Some(to_key)) = (overlay_key(from), overlay_key(to)) else {
                    tracing::warn!(from = %from, to = %to, "ignoring rename outside the project");
                    return;
                };
                match self.read(&from_key) {
                    Some(content) => {
                        self.entries.insert(from_key, OverlayEntry::Deleted);
                        self.entries.insert(to_key, OverlayEntry::Content(content));
                    }
                    None => tracing::warn!(from = %from, "rename source does not exist"),
                }
            }
        }
    }

    /// Current view of `path`: overlay content, or disk when untouched.
    pub fn read(&self, path: &str) -> Option<String> {
        let key = overlay_key(path)?;
        match self.entries.get(&key) {
            Some(OverlayEntry::Content(c)) => Some(c.clone()),
            Some(OverlayEntry::Deleted) => None,
            None => std::fs::read_to_string(self.root.join(&key)).ok(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &OverlayEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Paths the overlay touches, sorted.
    pub fn changed_paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Write the overlay to `root` on disk. Returns the paths changed.
pub async fn apply_to_disk(overlay: &VirtualFileOverlay) -> std::io::Result<Vec<String>> {
    let mut changed = Vec::new();
    for (key, entry) in overlay.entries() {
        let path = overlay.root().join(key);
        match entry {
            OverlayEntry::Content(content) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, content).await?;
            }
            OverlayEntry::Deleted => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            },
        }
        changed.push(key.to_string());
    }
    tracing::info!(count = changed.len(), "applied changes to disk");
    Ok(changed)
}
