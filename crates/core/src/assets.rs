use std::collections::BTreeSet;
use std::path::Path;

use walkdir::WalkDir;

pub const DEFAULT_ASSET_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "svg", "bmp"];

/// Recognized asset extensions, compared case-insensitively and without the dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFilter {
    extensions: BTreeSet<String>,
}

impl AssetFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn is_asset(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_ascii_lowercase()))
    }

    /// Counts assets under `root`. Unreadable entries are skipped.
    pub fn count_assets(&self, root: &Path) -> u64 {
        walk_tree(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| !entry.file_type().is_dir() && self.is_asset(entry.path()))
            .count() as u64
    }
}

impl Default for AssetFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ASSET_EXTENSIONS)
    }
}

/// The one walk order shared by replication and manifest building.
pub(crate) fn walk_tree(root: &Path) -> WalkDir {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
}
