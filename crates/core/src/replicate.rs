use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::assets::walk_tree;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFailure {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub error: String,
}

/// Result of one best-effort tree copy.
///
/// `failures` holds files that failed both copy attempts, so
/// `success_count + failures.len()` is the number of files the walk found.
/// Directories that could not be created or read are reported separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOutcome {
    pub success_count: u64,
    pub failures: Vec<CopyFailure>,
    pub directory_failures: Vec<CopyFailure>,
}

impl CopyOutcome {
    pub fn total_files(&self) -> u64 {
        self.success_count + self.failures.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.directory_failures.is_empty()
    }
}

/// Mirrors `source` into `destination`. Never fails as a whole: every problem
/// is recorded in the returned outcome and the walk moves on.
pub fn replicate_tree(source: &Path, destination: &Path) -> CopyOutcome {
    let mut outcome = CopyOutcome::default();

    for entry in walk_tree(source) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(source).to_path_buf();
                let target = mirrored_path(source, destination, &path);
                warn!(event = "copy.walk_failed", path = %path.display(), error = %e, "copy.walk_failed");
                outcome.directory_failures.push(CopyFailure {
                    source: path,
                    destination: target,
                    error: e.to_string(),
                });
                continue;
            }
        };

        let path = entry.path();
        let target = mirrored_path(source, destination, path);

        if entry.file_type().is_dir() {
            if let Err(e) = fs::create_dir_all(&target) {
                warn!(
                    event = "copy.mkdir_failed",
                    target = %target.display(),
                    error = %e,
                    "copy.mkdir_failed"
                );
                outcome.directory_failures.push(CopyFailure {
                    source: path.to_path_buf(),
                    destination: target,
                    error: e.to_string(),
                });
            }
            continue;
        }

        match copy_with_fallback(path, &target) {
            Ok(()) => outcome.success_count += 1,
            Err(e) => {
                warn!(
                    event = "copy.file_failed",
                    source = %path.display(),
                    target = %target.display(),
                    error = %e,
                    "copy.file_failed"
                );
                outcome.failures.push(CopyFailure {
                    source: path.to_path_buf(),
                    destination: target,
                    error: e.to_string(),
                });
            }
        }
    }

    outcome
}

fn mirrored_path(source: &Path, destination: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(source) {
        Ok(rel) if rel.as_os_str().is_empty() => destination.to_path_buf(),
        Ok(rel) => destination.join(rel),
        Err(_) => destination.to_path_buf(),
    }
}

fn copy_with_fallback(src: &Path, dst: &Path) -> io::Result<()> {
    let first = match copy_with_metadata(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    debug!(
        event = "copy.retry",
        source = %src.display(),
        error = %first,
        "copy.retry"
    );

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(extended_length_path(parent))?;
    }
    copy_with_metadata(&extended_length_path(src), &extended_length_path(dst))
}

fn copy_with_metadata(src: &Path, dst: &Path) -> io::Result<()> {
    // fs::copy carries permission bits over, so the copy may already be read-only.
    fs::copy(src, dst)?;

    let meta = fs::metadata(src)?;
    let accessed = FileTime::from_last_access_time(&meta);
    let modified = FileTime::from_last_modification_time(&meta);
    if let Err(e) = filetime::set_file_times(dst, accessed, modified) {
        debug!(event = "copy.times_skipped", target = %dst.display(), error = %e, "copy.times_skipped");
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn extended_length_path(path: &Path) -> PathBuf {
    use std::ffi::OsString;

    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let text = abs.as_os_str().to_string_lossy();
    if text.starts_with(r"\\?\") {
        return abs;
    }
    if let Some(unc) = text.strip_prefix(r"\\") {
        return PathBuf::from(format!(r"\\?\UNC\{unc}"));
    }
    let mut prefixed = OsString::from(r"\\?\");
    prefixed.push(abs.as_os_str());
    PathBuf::from(prefixed)
}

#[cfg(not(windows))]
pub(crate) fn extended_length_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
