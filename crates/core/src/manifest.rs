use std::path::{Component, Path, PathBuf};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::assets::{AssetFilter, walk_tree};
use crate::upload::RemoteIdentity;
use crate::{Error, Result};

pub const MANIFEST_HEADER: [&str; 3] = ["display name", "reserved", "asset URL"];

/// Everything except RFC 3986 unreserved characters is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub display_name: String,
    /// Left blank for annotation downstream.
    pub reserved: String,
    pub url: String,
}

pub fn manifest_path(publish_root: &Path, folder_name: &str, suffix: &str, extension: &str) -> PathBuf {
    publish_root.join(format!("{folder_name}{suffix}.{extension}"))
}

/// Rows for every asset under `asset_dir`, in walk order. URLs are built from
/// the path relative to `publish_root`, not to `asset_dir`.
pub fn build_manifest(
    asset_dir: &Path,
    publish_root: &Path,
    identity: &RemoteIdentity,
    cdn_base: &str,
    filter: &AssetFilter,
) -> Result<Vec<ManifestRow>> {
    let mut rows = Vec::new();
    for entry in walk_tree(asset_dir) {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_dir() || !filter.is_asset(path) {
            continue;
        }

        let rel = path
            .strip_prefix(publish_root)
            .map_err(|_| Error::InvalidConfig {
                message: format!(
                    "{} is not inside publish root {}",
                    path.display(),
                    publish_root.display()
                ),
            })?;
        let display_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        rows.push(ManifestRow {
            display_name,
            reserved: String::new(),
            url: asset_url(cdn_base, identity, rel)?,
        });
    }
    Ok(rows)
}

/// `https://<cdn_base>/<owner>/<repo>/<encoded relative path>`
pub fn asset_url(cdn_base: &str, identity: &RemoteIdentity, rel: &Path) -> Result<String> {
    Ok(format!(
        "https://{}/{}/{}/{}",
        cdn_base.trim_matches('/'),
        encode_segment(&identity.owner),
        encode_segment(&identity.repo_name),
        encode_relative_path(rel)?
    ))
}

/// Encodes each path segment on its own and joins them with `/`.
pub fn encode_relative_path(rel: &Path) -> Result<String> {
    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| Error::NonUtf8Path {
                    path: rel.to_path_buf(),
                })?;
                segments.push(encode_segment(part));
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidConfig {
                    message: format!("not a plain relative path: {}", rel.display()),
                });
            }
        }
    }
    Ok(segments.join("/"))
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

pub fn write_manifest(path: &Path, rows: &[ManifestRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(MANIFEST_HEADER)?;
    for row in rows {
        writer.write_record([&row.display_name, &row.reserved, &row.url])?;
    }
    writer.flush()?;
    Ok(())
}
