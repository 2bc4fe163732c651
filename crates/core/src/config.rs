use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::assets::{AssetFilter, DEFAULT_ASSET_EXTENSIONS};
use crate::upload::{PipelineConfig, RemoteIdentity};
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    /// Version-control working tree; empty means the current directory.
    #[serde(default)]
    pub publish_root: String,
    #[serde(default)]
    pub remote: Remote,
    #[serde(default)]
    pub vcs: Vcs,
    #[serde(default)]
    pub cdn: Cdn,
    #[serde(default)]
    pub assets: Assets,
    #[serde(default)]
    pub manifest: Manifest,
    #[serde(default)]
    pub copy: Replication,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_remote_name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vcs {
    pub program: String,
    #[serde(default = "default_true")]
    pub progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cdn {
    pub base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assets {
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub suffix: String,
    pub extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replication {
    pub failure_samples: usize,
}

fn default_true() -> bool {
    true
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_remote_name() -> String {
    "origin".to_string()
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            branch: default_branch(),
            name: default_remote_name(),
        }
    }
}

impl Default for Vcs {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            progress: true,
        }
    }
}

impl Default for Cdn {
    fn default() -> Self {
        Self {
            base: "cdn.jsdelivr.net/gh".to_string(),
        }
    }
}

impl Default for Assets {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_ASSET_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            suffix: "_urls".to_string(),
            extension: "csv".to_string(),
        }
    }
}

impl Default for Replication {
    fn default() -> Self {
        Self { failure_samples: 10 }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            publish_root: String::new(),
            remote: Remote::default(),
            vcs: Vcs::default(),
            cdn: Cdn::default(),
            assets: Assets::default(),
            manifest: Manifest::default(),
            copy: Replication::default(),
        }
    }
}

impl Settings {
    pub fn identity(&self) -> RemoteIdentity {
        RemoteIdentity {
            owner: self.remote.owner.trim().to_string(),
            repo_name: self.remote.repo.trim().to_string(),
            branch: self.remote.branch.trim().to_string(),
        }
    }

    pub fn publish_root(&self) -> Option<PathBuf> {
        let root = self.publish_root.trim();
        (!root.is_empty()).then(|| PathBuf::from(root))
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            vcs_program: self.vcs.program.trim().to_string(),
            remote_name: self.remote.name.trim().to_string(),
            push_progress: self.vcs.progress,
            cdn_base: self.cdn.base.trim().to_string(),
            manifest_suffix: self.manifest.suffix.clone(),
            manifest_extension: self.manifest.extension.trim().to_string(),
            assets: AssetFilter::new(&self.assets.extensions),
            failure_samples: self.copy.failure_samples,
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    parse_settings(&text)
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    let raw: toml::Value = toml::from_str(text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());
    if let Some(other) = version
        && other != SETTINGS_SCHEMA_VERSION
    {
        return Err(Error::InvalidConfig {
            message: format!(
                "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
            ),
        });
    }

    // A file without `version` is read as the current schema.
    let mut table = raw;
    if version.is_none()
        && let Some(t) = table.as_table_mut()
    {
        t.insert(
            "version".to_string(),
            toml::Value::Integer(i64::from(SETTINGS_SCHEMA_VERSION)),
        );
    }
    table.try_into().map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = to_toml(settings)?;
    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    let required = [
        ("remote.owner", &settings.remote.owner),
        ("remote.repo", &settings.remote.repo),
        ("remote.branch", &settings.remote.branch),
        ("remote.name", &settings.remote.name),
        ("vcs.program", &settings.vcs.program),
        ("cdn.base", &settings.cdn.base),
        ("manifest.extension", &settings.manifest.extension),
    ];
    for (key, value) in required {
        if value.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: format!("{key} must not be empty"),
            });
        }
    }

    for (key, value) in [
        ("remote.owner", &settings.remote.owner),
        ("remote.repo", &settings.remote.repo),
    ] {
        if value.contains('/') {
            return Err(Error::InvalidConfig {
                message: format!("{key} must not contain '/'"),
            });
        }
    }

    if AssetFilter::new(&settings.assets.extensions).is_empty() {
        return Err(Error::InvalidConfig {
            message: "assets.extensions must list at least one extension".to_string(),
        });
    }

    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        let mut s = Settings::default();
        s.remote.owner = "octo".to_string();
        s.remote.repo = "assets".to_string();
        s
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let s = parse_settings(
            r#"
[remote]
owner = "octo"
repo = "assets"
"#,
        )
        .unwrap();
        assert_eq!(s.version, SETTINGS_SCHEMA_VERSION);
        assert_eq!(s.remote.branch, "main");
        assert_eq!(s.remote.name, "origin");
        assert_eq!(s.vcs.program, "git");
        assert!(s.vcs.progress);
        assert_eq!(s.cdn.base, "cdn.jsdelivr.net/gh");
        assert_eq!(s.manifest.suffix, "_urls");
        assert!(s.publish_root().is_none());
        validate_settings(&s).unwrap();
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let err = parse_settings("version = 7\n").unwrap_err();
        assert!(err.to_string().contains("unsupported settings schema version: 7"));
    }

    #[test]
    fn validation_names_the_offending_key() {
        let mut s = valid();
        s.remote.owner = "  ".to_string();
        let err = validate_settings(&s).unwrap_err();
        assert!(err.to_string().contains("remote.owner"));

        let mut s = valid();
        s.assets.extensions = vec![" ".to_string()];
        assert!(validate_settings(&s).is_err());

        let mut s = valid();
        s.remote.repo = "a/b".to_string();
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn save_then_load_keeps_settings() {
        let temp = tempfile::tempdir().unwrap();
        let mut s = valid();
        s.publish_root = "/srv/assets".to_string();
        s.assets.extensions = vec!["png".to_string(), "avif".to_string()];
        save_settings(temp.path(), &s).unwrap();

        let loaded = load_settings(temp.path()).unwrap();
        assert_eq!(loaded.publish_root(), Some(PathBuf::from("/srv/assets")));
        let config = loaded.pipeline_config();
        assert!(config.assets.is_asset(Path::new("x.AVIF")));
        assert!(!config.assets.is_asset(Path::new("x.jpg")));
        assert_eq!(loaded.identity().repo_name, "assets");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let s = load_settings(temp.path()).unwrap();
        assert_eq!(s.version, SETTINGS_SCHEMA_VERSION);
        assert!(s.remote.owner.is_empty());
    }
}
