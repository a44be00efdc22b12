use crate::migration::DestructivePolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MEMORY_LOCATION: &str = ":memory:";

const JOURNAL_MODES: &[&str] = &["delete", "truncate", "persist", "memory", "wal", "off"];

/// Store and migration settings for [`Database::open`](crate::Database::open)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// File path, or `:memory:`
    pub store_location: String,
    /// Defaults to the registry's version
    pub target_version: Option<u32>,
    pub destructive_recreate: DestructivePolicy,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
    pub foreign_keys: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            store_location: MEMORY_LOCATION.to_string(),
            target_version: None,
            destructive_recreate: DestructivePolicy::Never,
            busy_timeout_ms: 5000,
            journal_mode: "wal".to_string(),
            foreign_keys: true,
        }
    }
}

impl DatabaseConfig {
    pub fn at(location: impl Into<String>) -> Self {
        Self {
            store_location: location.into(),
            ..Self::default()
        }
    }

    pub fn is_memory(&self) -> bool {
        self.store_location == MEMORY_LOCATION
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_location.trim().is_empty() {
            return Err(Error::Config("store_location is empty".to_string()));
        }
        let mode = self.journal_mode.to_ascii_lowercase();
        if !JOURNAL_MODES.contains(&mode.as_str()) {
            return Err(Error::Config(format!(
                "journal_mode must be one of {}, got {}",
                JOURNAL_MODES.join(", "),
                self.journal_mode
            )));
        }
        Ok(())
    }
}

/// Contents of `relmap.toml`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelmapConfig {
    /// Path to the schema manifest
    pub manifest: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("relmap.toml")
}

pub fn default_manifest_path() -> PathBuf {
    PathBuf::from("schema.toml")
}

pub fn default_database_path_in(base: &Path) -> PathBuf {
    base.join(".relmap").join("relmap.db")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<RelmapConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: RelmapConfig = toml::from_str(&contents)?;
    config.database.validate()?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &RelmapConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn ensure_gitignore(project_root: &Path) -> anyhow::Result<()> {
    let gitignore_path = project_root.join(".gitignore");
    let entry = ".relmap/";

    let mut content = String::new();
    if gitignore_path.exists() {
        content = std::fs::read_to_string(&gitignore_path)?;
        if content.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
    }
    content.push_str(entry);
    content.push('\n');
    std::fs::write(&gitignore_path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert!(config.is_memory());
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.journal_mode, "wal");
        assert!(config.foreign_keys);
        assert_eq!(config.destructive_recreate, DestructivePolicy::Never);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let config: RelmapConfig = toml::from_str(
            r#"
            manifest = "schema.toml"

            [database]
            store_location = "app.db"
            target_version = 2
            destructive_recreate = { from_versions = [1] }
            "#,
        )
        .unwrap();
        assert_eq!(config.database.store_location, "app.db");
        assert_eq!(config.database.target_version, Some(2));
        assert_eq!(config.database.destructive_recreate, DestructivePolicy::FromVersions(vec![1]));
        assert_eq!(config.database.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_rejects_unknown_journal_mode() {
        let config = DatabaseConfig {
            journal_mode: "wal; DROP TABLE x".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relmap.toml");
        let config = RelmapConfig {
            manifest: Some("schema.toml".to_string()),
            database: DatabaseConfig::at("data/app.db"),
        };
        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.database, config.database);
    }

    #[test]
    fn test_gitignore_entry_added_once() {
        let dir = tempfile::tempdir().unwrap();
        ensure_gitignore(dir.path()).unwrap();
        ensure_gitignore(dir.path()).unwrap();
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content.matches(".relmap/").count(), 1);
    }
}
