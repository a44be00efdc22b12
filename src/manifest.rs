//! Schema manifest - versioned entity lists and SQL migration steps in TOML
//!
//! ```toml
//! target_version = 2
//!
//! [[versions]]
//! version = 2
//!
//! [[versions.entities]]
//! table = "person"
//! primary_key = { columns = ["id"], auto_increment = true }
//! columns = [
//!     { name = "id", type = "integer" },
//!     { name = "name", type = "text" },
//!     { name = "city", type = "text", default = "''" },
//! ]
//!
//! [[migrations]]
//! from = 1
//! to = 2
//! sql = ["ALTER TABLE person ADD COLUMN city TEXT NOT NULL DEFAULT ''"]
//! ```

use crate::config::DatabaseConfig;
use crate::database::OpenOptions;
use crate::migration::MigrationStep;
use crate::schema::{EntityDescriptor, SchemaError, SchemaRegistry, SchemaSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Cannot read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Manifest declares no schema versions")]
    Empty,

    #[error("Schema version {0} declared twice")]
    DuplicateVersion(u32),

    #[error("Schema version {0} is not declared")]
    UnknownVersion(u32),

    #[error("Schema v{version}: {source}")]
    Schema {
        version: u32,
        #[source]
        source: SchemaError,
    },
}

/// Entities of one schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSpec {
    pub version: u32,
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,
}

/// A SQL migration step between two declared versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSpec {
    pub from: u32,
    pub to: u32,
    #[serde(default)]
    pub sql: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Defaults to the highest declared version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<u32>,
    #[serde(default)]
    pub versions: Vec<VersionSpec>,
    #[serde(default)]
    pub migrations: Vec<MigrationSpec>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(text)?;
        let mut seen = HashSet::new();
        for spec in &manifest.versions {
            if !seen.insert(spec.version) {
                return Err(ManifestError::DuplicateVersion(spec.version));
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn target(&self) -> Result<u32, ManifestError> {
        match self.target_version {
            Some(version) => Ok(version),
            None => self
                .versions
                .iter()
                .map(|v| v.version)
                .max()
                .ok_or(ManifestError::Empty),
        }
    }

    /// Sealed snapshot of a declared version
    pub fn snapshot(&self, version: u32) -> Result<Arc<SchemaSnapshot>, ManifestError> {
        let spec = self
            .versions
            .iter()
            .find(|v| v.version == version)
            .ok_or(ManifestError::UnknownVersion(version))?;
        let schema = |source| ManifestError::Schema { version, source };

        let mut registry = SchemaRegistry::new(version);
        for entity in &spec.entities {
            registry.register(entity.clone()).map_err(schema)?;
        }
        registry.seal().map_err(schema)
    }

    /// Migration steps, each checked against the snapshot of its `to` version
    pub fn steps(&self) -> Result<Vec<MigrationStep>, ManifestError> {
        self.migrations
            .iter()
            .map(|m| Ok(MigrationStep::sql(m.from, m.to, m.sql.clone(), self.snapshot(m.to)?)))
            .collect()
    }

    /// Open options for the target version with every declared step
    pub fn open_options(&self, config: DatabaseConfig) -> Result<OpenOptions, ManifestError> {
        let snapshot = self.snapshot(self.target()?)?;
        Ok(OpenOptions::new(snapshot).config(config).steps(self.steps()?))
    }
}

/// Manifest written by `relmap init`
pub const STARTER_MANIFEST: &str = r#"[[versions]]
version = 1

[[versions.entities]]
table = "person"
primary_key = { columns = ["id"], auto_increment = true }
columns = [
    { name = "id", type = "integer" },
    { name = "name", type = "text" },
    { name = "age", type = "integer" },
]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::QueryResult;
    use crate::database::Database;
    use crate::migration::StepProcedure;
    use crate::query::{Params, QueryTemplate};
    use crate::value::Value;

    const TWO_VERSIONS: &str = r#"
[[versions]]
version = 1

[[versions.entities]]
table = "person"
primary_key = { columns = ["id"], auto_increment = true }
columns = [
    { name = "id", type = "integer" },
    { name = "name", type = "text" },
]

[[versions]]
version = 2

[[versions.entities]]
table = "person"
primary_key = { columns = ["id"], auto_increment = true }
columns = [
    { name = "id", type = "integer" },
    { name = "name", type = "text" },
    { name = "city", type = "text", default = "''" },
]

[[migrations]]
from = 1
to = 2
sql = ["ALTER TABLE `person` ADD COLUMN `city` TEXT NOT NULL DEFAULT ''"]
"#;

    #[test]
    fn test_parse_and_build() {
        let manifest = Manifest::parse(TWO_VERSIONS).unwrap();
        assert_eq!(manifest.target().unwrap(), 2);

        let v2 = manifest.snapshot(2).unwrap();
        assert!(v2.entity("person").unwrap().has_column("city"));

        let steps = manifest.steps().unwrap();
        assert_eq!(steps.len(), 1);
        assert!(matches!(steps[0].procedure(), StepProcedure::Sql(stmts) if stmts.len() == 1));
        assert_eq!(steps[0].post_condition().version(), 2);
    }

    #[test]
    fn test_starter_manifest_is_valid() {
        let manifest = Manifest::parse(STARTER_MANIFEST).unwrap();
        assert_eq!(manifest.target().unwrap(), 1);
        manifest.snapshot(1).unwrap();
    }

    #[test]
    fn test_errors() {
        assert!(matches!(Manifest::parse("").unwrap().target(), Err(ManifestError::Empty)));
        assert!(matches!(
            Manifest::parse("[[versions]]\nversion = 1\n[[versions]]\nversion = 1\n"),
            Err(ManifestError::DuplicateVersion(1))
        ));
        assert!(matches!(
            Manifest::parse(TWO_VERSIONS).unwrap().snapshot(7),
            Err(ManifestError::UnknownVersion(7))
        ));
        assert!(matches!(Manifest::parse("versions = 3"), Err(ManifestError::Parse(_))));
    }

    #[tokio::test]
    async fn test_upgrade_file_store_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::at(dir.path().join("app.db").to_string_lossy());
        let manifest = Manifest::parse(TWO_VERSIONS).unwrap();

        let v1_only = Manifest {
            target_version: Some(1),
            ..manifest.clone()
        };
        let db = Database::open(v1_only.open_options(config.clone()).unwrap()).await.unwrap();
        let insert = db
            .compile(&QueryTemplate::affected("INSERT INTO person (name) VALUES (:name)").param("name"))
            .unwrap();
        db.execute(&insert, Params::new().set("name", "Ann")).await.unwrap();
        db.close();
        drop(db);

        let db = Database::open(manifest.open_options(config).unwrap()).await.unwrap();
        assert_eq!(db.migration_report().applied, vec![(1, 2)]);
        let city = db
            .compile(&QueryTemplate::scalar("SELECT city FROM person WHERE name = :name").param("name"))
            .unwrap();
        let result = db.execute(&city, Params::new().set("name", "Ann")).await.unwrap();
        assert_eq!(result, QueryResult::Scalar(Value::Text(String::new())));
    }
}
