use crate::{OutputMode, emit_success};
use anyhow::Context;
use owo_colors::OwoColorize;
use relmap::config::{
    DatabaseConfig, RelmapConfig, default_config_path, default_database_path_in, default_manifest_path,
    ensure_db_dir, ensure_gitignore, load_config, write_config,
};
use relmap::manifest::{Manifest, STARTER_MANIFEST};
use relmap::migration::MigrationEngine;
use relmap::migration::verify::verify_snapshot;
use relmap::storage::{SqliteStore, TxnMode, introspect};
use relmap::ui::{self, Icons};
use relmap::{Database, Params, QueryResult, QueryTemplate, ReturnShape, Value};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Global flags that override `relmap.toml`
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub database: Option<String>,
    pub manifest: Option<PathBuf>,
}

struct Resolved {
    database: DatabaseConfig,
    manifest_path: PathBuf,
}

fn resolve(overrides: &Overrides) -> anyhow::Result<Resolved> {
    let config = load_config(overrides.config.as_deref())?.unwrap_or_default();
    let mut database = config.database;
    if let Some(location) = &overrides.database {
        database.store_location = location.clone();
    }
    if !database.is_memory() {
        ensure_db_dir(Path::new(&database.store_location))?;
    }
    let manifest_path = overrides
        .manifest
        .clone()
        .or_else(|| config.manifest.map(PathBuf::from))
        .unwrap_or_else(default_manifest_path);
    Ok(Resolved {
        database,
        manifest_path,
    })
}

fn load_manifest(path: &Path) -> anyhow::Result<Manifest> {
    Manifest::load(path).with_context(|| format!("loading schema manifest {}", path.display()))
}

fn store_exists(config: &DatabaseConfig) -> bool {
    config.is_memory() || Path::new(&config.store_location).exists()
}

pub fn run_init(mode: OutputMode, overrides: &Overrides, force: bool) -> anyhow::Result<()> {
    let config_path = overrides.config.clone().unwrap_or_else(default_config_path);
    let root = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let manifest_path = overrides.manifest.clone().unwrap_or_else(default_manifest_path);
    let location = overrides
        .database
        .clone()
        .unwrap_or_else(|| default_database_path_in(&root).to_string_lossy().to_string());

    let config = RelmapConfig {
        manifest: Some(manifest_path.to_string_lossy().to_string()),
        database: DatabaseConfig::at(location.clone()),
    };
    write_config(&config_path, &config, force)?;

    let wrote_manifest = force || !manifest_path.exists();
    if wrote_manifest {
        std::fs::write(&manifest_path, STARTER_MANIFEST)
            .with_context(|| format!("writing {}", manifest_path.display()))?;
    }
    if !config.database.is_memory() {
        ensure_db_dir(Path::new(&location))?;
        ensure_gitignore(&root)?;
    }

    if mode.is_human() {
        ui::success(&format!("Wrote {}", config_path.display()));
        if wrote_manifest {
            ui::success(&format!("Wrote starter manifest {}", manifest_path.display()));
        }
        ui::info("Store", &location);
        println!();
        println!("  Next: edit the manifest, then run {}", "relmap migrate".bold());
    } else {
        emit_success(
            mode,
            "init",
            serde_json::json!({
                "config": config_path.display().to_string(),
                "manifest": manifest_path.display().to_string(),
                "manifest_written": wrote_manifest,
                "store_location": location,
            }),
        )?;
    }
    Ok(())
}

pub async fn run_migrate(mode: OutputMode, overrides: &Overrides) -> anyhow::Result<()> {
    let ctx = resolve(overrides)?;
    let manifest = load_manifest(&ctx.manifest_path)?;
    let target = manifest.target()?;
    let options = manifest.open_options(ctx.database.clone())?;

    let spinner = mode
        .shows_progress()
        .then(|| ui::Spinner::new(&format!("Migrating {} to v{}", ctx.database.store_location, target)));
    let opened = Database::open(options).await;
    let elapsed = spinner.as_ref().map(ui::Spinner::finish);
    let db = opened?;
    let report = db.migration_report().clone();
    db.close();

    if mode.is_human() {
        ui::header(&format!("Store {}", ctx.database.store_location));
        if report.created {
            println!("{} Created schema v{}", Icons::NEW, report.to);
        }
        if report.recreated {
            ui::warn(&format!(
                "Dropped and recreated every table (no path from v{} to v{})",
                report.from, report.to
            ));
        }
        for (from, to) in &report.applied {
            ui::step(*from, *to);
        }
        if report.is_noop() {
            ui::success(&format!("Already at v{}", report.to));
        } else {
            ui::success(&format!("Migrated v{} -> v{}", report.from, report.to));
        }
        if let Some(elapsed) = elapsed {
            ui::timing(&elapsed);
        }
    } else {
        emit_success(mode, "migrate", &report)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    store_location: String,
    exists: bool,
    installed: u32,
    target: u32,
    pending: Option<Vec<(u32, u32)>>,
    tables: Vec<String>,
    /// None when the installed version is not in the manifest
    identity_matches: Option<bool>,
}

pub fn run_status(mode: OutputMode, overrides: &Overrides) -> anyhow::Result<()> {
    let ctx = resolve(overrides)?;
    let manifest = load_manifest(&ctx.manifest_path)?;
    let target = manifest.target()?;

    let exists = store_exists(&ctx.database);
    let (installed, stored_identity, tables) = if exists {
        let store = SqliteStore::open(&ctx.database)?;
        store.transaction(TxnMode::Deferred, |txn| {
            Ok::<_, rusqlite::Error>((
                introspect::read_version(txn)?,
                introspect::read_identity(txn)?,
                introspect::user_tables(txn)?,
            ))
        })?
    } else {
        (0, None, Vec::new())
    };

    let engine = MigrationEngine::new(manifest.snapshot(target)?, manifest.steps()?)?;
    // version 0 is a fresh install from the target DDL, not a chain
    let pending = if installed == 0 {
        Some(Vec::new())
    } else {
        engine
            .plan(installed)
            .ok()
            .map(|chain| chain.iter().map(|s| (s.from(), s.to())).collect::<Vec<_>>())
    };
    let identity_matches = match (&stored_identity, manifest.snapshot(installed)) {
        (Some(stored), Ok(snapshot)) => Some(stored == snapshot.identity_hash()),
        _ => None,
    };

    let report = StatusReport {
        store_location: ctx.database.store_location.clone(),
        exists,
        installed,
        target,
        pending,
        tables,
        identity_matches,
    };

    if mode.is_human() {
        ui::header(&format!("Store {}", report.store_location));
        let pending = match &report.pending {
            Some(steps) if steps.is_empty() && installed == 0 => "fresh install".to_string(),
            Some(steps) if steps.is_empty() => "none".to_string(),
            Some(steps) => steps
                .iter()
                .map(|(from, to)| format!("v{from} -> v{to}"))
                .collect::<Vec<_>>()
                .join(", "),
            None => "no migration path".to_string(),
        };
        let identity = match report.identity_matches {
            Some(true) => "matches manifest",
            Some(false) => "CHANGED without a version bump",
            None => "unknown",
        };
        println!(
            "{}",
            ui::properties_table(&[
                ("Installed version", report.installed.to_string()),
                ("Target version", report.target.to_string()),
                ("Pending steps", pending),
                ("Tables", report.tables.len().to_string()),
                ("Schema identity", identity.to_string()),
            ])
        );
        if report.pending.is_none() {
            ui::warn("No migration path; enable destructive_recreate or add steps to the manifest");
        }
    } else {
        emit_success(mode, "status", &report)?;
    }
    Ok(())
}

pub fn run_schema(mode: OutputMode, overrides: &Overrides, version: Option<u32>) -> anyhow::Result<()> {
    let ctx = resolve(overrides)?;
    let manifest = load_manifest(&ctx.manifest_path)?;
    let version = match version {
        Some(v) => v,
        None => manifest.target()?,
    };
    let snapshot = manifest.snapshot(version)?;
    let statements = snapshot.create_statements();

    if mode.is_human() {
        println!(
            "{}",
            ui::dim(&format!(
                "-- schema v{version} ({} tables, identity {})",
                snapshot.entities().len(),
                &snapshot.identity_hash()[..12]
            ))
        );
        for statement in &statements {
            ui::sql(statement);
        }
    } else {
        emit_success(
            mode,
            "schema",
            serde_json::json!({
                "version": version,
                "identity": snapshot.identity_hash(),
                "entities": snapshot.entities(),
                "statements": statements,
            }),
        )?;
    }
    Ok(())
}

/// Parse a command-line parameter value: `null`, an integer, a real, or text
fn parse_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(r) = raw.parse::<f64>() {
        Value::Real(r)
    } else {
        Value::Text(raw.to_string())
    }
}

fn parse_params(named: Vec<String>, positional: Vec<String>) -> anyhow::Result<Params> {
    if !named.is_empty() && !positional.is_empty() {
        anyhow::bail!("use either --param name=value or --arg value, not both");
    }
    if !positional.is_empty() {
        return Ok(Params::positional(positional.iter().map(|v| parse_value(v))));
    }
    named.iter().try_fold(Params::new(), |params, pair| {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("parameter {pair:?} is not name=value"))?;
        Ok(params.set(name.trim(), parse_value(value)))
    })
}

pub async fn run_query(
    mode: OutputMode,
    overrides: &Overrides,
    sql: String,
    shape: ReturnShape,
    named: Vec<String>,
    positional: Vec<String>,
) -> anyhow::Result<()> {
    let ctx = resolve(overrides)?;
    let manifest = load_manifest(&ctx.manifest_path)?;
    let db = Database::open(manifest.open_options(ctx.database)?).await?;

    let template = QueryTemplate::new(sql, shape).infer_params()?;
    let query = db.compile(&template)?;
    let params = parse_params(named, positional)?;
    let result = db.execute(&query, params).await?;
    db.close();

    if mode.is_human() {
        let tables = |set: &std::collections::BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(", ");
        if mode.shows_progress() {
            ui::info("Reads", &tables(query.read_set()));
            if query.is_write() {
                ui::info("Writes", &tables(query.write_set()));
            }
        }
        match &result {
            QueryResult::Scalar(value) => println!("{value}"),
            QueryResult::Single(None) => println!("{}", ui::dim("(no row)")),
            QueryResult::Single(Some(_)) | QueryResult::Many(_) => {
                let rows = result.rows();
                if !rows.is_empty() {
                    println!("{}", ui::rows_table(rows));
                }
                println!("{}", ui::dim(&format!("{} row(s)", rows.len())));
            }
            QueryResult::Affected(n) => ui::success(&format!("{n} row(s) affected")),
        }
    } else {
        emit_success(mode, "query", &result)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    version: u32,
    differences: Vec<String>,
    identity_matches: Option<bool>,
}

pub fn run_verify(mode: OutputMode, overrides: &Overrides) -> anyhow::Result<()> {
    let ctx = resolve(overrides)?;
    let manifest = load_manifest(&ctx.manifest_path)?;
    if !store_exists(&ctx.database) {
        anyhow::bail!("store {} does not exist; run `relmap migrate`", ctx.database.store_location);
    }
    let store = SqliteStore::open(&ctx.database)?;

    let installed = store.transaction(TxnMode::Deferred, introspect::read_version)?;
    if installed == 0 {
        anyhow::bail!("no schema installed in {}; run `relmap migrate`", ctx.database.store_location);
    }
    let snapshot = manifest
        .snapshot(installed)
        .with_context(|| format!("installed version v{installed} is not declared in the manifest"))?;
    let (differences, stored_identity) = store.transaction(TxnMode::Deferred, |txn| {
        Ok::<_, rusqlite::Error>((verify_snapshot(txn, &snapshot)?, introspect::read_identity(txn)?))
    })?;
    let report = VerifyReport {
        version: installed,
        identity_matches: stored_identity.map(|stored| stored == snapshot.identity_hash()),
        differences,
    };

    if !report.differences.is_empty() {
        if mode.is_human() {
            for diff in &report.differences {
                ui::warn(diff);
            }
        }
        anyhow::bail!(
            "store differs from schema v{} in {} place(s)",
            report.version,
            report.differences.len()
        );
    }
    if report.identity_matches == Some(false) {
        ui::warn("stored schema identity differs from the manifest; was the schema edited without a version bump?");
    }

    if mode.is_human() {
        ui::success(&format!("Store matches schema v{}", report.version));
    } else {
        emit_success(mode, "verify", &report)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("NULL"), Value::Null);
        assert_eq!(parse_value("18"), Value::Integer(18));
        assert_eq!(parse_value("1.5"), Value::Real(1.5));
        assert_eq!(parse_value("Ann"), Value::Text("Ann".into()));
    }

    #[test]
    fn test_parse_params() {
        let params = parse_params(vec!["minAge=18".into(), "name=Ann".into()], vec![]).unwrap();
        assert_eq!(params, Params::new().set("minAge", 18).set("name", "Ann"));

        let positional = parse_params(vec![], vec!["1".into(), "x".into()]).unwrap();
        assert_eq!(positional, Params::positional([Value::Integer(1), Value::Text("x".into())]));

        assert!(parse_params(vec!["broken".into()], vec![]).is_err());
        assert!(parse_params(vec!["a=1".into()], vec!["2".into()]).is_err());
    }
}
