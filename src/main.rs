//! Relmap CLI - manage and query a relmap store from a schema manifest

mod commands;
mod output;

use clap::{Parser, Subcommand};
pub use output::{OutputMode, emit_error, emit_success};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "relmap")]
#[command(version)]
#[command(about = "Typed relational mapping over SQLite - schema, migrations and queries")]
#[command(long_about = r#"
Relmap keeps a SQLite store in step with a versioned schema manifest:
  • Fresh installs and verified, atomic migration chains
  • Schema-checked queries with declared result shapes
  • Drift detection between the manifest and the live store

Example usage:
  relmap init
  relmap migrate
  relmap query "SELECT name FROM person WHERE age >= :minAge" -p minAge=18
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress banners and spinners
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to relmap.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store location (overrides the config file)
    #[arg(short, long, global = true)]
    database: Option<String>,

    /// Schema manifest (overrides the config file)
    #[arg(short, long, global = true)]
    manifest: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write relmap.toml and a starter schema manifest
    Init {
        /// Overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Bring the store to the manifest's target version
    Migrate,

    /// Show installed and target versions and the pending steps
    Status,

    /// Print the DDL of a schema version
    Schema {
        /// Version to print (defaults to the target)
        #[arg(long)]
        version: Option<u32>,
    },

    /// Compile a statement against the schema and run it
    Query {
        /// SQL text with `:name` or `?` placeholders
        sql: String,

        /// Declared result shape: scalar, single, many or affected
        #[arg(short, long, default_value = "many")]
        shape: relmap::ReturnShape,

        /// Named parameter value (name=value)
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Positional parameter value, in order
        #[arg(short, long = "arg")]
        args: Vec<String>,
    },

    /// Compare the live store with the manifest's schema
    Verify,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Init { .. } => "init",
            Commands::Migrate => "migrate",
            Commands::Status => "status",
            Commands::Schema { .. } => "schema",
            Commands::Query { .. } => "query",
            Commands::Verify => "verify",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mode = OutputMode::from_flags(cli.json, cli.quiet);

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let command = cli.command.name();
    if let Err(e) = run(cli, mode).await {
        emit_error(mode, command, &e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, mode: OutputMode) -> anyhow::Result<()> {
    let overrides = commands::Overrides {
        config: cli.config,
        database: cli.database,
        manifest: cli.manifest,
    };
    match cli.command {
        Commands::Init { force } => commands::run_init(mode, &overrides, force),
        Commands::Migrate => commands::run_migrate(mode, &overrides).await,
        Commands::Status => commands::run_status(mode, &overrides),
        Commands::Schema { version } => commands::run_schema(mode, &overrides, version),
        Commands::Query {
            sql,
            shape,
            params,
            args,
        } => commands::run_query(mode, &overrides, sql, shape, params, args).await,
        Commands::Verify => commands::run_verify(mode, &overrides),
    }
}
