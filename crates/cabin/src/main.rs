//! cabin: dependency-aware, content-addressed builds of dataset tables.
//!
//! Subcommands:
//! - `init`: Create the workspace directories and catalog
//! - `list`: Show registered datasets
//! - `status`: Show catalogued versions and whether they are current
//! - `import`: Build datasets, reusing versions that already exist
//! - `prune`: Remove versions nothing current depends on
//! - `graph`: Draw the dataset dependency graph
//! - `shell`: Open the SQLite client on the data store or catalog

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cabin_engine::{
    DEFAULT_JOBS, DatasetPattern, Engine, ImportMode, PruneSelector, Registry, Targets, filter_entries,
};
use cabin_store::{TableStore, VersionRef};

mod datasets;
mod graph;
mod render;
mod settings;

use datasets::Roots;
use settings::{DEFAULT_HOME, Settings};

#[derive(Parser)]
#[command(name = "cabin")]
#[command(about = "Dependency-aware, content-addressed builds of dataset tables", long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(long, global = true, env = "CABIN_HOME", default_value = DEFAULT_HOME)]
    home: PathBuf,

    /// Version catalog database [default: <home>/catalog.db]
    #[arg(long, global = true, env = "CABIN_CATALOG")]
    catalog: Option<PathBuf>,

    /// Table data store [default: <home>/data.db]
    #[arg(long, global = true, env = "CABIN_DATA")]
    data: Option<PathBuf>,

    /// Directory for downloaded files [default: <home>/downloads]
    #[arg(long, global = true, env = "CABIN_DOWNLOADS")]
    downloads: Option<PathBuf>,

    /// Maximum number of transformations running at once
    #[arg(long, global = true, env = "CABIN_JOBS", default_value_t = DEFAULT_JOBS)]
    jobs: usize,

    /// Release year of the storm event details
    #[arg(long, global = true, env = "CABIN_STORM_YEAR", default_value = datasets::storm_details::DEFAULT_YEAR)]
    storm_year: String,

    /// Debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the workspace directories and catalog
    Init,

    /// Show registered datasets in declaration order
    List {
        /// Show kind, version, inputs and description
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show catalogued versions and whether they are current
    Status {
        /// Dataset names or globs to show
        #[arg(value_name = "PATTERN")]
        patterns: Vec<String>,

        /// Only show outdated versions
        #[arg(long)]
        outdated: bool,
    },

    /// Build datasets and everything they need
    Import {
        /// Dataset names or globs to build
        #[arg(value_name = "NAME", conflicts_with = "all")]
        names: Vec<String>,

        /// Build every registered dataset
        #[arg(long)]
        all: bool,

        /// Report what would be built without building anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove catalogued versions and their artifacts
    Prune {
        /// Versions (`#seq`, display name) or dataset globs
        #[arg(value_name = "TARGET")]
        targets: Vec<String>,

        /// Only prune outdated versions (everything outdated when no target is given)
        #[arg(long)]
        outdated: bool,

        /// Report what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Draw the dataset dependency graph
    Graph {
        /// Limit to these datasets plus their ancestors and descendants
        #[arg(value_name = "PATTERN")]
        patterns: Vec<String>,

        /// Emit Graphviz DOT instead of a text tree
        #[arg(long)]
        dot: bool,
    },

    /// Open the sqlite3 client on the data store
    Shell {
        /// Open the version catalog instead
        #[arg(long = "catalog-db")]
        catalog: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.debug {
        "cabin=debug,cabin_engine=debug,cabin_store=debug"
    } else {
        "cabin=info,cabin_engine=info,cabin_store=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = Settings::resolve(
        cli.home,
        cli.catalog,
        cli.data,
        cli.downloads,
        cli.jobs,
        Roots {
            storm_year: cli.storm_year,
        },
    );

    let result = match cli.command {
        Commands::Init => run_init(&settings).await,
        Commands::List { verbose } => run_list(&settings, verbose),
        Commands::Status { patterns, outdated } => run_status(&settings, &patterns, outdated),
        Commands::Import { names, all, dry_run } => run_import(&settings, &names, all, dry_run).await,
        Commands::Prune {
            targets,
            outdated,
            dry_run,
        } => run_prune(&settings, &targets, outdated, dry_run).await,
        Commands::Graph { patterns, dot } => run_graph(&settings, &patterns, dot),
        Commands::Shell { catalog } => run_shell(&settings, catalog).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "command failed");
    }
    result
}

/// Registry for commands that never run a transformation.
fn detached_registry(settings: &Settings) -> Result<Registry> {
    let tables = TableStore::open_in_memory().into_diagnostic()?;
    datasets::registry(Arc::new(tables), &settings.roots).into_diagnostic()
}

/// Engine over the workspace's catalog and stores.
fn open_engine(settings: &Settings) -> Result<Engine> {
    if !settings.is_initialized() {
        return Err(miette::miette!(
            "no catalog at {}; run `cabin init` first",
            settings.catalog.display()
        ));
    }
    let catalog = settings.open_catalog()?;
    let store = settings.open_store()?;
    let registry = datasets::registry(Arc::clone(store.tables()), &settings.roots).into_diagnostic()?;
    Ok(Engine::new(Arc::new(registry), Arc::new(catalog), store).with_jobs(settings.jobs))
}

fn parse_patterns(raw: &[String]) -> Result<Vec<DatasetPattern>> {
    raw.iter()
        .map(|p| DatasetPattern::new(p).into_diagnostic())
        .collect()
}

async fn run_init(settings: &Settings) -> Result<ExitCode> {
    settings.ensure_dirs().await?;
    let catalog = settings.open_catalog()?;
    let store = settings.open_store()?;
    store.ensure_dirs().await.into_diagnostic()?;
    let versions = catalog.len().into_diagnostic()?;
    info!(home = %settings.home.display(), versions, "workspace ready");
    println!("initialized cabin workspace at {}", settings.home.display());
    Ok(ExitCode::SUCCESS)
}

fn run_list(settings: &Settings, verbose: bool) -> Result<ExitCode> {
    let registry = detached_registry(settings)?;
    print!("{}", render::list(&registry, verbose));
    Ok(ExitCode::SUCCESS)
}

fn run_status(settings: &Settings, patterns: &[String], outdated: bool) -> Result<ExitCode> {
    let engine = open_engine(settings)?;
    let patterns = parse_patterns(patterns)?;
    let entries = engine.status().into_diagnostic()?;
    print!("{}", render::status(&filter_entries(entries, &patterns, outdated)));
    Ok(ExitCode::SUCCESS)
}

async fn run_import(settings: &Settings, names: &[String], all: bool, dry_run: bool) -> Result<ExitCode> {
    let targets = if all {
        Targets::All
    } else if names.is_empty() {
        return Err(miette::miette!("nothing to import: name datasets or pass --all"));
    } else {
        Targets::parse(names).into_diagnostic()?
    };
    let mode = if dry_run {
        ImportMode::Simulate
    } else {
        ImportMode::Execute
    };

    let engine = open_engine(settings)?;

    // Ctrl-C stops scheduling; running builds wind down and their output is discarded
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling import");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = engine
        .import_until(&targets, mode, Some(shutdown_rx))
        .await
        .into_diagnostic()?;
    print!("{}", render::import(&report));

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// `#seq` or a full display name, as opposed to a dataset glob.
fn is_version_ref(target: &str) -> bool {
    target.starts_with('#') || (target.matches("::").count() >= 2 && !target.contains(['*', '?', '[']))
}

/// Explicit versions when every target names one; otherwise patterns over
/// dataset and display names.
fn prune_selector(targets: &[String], outdated: bool) -> Result<PruneSelector> {
    if targets.is_empty() {
        return if outdated {
            Ok(PruneSelector::Outdated)
        } else {
            Err(miette::miette!("nothing to prune: name versions or patterns, or pass --outdated"))
        };
    }
    if !outdated && targets.iter().all(|t| is_version_ref(t)) {
        let refs = targets
            .iter()
            .map(|t| t.parse::<VersionRef>().map_err(|e| miette::miette!("{}", e)))
            .collect::<Result<Vec<_>>>()?;
        return Ok(PruneSelector::Versions(refs));
    }
    Ok(PruneSelector::Patterns {
        patterns: parse_patterns(targets)?,
        outdated_only: outdated,
    })
}

async fn run_prune(settings: &Settings, targets: &[String], outdated: bool, dry_run: bool) -> Result<ExitCode> {
    let selector = prune_selector(targets, outdated)?;
    let engine = open_engine(settings)?;

    let report = engine.prune(&selector, dry_run).await.into_diagnostic()?;
    print!("{}", render::prune(&report));

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn run_graph(settings: &Settings, patterns: &[String], dot: bool) -> Result<ExitCode> {
    let registry = detached_registry(settings)?;
    let selected = graph::neighbourhood(&registry, &parse_patterns(patterns)?).into_diagnostic()?;
    if dot {
        print!("{}", graph::dot(&registry, &selected));
    } else {
        print!("{}", graph::tree(&registry, &selected));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(unix)]
async fn run_shell(settings: &Settings, catalog: bool) -> Result<ExitCode> {
    use std::os::unix::process::CommandExt;

    let target = settings.shell_target(catalog);
    info!(database = %target.display(), "opening sqlite3");
    // Only returns on failure
    let err = std::process::Command::new("sqlite3").arg(target).exec();
    Err(miette::miette!("failed to run sqlite3: {}", err))
}

#[cfg(not(unix))]
async fn run_shell(settings: &Settings, catalog: bool) -> Result<ExitCode> {
    let target = settings.shell_target(catalog);
    info!(database = %target.display(), "opening sqlite3");
    let status = tokio::process::Command::new("sqlite3")
        .arg(target)
        .status()
        .await
        .map_err(|e| miette::miette!("failed to run sqlite3: {}", e))?;
    Ok(if status.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
