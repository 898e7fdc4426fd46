//! impexp CLI - CityGML import into a 3D city database

use citydb::citygml::validate_files;
use citydb::config::{self, Config};
use citydb::event::{Event, EventDispatcher, InterruptKind};
use citydb::storage::SqliteStore;
use citydb::{input, ui, Importer};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "impexp")]
#[command(version = "0.1.0")]
#[command(about = "CityGML importer for a 3D city database")]
#[command(long_about = r#"
impexp streams CityGML files into a SQLite city database:
  • features and geometries are written by parallel worker pools
  • XLink references are resolved after each file has been parsed
  • large inputs stay within bounded memory through spill tables

Example usage:
  impexp init-config
  impexp import ./data/*.gml --database city.db
  impexp validate ./data
  impexp stats --database city.db
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import CityGML files, directories or wildcard patterns
    Import {
        /// Inputs, added to the ones in the configuration
        paths: Vec<PathBuf>,

        /// Path to the database file
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Database workspace to import into
        #[arg(short, long)]
        workspace: Option<String>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check inputs for structural errors without importing
    Validate {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show row counts of the city database
    Stats {
        /// Path to the database file
        #[arg(short, long)]
        database: Option<PathBuf>,
    },

    /// Write the default configuration file
    InitConfig {
        /// Target path (defaults to ./impexp.toml)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Import {
            paths,
            database,
            workspace,
            json,
        } => {
            let mut config = config::load_config(cli.config.as_deref())?;
            config.input.paths.extend(paths);
            if let Some(database) = database {
                config.database.path = database;
            }
            if let Some(workspace) = workspace {
                config.database.workspace = workspace;
            }
            config::ensure_db_dir(&config.database.path)?;

            let completed = run_import(config, json)?;
            if !completed {
                std::process::exit(1);
            }
        }

        Commands::Validate { paths } => {
            let files = input::expand_inputs(&paths)?;
            let mut invalid = 0;

            for (file, outcome) in validate_files(&files) {
                let name = file.display().to_string();
                let report = match outcome {
                    Ok(report) => report,
                    Err(e) => {
                        invalid += 1;
                        ui::error(&format!("{}: {}", name, e));
                        continue;
                    }
                };
                if report.is_valid() {
                    ui::success(&format!("{} ({} features)", name, report.features));
                    continue;
                }
                invalid += 1;
                ui::warn(&format!("{}: {} issue(s) in {} features", name, report.issues.len(), report.features));
                for (ordinal, issue) in &report.issues {
                    ui::issue(&format!("{}#{}", name, ordinal), issue.position, &issue.message);
                }
            }

            if invalid > 0 {
                ui::error(&format!("{} of {} file(s) failed validation", invalid, files.len()));
                std::process::exit(1);
            }
        }

        Commands::Stats { database } => {
            let config = config::load_config(cli.config.as_deref())?;
            let database = database.unwrap_or(config.database.path);
            if !database.exists() {
                anyhow::bail!("database {} does not exist", database.display());
            }

            let store = SqliteStore::open(&database)?;
            let stats = store.stats()?;
            ui::header(&format!("Database: {}", database.display()));
            println!("{}", stats);

            let by_class = store.count_by_class()?;
            if !by_class.is_empty() {
                ui::section("Features by class");
                println!("{}", ui::stats_table(&by_class));
            }
        }

        Commands::InitConfig { path, force } => {
            let path = path.unwrap_or_else(config::default_config_path);
            config::write_config(&path, &Config::default(), force)?;
            ui::success(&format!("Wrote default configuration to {}", path.display()));
        }
    }

    Ok(())
}

fn run_import(config: Config, json: bool) -> anyhow::Result<bool> {
    let events = Arc::new(EventDispatcher::new()?);
    forward_signals(&events);

    let total_files = input::expand_inputs(&config.input.paths).map(|f| f.len()).unwrap_or(0);
    let started = Instant::now();

    if !json {
        ui::header("Importing CityGML");
        ui::status(ui::Icons::FOLDER, "Inputs", &total_files.to_string());
        ui::status(ui::Icons::DATABASE, "Database", &config.database.path.display().to_string());
    }

    let progress = (!json).then(|| Arc::new(ui::ProgressManager::new(total_files)));
    let subscription = progress
        .as_ref()
        .map(|p| events.subscribe(Arc::clone(p) as Arc<dyn citydb::EventHandler>));

    let importer = Importer::new(config, Arc::clone(&events));
    let completed = importer.do_process();
    let summary = importer.summary();

    events.flush();
    if let Some(id) = subscription {
        events.unsubscribe(id);
    }
    events.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(completed);
    }

    if let Some(progress) = &progress {
        if completed {
            progress.finish_with_summary(
                started.elapsed(),
                summary.files.len(),
                summary.total_features(),
                summary.total_geometries(),
            );
        } else {
            progress.finish();
        }
    }

    let table = ui::summary_table(&summary);
    if !table.is_empty() {
        println!("{}", table);
    }
    if let Some(reason) = &summary.interrupt {
        ui::interrupted(reason);
    }
    if let Some(error) = &summary.error {
        ui::error(error);
    }
    Ok(completed)
}

/// SIGINT and SIGTERM become a user-abort interrupt.
#[cfg(unix)]
fn forward_signals(events: &Arc<EventDispatcher>) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!("Could not install signal handlers: {}", e);
            return;
        }
    };

    let events = Arc::clone(events);
    let spawned = std::thread::Builder::new().name("signals".into()).spawn(move || {
        for signal in signals.forever() {
            tracing::debug!("Received signal {}", signal);
            events.publish(Event::interrupt(
                InterruptKind::UserAbort,
                "Import aborted by user",
                tracing::Level::INFO,
            ));
        }
    });
    if let Err(e) = spawned {
        tracing::warn!("Could not start signal thread: {}", e);
    }
}

#[cfg(not(unix))]
fn forward_signals(_events: &Arc<EventDispatcher>) {}
