use exonerator::{
    config::ExoneratorConfig, importer::Importer, metrics::ExoneratorMetrics, query::QueryEngine, storage::FactStore,
};

use clap::{Parser, Subcommand};
use exonerator_utils::dates::format_timestamp;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "exonerator")]
#[command(version, about = "ExoneraTor - Was an IP address a Tor relay at a given date?")]
struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config file)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import new or modified consensuses and exit lists
    Import {
        /// Directory to import from (overrides config file)
        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Look up an address on a date and print the JSON response
    Query { address: String, date: String },

    /// Generate default configuration file
    GenerateConfig {
        #[arg(default_value = "exonerator.toml")]
        path: PathBuf,
    },

    /// Show database coverage and fact counts
    Stats,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).format_timestamp_millis().init();
    let args = Args::parse();

    if let Command::GenerateConfig { path } = &args.command {
        match ExoneratorConfig::create_default_config_file(path) {
            Ok(_) => {
                info!("Generated default configuration at {:?}", path);
                return;
            }
            Err(e) => {
                error!("Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => match ExoneratorConfig::from_file(path) {
            Ok(cfg) => {
                info!("Loaded configuration from {:?}", path);
                cfg
            }
            Err(e) => {
                error!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => ExoneratorConfig::default(),
    };

    // Override with CLI args if provided
    if let Some(database) = args.database {
        config.database.path = database;
    }
    if let Command::Import { directory: Some(directory) } = &args.command {
        config.import.directory = directory.clone();
    }

    let store = match FactStore::new(&config.database) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = match ExoneratorMetrics::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!("Failed to initialize metrics: {}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Command::Import { .. } => {
            let importer = Importer::with_metrics(store, &config.import, metrics.clone());
            if let Err(e) = importer.run() {
                error!("Import failed: {}", e);
                std::process::exit(1);
            }
            if config.metrics.enabled {
                info!("Import metrics:\n{}", metrics.gather());
            }
        }
        Command::Query { address, date } => {
            let engine = QueryEngine::with_metrics(store, &config.query, metrics);
            let response = match engine.lookup(&address, &date) {
                Ok(r) => r,
                Err(e) => {
                    error!("Query failed: {}", e);
                    std::process::exit(1);
                }
            };
            match response.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    error!("Failed to encode response: {}", e);
                    std::process::exit(1);
                }
            }
            info!("{}", response.summary());
        }
        Command::Stats => match store.statistics() {
            Ok(stats) => {
                let show = |t: Option<chrono::DateTime<chrono::Utc>>| {
                    t.map(|t| format_timestamp(&t)).unwrap_or_else(|| "-".to_string())
                };
                info!("=== Database Statistics ===");
                info!("Consensuses: {}", stats.snapshots);
                info!("First consensus: {}", show(stats.first_snapshot));
                info!("Last consensus: {}", show(stats.last_snapshot));
                info!("Status entry rows: {}", stats.status_rows);
                info!("Exit probe rows: {}", stats.exit_probe_rows);
            }
            Err(e) => {
                error!("Failed to read statistics: {}", e);
                std::process::exit(1);
            }
        },
        Command::GenerateConfig { .. } => {}
    }
}
