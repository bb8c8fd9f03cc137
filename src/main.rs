use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use log::info;
use puente::config::Config;
use puente::error::{PuenteError, PuenteResult};
use puente::Puente;

#[derive(Parser)]
#[command(name = "puente")]
#[command(about = "A transparent TCP reverse proxy for MySQL group-replication clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/puente.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Configuration mode (cluster or static)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => run_proxy(config).await,
        Commands::Config { mode, output } => generate_config(&mode, output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{e}");
        let code = if e.is_fatal() { 1 } else { 2 };
        process::exit(code);
    }
}

async fn run_proxy(config_path: PathBuf) -> PuenteResult<()> {
    let config = Config::load_from_file(&config_path)?;
    init_logging(&config);

    info!("Starting puente v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", config_path.display());

    let puente = Puente::new(config)?;
    puente.run().await
}

fn generate_config(mode: &str, output: PathBuf) -> PuenteResult<()> {
    Config::create_example_config(&output, mode)?;
    println!("Configuration file generated: {}", output.display());
    println!("Edit the file to match your environment and run:");
    println!("  puente run --config {}", output.display());
    Ok(())
}

fn validate_config(config_path: PathBuf) -> PuenteResult<()> {
    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("Configuration file is valid");
            println!("  routes: {}", config.routing.len());
            for (index, route) in config.routing.iter().enumerate() {
                let validated = route.validate(index).map_err(PuenteError::Config)?;
                match validated.settings.bind_address {
                    Some(bind) => println!(
                        "  [{}] {} on {}",
                        validated.settings.name,
                        validated.mode,
                        bind
                    ),
                    None => println!("  [{}] {}", validated.settings.name, validated.mode),
                }
            }
            if let Some(metadata) = &config.metadata_cache {
                let validated = metadata.validate().map_err(PuenteError::Config)?;
                println!(
                    "  metadata cluster '{}' via {} bootstrap server(s)",
                    validated.cluster_name,
                    validated.bootstrap_servers.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration file validation failed: {e}");
            Err(PuenteError::Config(e))
        }
    }
}

fn show_version() {
    println!("puente v{}", env!("CARGO_PKG_VERSION"));
    println!("A transparent TCP reverse proxy for MySQL group-replication clusters");
    println!();
    println!("Features:");
    println!("  - metadata-cache driven routing with automatic failover");
    println!("  - read-write, read-only and read-write-ring destination policies");
    println!("  - per-client connection error accounting");
    println!("  - classic and X protocol listeners, TCP and named sockets");
}

fn init_logging(config: &Config) {
    let log_level = match config.logging.level.as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();
}
