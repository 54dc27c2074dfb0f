use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use pixelwall_core::artwork::JsonArtworkStore;
use pixelwall_core::config::{Config, LoggingConfig};
use pixelwall_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "pixelwall",
    about = "Real-time collaborative pixel canvas server",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 7154)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show whether a local gateway is running
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Exported artworks
    Artworks {
        #[command(subcommand)]
        action: ArtworkAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[derive(Subcommand)]
enum ArtworkAction {
    /// List exported artworks, oldest first
    List,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level));
    for directive in &logging.filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log filter {directive:?}: {e}"),
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("Config: {warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("Config: {error}");
                }
                anyhow::bail!("Invalid configuration in {}", config_path.display());
            }

            let port = port.unwrap_or_else(|| config.gateway_port());
            let grid = config.grid();
            tracing::info!(
                grid = %grid.name,
                width = grid.width,
                height = grid.height,
                auth = config.auth_mode(),
                "Starting PixelWall gateway on port {port}"
            );

            let state = GatewayState::from_config(config)?;
            #[cfg(feature = "metrics")]
            let state = state.with_metrics(pixelwall_gateway::metrics::install_prometheus_recorder()?);

            pixelwall_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Status => {
            println!("PixelWall v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Artworks: {}", config.artwork_dir().display());
            println!("Gateway port: {}", config.gateway_port());

            let url = format!("http://127.0.0.1:{}/health", config.gateway_port());
            match reqwest::get(&url).await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    println!(
                        "Status: running ({} connections, {} groups)",
                        body["connections"], body["groups"]
                    );
                }
                _ => println!("Status: not running"),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at {key}"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK");
            }
        },
        Commands::Artworks { action } => match action {
            ArtworkAction::List => {
                let store = JsonArtworkStore::new(config.artwork_dir());
                let records = store.list().await?;
                if records.is_empty() {
                    println!("No artworks in {}", config.artwork_dir().display());
                }
                for record in records {
                    let art = &record.artwork;
                    let creators: Vec<&str> =
                        art.creators.iter().map(|c| c.display_name.as_str()).collect();
                    println!(
                        "{}  {}  {}x{}  {}  by {}",
                        record.id,
                        art.created_at.format("%Y-%m-%d %H:%M"),
                        art.width,
                        art.height,
                        art.title,
                        creators.join(", ")
                    );
                }
            }
        },
    }

    Ok(())
}
