use std::net::SocketAddr;
use std::path::PathBuf;

use agri_sync::{build_scheduler, config::scheduler_config_path, load_jobs, AppConfig, Services};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "agri=info,tower_http=info,sqlx=warn";

#[derive(Debug, Parser)]
#[command(name = "agri-cli")]
#[command(about = "Agricultural open-data ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP ingestion triggers.
    Serve,
    /// Run one survey ingestion from a zipped CSV extract.
    IngestSurveys {
        #[arg(long)]
        zip_url: String,
        #[arg(long)]
        csv_file_name: String,
    },
    /// Fetch current weather for every known unit.
    IngestWeather,
    /// Run the scheduled HTTP jobs from a JSON job file.
    Schedule {
        #[arg(long, env = "SCHEDULER_CONFIG_PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = AppConfig::from_env().context("loading configuration")?;
            let services = Services::connect(&config).await?;
            let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
            agri_web::serve(services.into(), addr).await?;
        }
        Commands::IngestSurveys {
            zip_url,
            csv_file_name,
        } => {
            let config = AppConfig::from_env().context("loading configuration")?;
            let services = Services::connect(&config).await?;
            let summary = services
                .surveys
                .run(&zip_url, &csv_file_name)
                .await
                .context("survey ingestion")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::IngestWeather => {
            let config = AppConfig::from_env().context("loading configuration")?;
            let services = Services::connect(&config).await?;
            let summary = services.weather.run().await.context("weather ingestion")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule { config } => {
            let path = config.unwrap_or_else(|| scheduler_config_path(|name| std::env::var(name).ok()));
            let jobs = load_jobs(&path).await?;
            let (mut scheduler, registered) = build_scheduler(jobs, reqwest::Client::new()).await?;
            if registered == 0 {
                warn!(path = %path.display(), "no valid jobs configured");
            }
            scheduler.start().await.context("starting scheduler")?;
            info!(jobs = registered, "scheduler running");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
