use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use catalyst_core::gpc::GpcCatalog;
use catalyst_core::{normalize_languages, ActionType, InventoryType};
use catalyst_hiap::{HiapConfig, HiapService, PrioritizeRequest};
use catalyst_storage::{MemoryRankingStore, PgRankingStore, RankingStore};
use catalyst_web::{AppState, WebConfig};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "catalyst-cli")]
#[command(about = "CityCatalyst HIAP prioritization backend")]
struct Cli {
    /// Use a process-local store instead of DATABASE_URL.
    #[arg(long, global = true)]
    in_memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API, plus the poll scheduler when HIAP_SCHEDULER_ENABLED is set.
    Serve,
    /// Run a single status poll tick.
    Poll,
    /// Create ranking records for a project and start its first batch.
    Prioritize {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        year: i32,
        #[arg(long, default_value = "mitigation")]
        action_type: String,
        #[arg(long = "lang", default_value = "en")]
        langs: Vec<String>,
    },
    Migrate,
    /// Print the GPC rows an inventory type must report.
    RequiredRows {
        #[arg(long, default_value = "gpc_basic")]
        inventory_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catalyst=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = HiapConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let store = open_store(&config, cli.in_memory).await?;
            let hiap = HiapService::from_config(&config, store.clone())?;
            let scheduler = hiap.maybe_build_scheduler(&config).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting poll scheduler")?;
                info!(cron = %config.poll_cron, "poll scheduler started");
            }
            let web = WebConfig::from_env();
            let state = AppState::new(store, hiap, &web).context("loading GPC catalog")?;
            catalyst_web::serve(state, web.port).await?;
        }
        Commands::Poll => {
            let store = open_store(&config, cli.in_memory).await?;
            let hiap = HiapService::from_config(&config, store)?;
            let summary = hiap.poller.poll_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Prioritize {
            project,
            year,
            action_type,
            langs,
        } => {
            let action_type = ActionType::from_str(&action_type)?;
            let languages = normalize_languages(&langs)?;
            let store = open_store(&config, cli.in_memory).await?;
            let hiap = HiapService::from_config(&config, store)?;
            let summary = hiap
                .orchestrator
                .prioritize_project(&PrioritizeRequest {
                    project_id: project,
                    year,
                    action_type,
                    languages,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let store = PgRankingStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::RequiredRows { inventory_type } => {
            let inventory_type = InventoryType::from_str(&inventory_type)?;
            let catalog = GpcCatalog::embedded()?;
            let rows = catalog.required_rows(inventory_type);
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

async fn open_store(config: &HiapConfig, in_memory: bool) -> Result<Arc<dyn RankingStore>> {
    if in_memory {
        warn!("using in-memory store; rankings are lost on exit");
        return Ok(Arc::new(MemoryRankingStore::new()));
    }
    let store = PgRankingStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Arc::new(store))
}
