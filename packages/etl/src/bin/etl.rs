// Pipeline entry point: stage names select which stages run; no arguments
// runs the full sequence. Any stage failure aborts the remainder with a
// non-zero exit.

use anyhow::{Context, Result};
use clap::Parser;
use etl_core::config::Config;
use etl_core::pipeline::{Pipeline, StageContext};
use openai_client::OpenAIClient;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "etl")]
#[command(about = "Job posting enrichment pipeline")]
struct Cli {
    /// Stages to run, in order (e.g. "ingest llm-batch"); runs the full
    /// pipeline when omitted
    stages: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,etl_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(data_root = %config.data_root.display(), "configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let client = OpenAIClient::new(config.openai_api_key.clone());

    let ctx = StageContext {
        pool,
        client,
        config,
    };

    Pipeline::standard().run(&ctx, &cli.stages).await?;

    tracing::info!("pipeline complete");
    Ok(())
}
