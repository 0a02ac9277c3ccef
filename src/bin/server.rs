//! HTTP server for the CSV analyst API

use anyhow::{Context, Result};
use clap::Parser;
use csv_analyst::api::{create_router, AppState};
use csv_analyst::classifier::ColumnClassifier;
use csv_analyst::config::AppConfig;
use csv_analyst::db::{init_pool, run_migrations, PgFileCatalog, PgIdentityProvider, PgStore};
use csv_analyst::llm::{CompletionService, LlmClient};
use csv_analyst::preprocess::Preprocessor;
use csv_analyst::quality::QualityAnalyzer;
use csv_analyst::query_engine::ChatQueryEngine;
use csv_analyst::storage::LocalObjectStore;
use csv_analyst::upload::UploadService;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "server")]
#[command(about = "CSV upload, preprocessing and natural-language query API")]
struct Args {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,

    /// Skip creating the service tables on start-up
    #[arg(long)]
    no_migrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("csv_analyst=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AppConfig::from_env().context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    info!("🚀 Starting CSV analyst API (model {}, {} tables)", config.openai_model, config.access_policy);

    let pool = init_pool(&config.database_url, config.max_connections)
        .await
        .context("connecting to the database")?;
    if !args.no_migrate {
        run_migrations(&pool, config.query_role.as_deref()).await.context("running migrations")?;
    }

    let llm: Arc<dyn CompletionService> = Arc::new(LlmClient::new(
        config.openai_api_key.clone(),
        config.openai_model.clone(),
        config.openai_base_url.clone(),
    ));
    let store = Arc::new(
        PgStore::new(pool.clone(), Duration::from_secs(config.sql_timeout_secs))
            .with_query_role(config.query_role.clone()),
    );
    let files = Arc::new(PgFileCatalog::new(pool.clone()));
    let objects = Arc::new(LocalObjectStore::new(config.object_store_dir.clone()));
    let analyzer = QualityAnalyzer::new(config.low_value_threshold);

    let state = AppState {
        engine: Arc::new(ChatQueryEngine::new(llm.clone(), store.clone(), files.clone(), config.engine.clone())),
        uploads: Arc::new(UploadService::new(files.clone(), store.clone(), objects, config.access_policy)),
        classifier: Arc::new(ColumnClassifier::new(llm, config.engine.llm_timeout)),
        preprocessor: Arc::new(Preprocessor::new(analyzer.clone())),
        analyzer,
        identity: Arc::new(PgIdentityProvider::new(pool)),
        files,
        executor: store.clone(),
        tables: store,
    };

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("✅ Listening on {}", config.bind_addr);

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
