mod config;
mod dispatcher;
mod engine;
mod evaluator;
mod notifier;
mod pipeline;
mod sql;
mod staging;
mod store;


use anyhow::Context;
use config::LanguageConfigManager;
use dispatcher::{Dispatcher, JobHandler, RedisJobSource};
use engine::DockerEngine;
use notifier::RedisNotifier;
use ojudge_common::config::Config;
use ojudge_common::redis::Queue;
use pipeline::JudgePipeline;
use sql::MySqlEngine;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use staging::LocalStager;
use std::sync::Arc;
use std::time::Duration;
use store::PgStore;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {}", e);
        }
    }

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("ojudge worker booting...");

    let config = Config::from_env();

    let languages = LanguageConfigManager::load_or_default(&config.languages_config).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    // Redis: one client for the worker pools, one shared handle for notifications
    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    let notify_conn = redis::aio::ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis: {}", config.redis_url);

    let pg_pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to the submission store")?;
    info!("Connected to submission store");

    // The judge database is only needed once a SQL job arrives
    let mysql_pool = MySqlPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect_lazy(&config.judge_mysql_url)
        .context("Invalid JUDGE_MYSQL_URL")?;

    let docker = DockerEngine::connect(Duration::from_millis(config.sandbox_grace_ms))?;
    for runtime in languages.runtimes() {
        if let Err(e) = docker.ensure_image(runtime).await {
            warn!(language = %runtime.name, "{:#}", e);
        }
    }

    let stager = LocalStager::create(&config.code_dir).await?;
    info!("Staging source files in {}", stager.dir().display());

    let store = Arc::new(PgStore::new(pg_pool));
    let pipeline = JudgePipeline::new(
        store.clone(),
        Arc::new(docker),
        Arc::new(stager),
        Arc::new(MySqlEngine::new(mysql_pool)),
        Arc::new(languages),
    );
    let handler = JobHandler::new(
        Arc::new(pipeline),
        store,
        Arc::new(RedisNotifier::new(notify_conn)),
    );

    let dispatcher = Dispatcher::new(Arc::new(RedisJobSource::new(client)), Arc::new(handler))
        .with_pool(Queue::Problem, config.code_workers)
        .with_pool(Queue::TestProblem, config.code_workers)
        .with_pool(Queue::Mysql, config.sql_workers)
        .with_pool(Queue::TestMysql, config.sql_workers);

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            // Dropping the sender would stop the workers
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, finishing in-progress jobs...");
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await?;

    info!("Worker shutdown complete");
    Ok(())
}
