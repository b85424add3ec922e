//! Background worker: runs queued tasks until ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use ledgerline_infra::AppConfig;
use ledgerline_infra::db;
use ledgerline_infra::jobs::{
    ProcessorConfig, RedisBroker, SendVerifyEmailHandler, TASK_SEND_VERIFY_EMAIL, TaskProcessor,
};
use ledgerline_infra::mail::LogSender;
use ledgerline_infra::store::PgStore;
use ledgerline_observability::LogConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    ledgerline_observability::init(&LogConfig::for_environment(
        &config.environment,
        config.log_level.clone(),
    ));
    info!(?config, "starting worker");

    let pool = db::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to postgres")?;
    db::migrate(&pool).await.context("failed to run migrations")?;
    db::health_check(&pool).await.context("postgres health check failed")?;
    let coordinator = config.coordinator(PgStore::new(pool));

    let broker = RedisBroker::connect(&config.redis_url, config.queue_namespace.clone())
        .await
        .context("failed to connect to redis")?;

    let mailer = Arc::new(LogSender::new(
        &config.email_sender_name,
        &config.email_sender_address,
    ));

    let mut processor = TaskProcessor::new(
        Arc::new(broker),
        ProcessorConfig::default()
            .with_name("ledgerline-worker")
            .with_concurrency(config.worker_concurrency),
    );
    processor.register_handler(
        TASK_SEND_VERIFY_EMAIL,
        SendVerifyEmailHandler::new(coordinator, mailer, &config.verify_email_base_url),
    );

    let stats = processor
        .start(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c, shutting down");
            }
        })
        .await;

    info!(
        processed = stats.tasks_processed,
        succeeded = stats.tasks_succeeded,
        retried = stats.tasks_retried,
        archived = stats.tasks_archived,
        "worker stopped"
    );
    Ok(())
}
