use std::sync::Arc;
use std::time::Duration;

use showroom_agent::{LlmError, OpenAiCompatibleClient, WorkflowOrchestrator};
use showroom_core::config::AppConfig;
use showroom_db::{
    connect_with_config, migrations, DbPool, SqlConversationStore, SqlInventoryRepository,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub inventory: Arc<SqlInventoryRepository>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("language model client setup failed: {0}")]
    Llm(#[source] LlmError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let client = OpenAiCompatibleClient::from_config(&config.llm).map_err(BootstrapError::Llm)?;
    info!(
        event_name = "system.bootstrap.llm_ready",
        correlation_id = "bootstrap",
        provider = ?config.llm.provider,
        model = client.model(),
        "language model client configured"
    );

    let inventory = Arc::new(SqlInventoryRepository::new(db_pool.clone()));
    let store = Arc::new(SqlConversationStore::new(db_pool.clone()));
    let orchestrator = WorkflowOrchestrator::new(Arc::new(client), store, inventory.clone())
        .with_sample_size(config.inventory.sample_size)
        .with_max_query_rows(config.inventory.max_query_rows as usize)
        .with_stage_timeout(Duration::from_secs(config.llm.timeout_secs));

    Ok(Application { config, db_pool, inventory, orchestrator: Arc::new(orchestrator) })
}
