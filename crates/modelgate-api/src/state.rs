//! Application state wiring storage, providers and the job engine together.
//!
//! The engine is generic over its store; AppState pins it to SQLite.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use modelgate_core::event::EventBus;
use modelgate_core::provider::{BoxCredentialProvider, BoxQuotaProvider};
use modelgate_core::service::{EngineOptions, JobEngine};
use modelgate_infra::config::load_global_config;
use modelgate_infra::pipeline::load_registry;
use modelgate_infra::provider::EnvCredentialProvider;
use modelgate_infra::sqlite::pool::{database_url, default_data_dir};
use modelgate_infra::sqlite::{DatabasePool, SqliteQuotaProvider, SqliteStore};
use modelgate_types::config::GlobalConfig;

pub type ConcreteEngine = JobEngine<SqliteStore>;

/// Shared application state used by every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub store: Arc<SqliteStore>,
    pub quotas: Arc<SqliteQuotaProvider>,
    pub config: GlobalConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database, load configuration and pipelines, wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        Self::init_at(default_data_dir()).await
    }

    pub async fn init_at(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await;

        let db_pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("Failed to open database")?;
        let store = Arc::new(SqliteStore::new(db_pool.clone()));

        let quotas = Arc::new(SqliteQuotaProvider::new(db_pool.clone()));
        quotas
            .sync_from_config(&config.quotas)
            .await
            .context("Failed to apply configured quotas")?;

        let registry = load_registry(&data_dir).context("Failed to load pipelines")?;

        let options = EngineOptions {
            quota: Arc::new(BoxQuotaProvider::new(SqliteQuotaProvider::new(db_pool))),
            credentials: Arc::new(BoxCredentialProvider::new(EnvCredentialProvider::new())),
            bus: EventBus::default(),
        };
        let engine = JobEngine::new(store.clone(), Arc::new(registry), config.clone(), options);

        Ok(Self {
            engine,
            store,
            quotas,
            config,
            data_dir,
        })
    }
}
