use crate::config::Config;
use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;

/// Upper bound for any single MongoDB call issued by the practice engine.
/// Callers degrade (selector) or surface an error (recorder/evaluator) once
/// it elapses; nothing in this crate blocks indefinitely on storage.
pub(crate) const STORE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Upper bound for Redis side-channel operations (idempotency cache).
pub(crate) const CACHE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

pub struct AppState {
    pub config: Config,
    pub mongo: Database,
    pub redis: ConnectionManager,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        // Create ConnectionManager with longer timeout
        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        tracing::info!("Redis ConnectionManager created, testing with PING...");

        // Test connection
        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            config,
            mongo,
            redis,
            http_client,
        })
    }
}

pub mod catalog_service;
pub mod completion_service;
pub mod recorder_service;
pub mod selector_service;
