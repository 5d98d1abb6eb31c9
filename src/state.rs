use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StorageBackend};
use crate::delivery::{Broadcaster, SessionRegistry};
use crate::moderation::ModerationEngine;
use crate::persistence::{MemoryRepository, RedisRepository, Repository};
use crate::redis_client::RedisClient;
use crate::security::{AuthService, AuthThrottle, OriginKeyGenerator};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub engine: Arc<ModerationEngine>,
    pub auth: Arc<AuthService>,
    pub origin_keys: OriginKeyGenerator,
    pub auth_throttle: AuthThrottle,
    pub metrics: PrometheusHandle,
}

impl AppState {
    /// Connect storage and hydrate the moderation core from it.
    pub async fn new(config: Config, metrics: PrometheusHandle) -> Result<Self> {
        let repo: Arc<dyn Repository> = match config.storage {
            StorageBackend::Redis => {
                let redis = RedisClient::new(&config.redis_url)
                    .await
                    .context("Failed to connect to Redis")?;
                Arc::new(RedisRepository::new(redis))
            }
            StorageBackend::Memory => {
                tracing::warn!("using in-memory storage, nothing survives a restart");
                Arc::new(MemoryRepository::new())
            }
        };

        Self::with_repository(config, repo, Arc::new(SystemClock), metrics).await
    }

    pub async fn with_repository(
        config: Config,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        metrics: PrometheusHandle,
    ) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(
            config.max_connections_per_origin,
            config.session_buffer,
        ));
        let engine = Arc::new(
            ModerationEngine::load(
                config.moderation,
                clock,
                repo.clone(),
                Broadcaster::new(registry),
            )
            .await?,
        );
        let auth = Arc::new(AuthService::new(engine.clone(), config.server_secret.clone()));

        Ok(Self {
            origin_keys: OriginKeyGenerator::new(config.server_secret.clone()),
            auth_throttle: AuthThrottle::new(config.auth_requests_per_minute),
            config: Arc::new(config),
            repo,
            engine,
            auth,
            metrics,
        })
    }
}
