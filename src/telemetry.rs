use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::clock::{Clock, SystemClock};
use crate::delivery::Broadcaster;
use crate::persistence::Repository;

/// Structured logs filtered by `RUST_LOG`, `info` when unset.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install the global Prometheus recorder; the handle renders `/metrics`.
pub fn install_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    metrics::describe_counter!("chat_messages_total", "Accepted posts by visibility");
    metrics::describe_counter!("chat_rejections_total", "Rejected client actions by reason");
    metrics::describe_counter!("chat_commands_total", "Applied moderation commands");
    metrics::describe_counter!("chat_auto_mutes_total", "Spam threshold trips");
    metrics::describe_gauge!("chat_sessions_active", "Open websocket sessions");
    metrics::describe_gauge!("chat_online_participants", "Distinct signed-in participants");
    Ok(handle)
}

/// Health check status for the server
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub storage: &'static str,
    pub storage_reachable: bool,
    pub active_sessions: usize,
    pub online_participants: usize,
    pub timestamp: i64,
}

impl HealthStatus {
    pub async fn check(repo: &dyn Repository, broadcaster: &Broadcaster) -> Self {
        let storage_reachable = repo.ping().await;
        Self {
            healthy: storage_reachable,
            storage: repo.backend_name(),
            storage_reachable,
            active_sessions: broadcaster.registry().connection_count(),
            online_participants: broadcaster.online_count(),
            timestamp: SystemClock.now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::SessionRegistry;
    use crate::persistence::MemoryRepository;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health_reports_storage_and_sessions() {
        let repo = MemoryRepository::new();
        let broadcaster = Broadcaster::new(Arc::new(SessionRegistry::new(5, 16)));
        let (_guard, _rx) = broadcaster.connect("origin").unwrap();

        let health = HealthStatus::check(&repo, &broadcaster).await;
        assert!(health.healthy);
        assert_eq!(health.storage, "memory");
        assert_eq!(health.active_sessions, 1);
        assert_eq!(health.online_participants, 0);

        repo.set_failing(true);
        assert!(!HealthStatus::check(&repo, &broadcaster).await.healthy);
    }
}
