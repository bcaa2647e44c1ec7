//! Terminal request purge

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::Worker;
use crate::coordinator::LeaderElector;
use crate::error::{PorticoError, Result};
use crate::metrics::standard;
use crate::store::RequestStore;

/// Deletes terminal requests whose last update is older than the retention window.
///
/// PENDING requests are never touched, however old.
pub struct PurgeWorker {
    store: RequestStore,
    leader: Arc<LeaderElector>,
    retention: Duration,
    interval: Duration,
}

impl PurgeWorker {
    pub fn new(
        store: RequestStore,
        leader: Arc<LeaderElector>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            leader,
            retention,
            interval,
        }
    }

    /// Delete expired terminal requests; returns how many were removed
    pub async fn purge(&self) -> Result<usize> {
        let retention = ChronoDuration::from_std(self.retention).map_err(|e| PorticoError::InvalidConfig {
            reason: format!("Purge retention out of range: {}", e),
        })?;
        let cutoff = Utc::now() - retention;

        let expired: Vec<_> = self
            .store
            .list_requests()
            .await?
            .into_iter()
            .filter(|r| r.status.is_terminal() && r.updated_at < cutoff)
            .collect();

        let mut purged = 0;
        for request in expired {
            self.leader.ensure_leader("purge requests")?;
            self.store.delete_request(&request.request_id).await?;
            debug!("Purged {} request {} ({})", request.status, request.request_id, request.service_id());
            purged += 1;
        }

        if purged > 0 {
            standard::REQUESTS_PURGED.inc_by(purged as u64);
            info!("Purged {} terminal requests older than {:?}", purged, self.retention);
        }
        Ok(purged)
    }
}

#[async_trait]
impl Worker for PurgeWorker {
    fn name(&self) -> &'static str {
        "purge"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> Result<()> {
        self.purge().await.map(|_| ())
    }
}
