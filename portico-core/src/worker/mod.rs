//! Leader-only background workers
//!
//! Each worker performs one reconciliation pass per tick. The scheduler
//! decides when ticks run; workers only check leadership before writing.

pub mod elb_sync;
pub mod purge;
pub mod request;
pub mod retry;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use elb_sync::{CloudTarget, ElbSyncWorker};
pub use purge::PurgeWorker;
pub use request::{oldest_per_service, RequestWorker};
pub use retry::RetryPolicy;

/// A periodic reconciliation pass
#[async_trait]
pub trait Worker: Send + Sync {
    /// Short name used in logs and the status endpoint
    fn name(&self) -> &'static str;

    /// Time between tick starts
    fn interval(&self) -> Duration;

    /// Run one pass to completion
    async fn tick(&self) -> Result<()>;
}
