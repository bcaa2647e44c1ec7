//! Leadership and worker scheduling
//!
//! Handles the leader lock and gates worker ticks on it.

pub mod leader;
pub mod scheduler;

pub use leader::{LeaderElector, LeaderInfo, LeadershipListener, LeadershipState, LEADER_PATH};
pub use scheduler::{WorkerScheduler, WorkerStatus};
