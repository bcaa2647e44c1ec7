//! Portico Core - leader-coordinated load balancer configuration orchestrator
//!
//! This crate provides:
//! - Leader election over a coordination service
//! - Request reconciliation against load balancer agents
//! - Cloud load balancer registration sync
//! - Purging of finished requests

pub mod agent;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod elb;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod store;
pub mod worker;

pub use config::PorticoConfig;
pub use error::{PorticoError, Result};
