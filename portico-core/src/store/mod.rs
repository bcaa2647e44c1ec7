//! Persisted records and their access pattern
//!
//! Requests, services and agents live in the coordination service as JSON
//! documents so any coordinator can pick up where another left off.

pub mod records;
pub mod request_store;

pub use records::{
    Agent, AgentAttempt, AgentOutcome, LoadBalancerKind, Request, RequestAction, RequestStatus,
    Service,
};
pub use request_store::RequestStore;
