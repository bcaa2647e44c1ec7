//! Load balancer agent access
//!
//! Agents receive the full desired state of a service on every call, so any
//! apply can be repeated safely.

pub mod client;

pub use client::{AgentApi, ApplyPayload, HttpAgentClient};
