//! Error types for Portico
//!
//! Error taxonomy covering the coordination service, the record store,
//! agent apply calls, the cloud load balancer API and configuration.

use thiserror::Error;

/// Primary error type for all Portico operations
#[derive(Debug, Error)]
pub enum PorticoError {
    // ========== Coordination Errors ==========

    /// Coordination service could not be reached or rejected the call
    #[error("Coordination service unavailable: {message}")]
    CoordinationUnavailable { message: String },

    /// The session backing this process has expired
    #[error("Coordination session {session} expired")]
    SessionExpired { session: u64 },

    /// Coordination service returned something we could not interpret
    #[error("Unexpected coordination response: {reason}")]
    CoordinationProtocol { reason: String },

    // ========== Store Errors ==========

    /// A persisted record could not be decoded
    #[error("Corrupt record at {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    /// Record does not exist
    #[error("Record not found: {path}")]
    RecordNotFound { path: String },

    /// Request status would move backwards
    #[error("Invalid status transition for request {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: String,
        to: String,
    },

    // ========== Leadership ==========

    /// Leadership was lost while a tick was running
    #[error("Leadership lost during {operation}")]
    LeadershipLost { operation: String },

    // ========== Agent Errors ==========

    /// Agent answered with a non-2xx status
    #[error("Agent {agent_id} rejected apply with HTTP {status}")]
    AgentRejected { agent_id: String, status: u16 },

    /// Agent could not be reached
    #[error("Agent {agent_id} unreachable: {reason}")]
    AgentUnreachable { agent_id: String, reason: String },

    /// Agent did not answer within the request timeout
    #[error("Agent {agent_id} timed out after {timeout_ms}ms")]
    AgentTimeout { agent_id: String, timeout_ms: u64 },

    // ========== Cloud Load Balancer Errors ==========

    /// Cloud load balancer API call failed
    #[error("Load balancer API {action} on {load_balancer} failed: {message}")]
    LoadBalancerApi {
        action: String,
        load_balancer: String,
        message: String,
    },

    /// Cloud load balancer API asked us to slow down
    #[error("Load balancer API throttled {action}")]
    Throttled { action: String },

    /// Cloud load balancer API answered with a server error
    #[error("Load balancer API {action} unavailable: HTTP {status}")]
    LoadBalancerUnavailable { action: String, status: u16 },

    /// Cloud load balancer API could not be reached
    #[error("Load balancer API {action} unreachable: {reason}")]
    LoadBalancerUnreachable { action: String, reason: String },

    /// No credentials available for the cloud load balancer API
    #[error("No cloud credentials configured and none found in the environment")]
    MissingCredentials,

    // ========== Configuration ==========

    /// Configuration is invalid
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Configuration file could not be read
    #[error("Failed to read configuration {path}: {reason}")]
    ConfigRead { path: String, reason: String },

    // ========== Runtime Errors ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PorticoError {
    /// Returns true if the failure is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PorticoError::CoordinationUnavailable { .. }
                | PorticoError::AgentRejected { .. }
                | PorticoError::AgentUnreachable { .. }
                | PorticoError::AgentTimeout { .. }
                | PorticoError::Throttled { .. }
                | PorticoError::LoadBalancerUnavailable { .. }
                | PorticoError::LoadBalancerUnreachable { .. }
        )
    }

    /// Returns true if the error should stop the process at startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PorticoError::MissingCredentials
                | PorticoError::InvalidConfig { .. }
                | PorticoError::ConfigRead { .. }
        )
    }

    /// HTTP status carried by an agent failure, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            PorticoError::AgentRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn corrupt(path: &str, err: impl std::fmt::Display) -> Self {
        PorticoError::CorruptRecord {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn unavailable(err: impl std::fmt::Display) -> Self {
        PorticoError::CoordinationUnavailable {
            message: err.to_string(),
        }
    }
}

/// Result type alias for Portico operations
pub type Result<T> = std::result::Result<T, PorticoError>;
