//! HTTP client for agent apply calls

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{PorticoError, Result};
use crate::store::{Agent, Request, RequestAction};

/// Body of an apply call: the whole desired state of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPayload {
    pub request_id: String,
    pub action: RequestAction,
    pub service_id: String,
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl ApplyPayload {
    /// Payload for `request`, optionally overriding its action (compensation)
    pub fn for_request(request: &Request, action: RequestAction) -> Self {
        Self {
            request_id: request.request_id.clone(),
            action,
            service_id: request.service.service_id.clone(),
            upstreams: request.service.upstreams.clone(),
            options: request.service.options.clone(),
        }
    }
}

/// Apply endpoint of a load balancer agent
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Apply one service change; returns the HTTP status on success
    async fn apply(&self, agent: &Agent, payload: &ApplyPayload) -> Result<u16>;

    /// Apply several service changes in one call.
    ///
    /// Exposed for callers holding more than one change per agent. The
    /// request worker applies one request at a time and never batches.
    async fn apply_batch(&self, agent: &Agent, payloads: &[ApplyPayload]) -> Result<u16>;
}

/// Agent client using reqwest
pub struct HttpAgentClient {
    http: Client,
    request_uri_format: String,
    batch_request_uri_format: String,
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| PorticoError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            request_uri_format: config.request_uri_format.clone(),
            batch_request_uri_format: config.batch_request_uri_format.clone(),
            timeout: config.request_timeout(),
        })
    }

    fn request_url(&self, agent: &Agent, request_id: &str) -> String {
        self.request_uri_format
            .replace("{base_uri}", agent.base_uri.trim_end_matches('/'))
            .replace("{request_id}", request_id)
    }

    fn batch_url(&self, agent: &Agent) -> String {
        self.batch_request_uri_format
            .replace("{base_uri}", agent.base_uri.trim_end_matches('/'))
    }

    async fn post<T: Serialize + ?Sized>(&self, agent: &Agent, url: &str, body: &T) -> Result<u16> {
        let resp = self.http.post(url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                PorticoError::AgentTimeout {
                    agent_id: agent.agent_id.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                PorticoError::AgentUnreachable {
                    agent_id: agent.agent_id.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        debug!("Agent {} answered {} for {}", agent.agent_id, status, url);
        if !status.is_success() {
            return Err(PorticoError::AgentRejected {
                agent_id: agent.agent_id.clone(),
                status: status.as_u16(),
            });
        }
        Ok(status.as_u16())
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn apply(&self, agent: &Agent, payload: &ApplyPayload) -> Result<u16> {
        let url = self.request_url(agent, &payload.request_id);
        self.post(agent, &url, payload).await
    }

    async fn apply_batch(&self, agent: &Agent, payloads: &[ApplyPayload]) -> Result<u16> {
        let url = self.batch_url(agent);
        self.post(agent, &url, payloads).await
    }
}
