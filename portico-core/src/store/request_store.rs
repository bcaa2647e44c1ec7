//! Request, service and agent records in the coordination service
//!
//! Layout:
//! - `/requests/{request_id}`
//! - `/services/{service_id}`
//! - `/agents/{group}/{agent_id}`

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::records::{Agent, Request, RequestAction, RequestStatus, Service};
use crate::coordination::client::join;
use crate::coordination::CoordinationClient;
use crate::error::{PorticoError, Result};

const REQUESTS_PATH: &str = "/requests";
const SERVICES_PATH: &str = "/services";
const AGENTS_PATH: &str = "/agents";

/// Typed access to persisted records
#[derive(Clone)]
pub struct RequestStore {
    client: Arc<dyn CoordinationClient>,
}

impl RequestStore {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.client.get(path).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PorticoError::corrupt(path, e)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, path: &str, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record).map_err(|e| PorticoError::Internal {
            message: format!("Failed to encode {}: {}", path, e),
        })?;
        self.client.put(path, bytes).await
    }

    /// Read every child of `parent`.
    ///
    /// Nodes deleted between listing and reading are skipped, as are records
    /// that fail to decode so one bad document cannot wedge every tick.
    async fn read_all<T: DeserializeOwned>(&self, parent: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for name in self.client.children(parent).await? {
            match self.read(&join(parent, &name)).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e @ PorticoError::CorruptRecord { .. }) => warn!("Skipping record: {}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    // ========== Requests ==========

    /// All requests, oldest first
    pub async fn list_requests(&self) -> Result<Vec<Request>> {
        let mut requests: Vec<Request> = self.read_all(REQUESTS_PATH).await?;
        requests.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(requests)
    }

    /// Pending requests, oldest first
    pub async fn list_pending(&self) -> Result<Vec<Request>> {
        let mut requests = self.list_requests().await?;
        requests.retain(|r| r.status == RequestStatus::Pending);
        Ok(requests)
    }

    pub async fn get_request(&self, request_id: &str) -> Result<Option<Request>> {
        self.read(&join(REQUESTS_PATH, request_id)).await
    }

    /// Persist a request, refusing to overwrite a terminal status with a different one
    pub async fn save_request(&self, request: &Request) -> Result<()> {
        let path = join(REQUESTS_PATH, &request.request_id);
        if let Some(stored) = self.read::<Request>(&path).await? {
            if !stored.status.can_transition_to(request.status) {
                return Err(PorticoError::InvalidTransition {
                    request_id: request.request_id.clone(),
                    from: stored.status.to_string(),
                    to: request.status.to_string(),
                });
            }
        }
        debug!("Saving request {} ({})", request.request_id, request.status);
        self.write(&path, request).await
    }

    /// Create a PENDING request against the service's current agents
    pub async fn create_request(&self, action: RequestAction, service: Service) -> Result<Request> {
        let agents = self.agents_for_service(&service).await?;
        let request = Request::new(action, service, agents);
        self.write(&join(REQUESTS_PATH, &request.request_id), &request).await?;
        debug!(
            "Created {} request {} for service {}",
            request.action,
            request.request_id,
            request.service_id()
        );
        Ok(request)
    }

    /// Cancel a request that has not reached a terminal status
    pub async fn cancel_request(&self, request_id: &str) -> Result<Request> {
        let path = join(REQUESTS_PATH, request_id);
        let mut request: Request = self
            .read(&path)
            .await?
            .ok_or(PorticoError::RecordNotFound { path: path.clone() })?;
        request.transition(RequestStatus::Cancelled, Some("Cancelled".into()))?;
        self.write(&path, &request).await?;
        Ok(request)
    }

    pub async fn delete_request(&self, request_id: &str) -> Result<()> {
        self.client.delete(&join(REQUESTS_PATH, request_id)).await
    }

    // ========== Services ==========

    pub async fn list_services(&self) -> Result<Vec<Service>> {
        self.read_all(SERVICES_PATH).await
    }

    pub async fn get_service(&self, service_id: &str) -> Result<Option<Service>> {
        self.read(&join(SERVICES_PATH, service_id)).await
    }

    pub async fn save_service(&self, service: &Service) -> Result<()> {
        self.write(&join(SERVICES_PATH, &service.service_id), service).await
    }

    // ========== Agents ==========

    pub async fn list_groups(&self) -> Result<Vec<String>> {
        self.client.children(AGENTS_PATH).await
    }

    pub async fn list_agents(&self, group: &str) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.read_all(&join(AGENTS_PATH, group)).await?;
        for agent in agents.iter().filter(|a| a.group != group) {
            warn!("Agent {} stored under group {} claims group {}", agent.agent_id, group, agent.group);
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    /// Agents in any of the service's load balancer groups
    pub async fn agents_for_service(&self, service: &Service) -> Result<Vec<Agent>> {
        let mut agents = Vec::new();
        for group in &service.load_balancer_groups {
            agents.extend(self.list_agents(group).await?);
        }
        Ok(agents)
    }

    /// Record an agent heartbeat
    pub async fn save_agent(&self, agent: &Agent) -> Result<()> {
        let path = join(&join(AGENTS_PATH, &agent.group), &agent.agent_id);
        self.write(&path, agent).await
    }

    pub async fn remove_agent(&self, group: &str, agent_id: &str) -> Result<()> {
        self.client
            .delete(&join(&join(AGENTS_PATH, group), agent_id))
            .await
    }
}
