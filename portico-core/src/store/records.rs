//! Record types shared by every coordinator
//!
//! These are serialized as camelCase JSON and must stay readable by a process
//! other than the one that wrote them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::error::{PorticoError, Result};

/// What a request asks the agents to do with a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestAction {
    Add,
    Remove,
    Reload,
}

impl RequestAction {
    /// Whether a failed apply should be undone on the agents that took it
    pub fn compensates(&self) -> bool {
        matches!(self, RequestAction::Add | RequestAction::Reload)
    }
}

impl fmt::Display for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestAction::Add => "ADD",
            RequestAction::Remove => "REMOVE",
            RequestAction::Reload => "RELOAD",
        };
        f.write_str(name)
    }
}

/// Request lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Waiting for (or in the middle of) agent apply calls
    Pending,
    /// Every target agent applied the change
    Success,
    /// At least one agent exhausted its attempts
    Failed,
    /// Cancelled externally before apply
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    /// Statuses only move forward; re-writing the same status is allowed
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        *self == next || *self == RequestStatus::Pending
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Success => "SUCCESS",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Per-agent outcome within one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentOutcome {
    Pending,
    Success,
    Failed,
}

/// Which cloud load balancer API a service's `cloud_load_balancers` belong to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerKind {
    /// Classic ELB, named by load balancer name
    #[default]
    Classic,
    /// Application load balancer, named by target group ARN
    Application,
}

impl fmt::Display for LoadBalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancerKind::Classic => "classic",
            LoadBalancerKind::Application => "application",
        };
        f.write_str(name)
    }
}

/// A routed service and its upstreams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub service_id: String,
    /// Upstream addresses, in order, without duplicates
    #[serde(default)]
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub load_balancer_groups: BTreeSet<String>,
    /// Cloud load balancers this service's groups should be registered with
    #[serde(default)]
    pub cloud_load_balancers: BTreeSet<String>,
    #[serde(default)]
    pub load_balancer_kind: LoadBalancerKind,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Service {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            upstreams: Vec::new(),
            load_balancer_groups: BTreeSet::new(),
            cloud_load_balancers: BTreeSet::new(),
            load_balancer_kind: LoadBalancerKind::Classic,
            options: BTreeMap::new(),
        }
    }

    /// Set upstreams, dropping repeats but keeping first-seen order
    pub fn with_upstreams<I, S>(mut self, upstreams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        self.upstreams = upstreams
            .into_iter()
            .map(Into::into)
            .filter(|u: &String| seen.insert(u.clone()))
            .collect();
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.load_balancer_groups.insert(group.into());
        self
    }

    pub fn with_cloud_load_balancer(mut self, name: impl Into<String>) -> Self {
        self.cloud_load_balancers.insert(name.into());
        self
    }

    /// Register with application load balancer target groups instead of classic ELBs
    pub fn with_target_group(mut self, arn: impl Into<String>) -> Self {
        self.load_balancer_kind = LoadBalancerKind::Application;
        self.cloud_load_balancers.insert(arn.into());
        self
    }
}

/// A load balancer agent as last reported by its heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub agent_id: String,
    pub base_uri: String,
    pub group: String,
    /// Cloud instance backing this agent, if any
    #[serde(default)]
    pub instance_id: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(agent_id: impl Into<String>, base_uri: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            base_uri: base_uri.into(),
            group: group.into(),
            instance_id: None,
            last_seen_at: Utc::now(),
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }
}

/// Apply attempts against one agent for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAttempt {
    pub agent_id: String,
    pub attempts: u32,
    #[serde(default)]
    pub last_http_status: Option<u16>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub outcome: AgentOutcome,
    /// Outcome of the compensating REMOVE, when one was sent
    #[serde(default)]
    pub compensation: Option<AgentOutcome>,
    pub updated_at: DateTime<Utc>,
}

impl AgentAttempt {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            attempts: 0,
            last_http_status: None,
            last_error: None,
            outcome: AgentOutcome::Pending,
            compensation: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome != AgentOutcome::Pending
    }

    pub fn record_success(&mut self, http_status: Option<u16>) {
        self.attempts += 1;
        self.last_http_status = http_status;
        self.last_error = None;
        self.outcome = AgentOutcome::Success;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt; the outcome turns FAILED once the budget is spent
    pub fn record_failure(&mut self, error: &PorticoError, max_attempts: u32) {
        self.attempts += 1;
        self.last_http_status = error.http_status();
        self.last_error = Some(error.to_string());
        if self.attempts >= max_attempts {
            self.outcome = AgentOutcome::Failed;
        }
        self.updated_at = Utc::now();
    }

    /// Attempts still allowed under `max_attempts`
    pub fn remaining(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.attempts)
    }
}

/// A unit of work: one action for one service across its agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: String,
    pub action: RequestAction,
    /// Service as it was when the request was created
    pub service: Service,
    /// Agents resolved when the request was created
    #[serde(default)]
    pub target_agents: Vec<Agent>,
    pub status: RequestStatus,
    /// Keyed by agent id
    #[serde(default)]
    pub attempts: BTreeMap<String, AgentAttempt>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// New PENDING request with a random id
    pub fn new(action: RequestAction, service: Service, target_agents: Vec<Agent>) -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4().to_string(),
            action,
            service,
            target_agents,
            status: RequestStatus::Pending,
            attempts: BTreeMap::new(),
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service.service_id
    }

    /// Move to `next`, refusing to leave a terminal status
    pub fn transition(&mut self, next: RequestStatus, message: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PorticoError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if message.is_some() {
            self.message = message;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attempt record for an agent, created on first use
    pub fn attempt_mut(&mut self, agent_id: &str) -> &mut AgentAttempt {
        self.attempts
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentAttempt::new(agent_id))
    }

    /// Keep only attempt records for `agents`
    pub fn retain_attempts(&mut self, agents: &[Agent]) {
        self.attempts
            .retain(|id, _| agents.iter().any(|a| &a.agent_id == id));
    }

    /// Terminal status implied by the per-agent outcomes, once all are terminal
    pub fn aggregate(&self, agents: &[Agent]) -> Option<RequestStatus> {
        let mut all_succeeded = true;
        for agent in agents {
            match self.attempts.get(&agent.agent_id).map(|a| a.outcome) {
                Some(AgentOutcome::Success) => {}
                Some(AgentOutcome::Failed) => all_succeeded = false,
                Some(AgentOutcome::Pending) | None => return None,
            }
        }
        Some(if all_succeeded {
            RequestStatus::Success
        } else {
            RequestStatus::Failed
        })
    }

    /// Agents whose apply succeeded
    pub fn succeeded_agents<'a>(&self, agents: &'a [Agent]) -> Vec<&'a Agent> {
        agents
            .iter()
            .filter(|a| {
                self.attempts
                    .get(&a.agent_id)
                    .map(|at| at.outcome == AgentOutcome::Success)
                    .unwrap_or(false)
            })
            .collect()
    }
}
