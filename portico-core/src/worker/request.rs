//! Request reconciliation
//!
//! Each tick picks the oldest PENDING request of every service, sends its
//! full desired state to every target agent, and records per-agent attempts
//! after every call so the next leader can resume from persisted state.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::{RetryPolicy, Worker};
use crate::agent::{AgentApi, ApplyPayload};
use crate::config::{AgentConfig, TargetResolution, WorkerConfig};
use crate::coordinator::LeaderElector;
use crate::error::{PorticoError, Result};
use crate::metrics::standard;
use crate::store::{Agent, AgentOutcome, Request, RequestAction, RequestStatus, RequestStore};

/// The oldest request of each service, oldest first.
///
/// Later requests for a service wait until the earlier one is terminal.
pub fn oldest_per_service(mut pending: Vec<Request>) -> Vec<Request> {
    pending.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.request_id.cmp(&b.request_id))
    });
    let mut seen = HashSet::new();
    pending
        .into_iter()
        .filter(|r| seen.insert(r.service_id().to_string()))
        .collect()
}

/// Applies pending requests to agents
pub struct RequestWorker {
    store: RequestStore,
    agents: Arc<dyn AgentApi>,
    leader: Arc<LeaderElector>,
    retry: RetryPolicy,
    call_timeout: Duration,
    target_resolution: TargetResolution,
    interval: Duration,
    stuck_after: Duration,
    fan_out: Arc<Semaphore>,
}

impl RequestWorker {
    pub fn new(
        store: RequestStore,
        agents: Arc<dyn AgentApi>,
        leader: Arc<LeaderElector>,
        agent_config: &AgentConfig,
        worker_config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            agents,
            leader,
            retry: RetryPolicy::from_agent_config(agent_config),
            call_timeout: agent_config.request_timeout(),
            target_resolution: agent_config.target_resolution,
            interval: worker_config.request_interval(),
            stuck_after: worker_config.stuck_after(),
            fan_out: Arc::new(Semaphore::new(agent_config.max_concurrent_calls.max(1))),
        }
    }

    /// Process one request from persisted state.
    ///
    /// Returns the status it was left in, or `None` if it no longer exists.
    pub async fn process(&self, request_id: &str) -> Result<Option<RequestStatus>> {
        let mut request = match self.store.get_request(request_id).await? {
            Some(request) => request,
            None => return Ok(None),
        };
        if request.status.is_terminal() {
            if request.status == RequestStatus::Cancelled {
                info!("Request {} was cancelled, skipping apply", request_id);
            }
            return Ok(Some(request.status));
        }

        let targets = self.resolve_targets(&mut request).await?;
        if targets.is_empty() {
            request.transition(RequestStatus::Success, Some("No target agents".into()))?;
            self.persist(&request).await?;
            standard::REQUESTS_SUCCEEDED.inc();
            info!("Request {} has no target agents, marked SUCCESS", request_id);
            return Ok(Some(RequestStatus::Success));
        }

        let payload = ApplyPayload::for_request(&request, request.action);
        let shared = Mutex::new(request);

        let results = join_all(
            targets
                .iter()
                .map(|agent| self.apply_to_agent(&shared, agent, &payload)),
        )
        .await;
        if let Some(e) = results.into_iter().find_map(|r| r.err()) {
            return Err(e);
        }

        let mut request = shared.into_inner();
        let status = match request.aggregate(&targets) {
            Some(status) => status,
            None => return Ok(Some(RequestStatus::Pending)),
        };

        let message = match status {
            RequestStatus::Failed => {
                let failed: Vec<&str> = request
                    .attempts
                    .values()
                    .filter(|a| a.outcome == AgentOutcome::Failed)
                    .map(|a| a.agent_id.as_str())
                    .collect();
                format!("Apply failed on {}", failed.join(", "))
            }
            _ => format!("Applied to {} agents", targets.len()),
        };

        if status == RequestStatus::Failed && request.action.compensates() {
            self.compensate(&mut request, &targets).await?;
        }

        request.transition(status, Some(message))?;
        self.persist(&request).await?;

        match status {
            RequestStatus::Success => standard::REQUESTS_SUCCEEDED.inc(),
            RequestStatus::Failed => standard::REQUESTS_FAILED.inc(),
            _ => {}
        }
        info!(
            "{} request {} for {} finished {}",
            request.action,
            request.request_id,
            request.service_id(),
            status
        );
        Ok(Some(status))
    }

    async fn resolve_targets(&self, request: &mut Request) -> Result<Vec<Agent>> {
        match self.target_resolution {
            TargetResolution::Snapshot => Ok(request.target_agents.clone()),
            TargetResolution::Live => {
                let agents = self.store.agents_for_service(&request.service).await?;
                request.retain_attempts(&agents);
                request.target_agents = agents.clone();
                Ok(agents)
            }
        }
    }

    async fn persist(&self, request: &Request) -> Result<()> {
        self.leader.ensure_leader("persist request")?;
        self.store.save_request(request).await
    }

    async fn call_agent(&self, agent: &Agent, payload: &ApplyPayload) -> Result<u16> {
        let _permit = self.fan_out.acquire().await.map_err(|e| PorticoError::Internal {
            message: format!("Fan-out limiter closed: {}", e),
        })?;

        standard::AGENT_APPLY_ATTEMPTS.inc();
        let started = Instant::now();
        let result = match tokio::time::timeout(self.call_timeout, self.agents.apply(agent, payload)).await {
            Ok(result) => result,
            Err(_) => Err(PorticoError::AgentTimeout {
                agent_id: agent.agent_id.clone(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        };
        standard::AGENT_APPLY_DURATION.observe_duration(started.elapsed());
        result
    }

    /// Retry one agent until it succeeds or its attempt budget is spent.
    ///
    /// Attempt counts already persisted by an earlier leader count against the budget.
    async fn apply_to_agent(&self, shared: &Mutex<Request>, agent: &Agent, payload: &ApplyPayload) -> Result<()> {
        let max_attempts = self.retry.max_attempts;

        loop {
            {
                let mut request = shared.lock().await;
                let attempt = request.attempt_mut(&agent.agent_id);
                if attempt.is_terminal() {
                    return Ok(());
                }
                if attempt.remaining(max_attempts) == 0 {
                    attempt.outcome = AgentOutcome::Failed;
                    attempt.updated_at = Utc::now();
                    self.persist(&request).await?;
                    return Ok(());
                }
            }

            self.leader.ensure_leader("apply to agent")?;
            let result = self.call_agent(agent, payload).await;

            let mut request = shared.lock().await;
            let attempt = request.attempt_mut(&agent.agent_id);
            let attempts = match &result {
                Ok(status) => {
                    attempt.record_success(Some(*status));
                    debug!("Agent {} applied {}", agent.agent_id, payload.request_id);
                    attempt.attempts
                }
                Err(e) => {
                    attempt.record_failure(e, max_attempts);
                    warn!(
                        "Apply of {} to agent {} failed (attempt {}/{}): {}",
                        payload.request_id, agent.agent_id, attempt.attempts, max_attempts, e
                    );
                    attempt.attempts
                }
            };
            let done = request.attempts[&agent.agent_id].is_terminal();
            self.persist(&request).await?;
            drop(request);

            if done {
                return Ok(());
            }
            tokio::time::sleep(self.retry.delay_for(attempts)).await;
        }
    }

    /// Send a REMOVE to every agent that took a change the request as a whole failed
    async fn compensate(&self, request: &mut Request, targets: &[Agent]) -> Result<()> {
        let succeeded: Vec<Agent> = request
            .succeeded_agents(targets)
            .into_iter()
            .filter(|a| request.attempts[&a.agent_id].compensation != Some(AgentOutcome::Success))
            .cloned()
            .collect();
        if succeeded.is_empty() {
            return Ok(());
        }

        self.leader.ensure_leader("compensate request")?;
        let payload = ApplyPayload::for_request(request, RequestAction::Remove);
        let label = format!("Compensating REMOVE for {}", request.request_id);

        let outcomes = join_all(succeeded.iter().map(|agent| {
            let payload = &payload;
            let label = &label;
            async move {
                standard::COMPENSATIONS.inc();
                let result = self
                    .retry
                    .run(label, |_| self.call_agent(agent, payload))
                    .await;
                (agent, result)
            }
        }))
        .await;

        for (agent, result) in outcomes {
            let outcome = match result {
                Ok(_) => {
                    info!("Compensated {} on agent {}", request.request_id, agent.agent_id);
                    AgentOutcome::Success
                }
                Err(e) => {
                    warn!(
                        "Compensating REMOVE of {} on agent {} failed: {}",
                        request.request_id, agent.agent_id, e
                    );
                    AgentOutcome::Failed
                }
            };
            let attempt = request.attempt_mut(&agent.agent_id);
            attempt.compensation = Some(outcome);
            attempt.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Report PENDING requests that have waited too long
    fn report_stuck(&self, pending: &[Request]) {
        let threshold = match chrono::Duration::from_std(self.stuck_after) {
            Ok(threshold) => threshold,
            Err(_) => return,
        };
        let now = Utc::now();
        let stuck: Vec<&Request> = pending
            .iter()
            .filter(|r| now - r.created_at > threshold)
            .collect();

        standard::STUCK_REQUESTS.set(stuck.len() as i64);
        for request in stuck {
            warn!(
                "{} request {} for {} has been PENDING since {}",
                request.action,
                request.request_id,
                request.service_id(),
                request.created_at
            );
        }
    }
}

#[async_trait]
impl Worker for RequestWorker {
    fn name(&self) -> &'static str {
        "request"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> Result<()> {
        self.leader.ensure_leader("request tick")?;

        let pending = self.store.list_pending().await?;
        self.report_stuck(&pending);
        if pending.is_empty() {
            return Ok(());
        }

        let selected = oldest_per_service(pending);
        debug!("Processing {} pending requests", selected.len());

        let results = join_all(selected.iter().map(|r| self.process(&r.request_id))).await;

        let mut first_error = None;
        for (request, result) in selected.iter().zip(results) {
            if let Err(e) = result {
                if !matches!(e, PorticoError::LeadershipLost { .. }) {
                    warn!("Request {} not completed this tick: {}", request.request_id, e);
                }
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Service;
    use chrono::Duration as ChronoDuration;

    fn request(service: &str, age_secs: i64) -> Request {
        let mut request = Request::new(RequestAction::Add, Service::new(service), vec![]);
        request.created_at = Utc::now() - ChronoDuration::seconds(age_secs);
        request
    }

    #[test]
    fn test_oldest_per_service() {
        let newer = request("s1", 10);
        let older = request("s1", 20);
        let other = request("s2", 5);

        let selected = oldest_per_service(vec![newer, other.clone(), older.clone()]);

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].request_id, older.request_id);
        assert_eq!(selected[1].request_id, other.request_id);
    }
}
