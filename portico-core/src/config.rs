//! Process configuration
//!
//! Loaded from a TOML file, overridden from the environment, then validated.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{PorticoError, Result};

/// Which coordination backend to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    /// etcd v3 through its JSON gateway
    Etcd,
    /// In-process ensemble, single coordinator only
    Memory,
}

/// Coordination service settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub backend: CoordinationBackend,
    /// Base URLs of the coordination endpoints
    pub endpoints: Vec<String>,
    /// Key prefix all records live under
    pub namespace: String,
    pub session_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub retry_base_sleep_ms: u64,
    pub retry_max_tries: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".into()],
            namespace: "portico".into(),
            session_timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
            retry_base_sleep_ms: 100,
            retry_max_tries: 3,
        }
    }
}

impl CoordinationConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_base_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_base_sleep_ms)
    }
}

/// How a request's target agents are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetResolution {
    /// Agents captured on the request when it was created
    Snapshot,
    /// Agents currently registered in the service's groups
    Live,
}

/// Agent apply call settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Supports `{base_uri}` and `{request_id}` placeholders
    pub request_uri_format: String,
    /// Supports the `{base_uri}` placeholder
    pub batch_request_uri_format: String,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Upper bound on apply calls in flight during one tick
    pub max_concurrent_calls: usize,
    pub target_resolution: TargetResolution,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            request_uri_format: "{base_uri}/request/{request_id}".into(),
            batch_request_uri_format: "{base_uri}/batch".into(),
            request_timeout_ms: 60_000,
            max_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            max_concurrent_calls: 32,
            target_resolution: TargetResolution::Snapshot,
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Worker cadence and retention
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub request_interval_ms: u64,
    pub elb_interval_ms: u64,
    pub purge_interval_ms: u64,
    /// Delay before the first tick after becoming leader
    pub initial_delay_ms: u64,
    pub purge_retention_secs: u64,
    /// A pending request older than this many request intervals is reported as stuck
    pub stuck_request_multiplier: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: 1_000,
            elb_interval_ms: 60_000,
            purge_interval_ms: 3_600_000,
            initial_delay_ms: 0,
            purge_retention_secs: 7 * 24 * 3600,
            stuck_request_multiplier: 20,
        }
    }
}

impl WorkerConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn elb_interval(&self) -> Duration {
        Duration::from_millis(self.elb_interval_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn purge_retention(&self) -> Duration {
        Duration::from_secs(self.purge_retention_secs)
    }

    /// Age after which a pending request is considered stuck
    pub fn stuck_after(&self) -> Duration {
        self.request_interval() * self.stuck_request_multiplier.max(1)
    }
}

/// Cloud load balancer sync settings; absent means no sync worker
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ElbConfig {
    pub aws_access_key_id: Option<String>,
    pub aws_access_key_secret: Option<String>,
    pub aws_session_token: Option<String>,
    pub aws_region: Option<String>,
    /// Overrides the regional endpoint
    pub aws_endpoint: Option<String>,
    /// Wait applied before deregistering instances
    pub drain_period_ms: u64,
    /// Let a sync deregister every instance of a load balancer when no
    /// agent is left to back it
    pub allow_empty_deregistration: bool,
}

impl ElbConfig {
    pub fn drain_period(&self) -> Duration {
        Duration::from_millis(self.drain_period_ms)
    }

    pub fn region(&self) -> &str {
        self.aws_region.as_deref().unwrap_or("us-east-1")
    }
}

/// Authentication for privileged operations
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub master_auth_key: Option<String>,
}

impl AuthConfig {
    /// Whether `key` grants privileged access. With no key configured everything is allowed.
    pub fn permits(&self, key: Option<&str>) -> bool {
        match self.master_auth_key.as_deref() {
            None => true,
            Some(master) => key == Some(master),
        }
    }
}

/// HTTP surface of the coordinator process
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Advertised in the leader lock; defaults to the machine hostname
    /// joined with the bind port
    pub hostname: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            hostname: None,
        }
    }
}

impl ServerConfig {
    pub fn advertised_host(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        let machine = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".into());
        match self.bind_addr.rsplit_once(':') {
            Some((_, port)) => format!("{}:{}", machine, port),
            None => machine,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PorticoConfig {
    pub coordination: CoordinationConfig,
    pub agent: AgentConfig,
    pub worker: WorkerConfig,
    pub elb: Option<ElbConfig>,
    pub auth: AuthConfig,
    pub server: ServerConfig,
}

impl PorticoConfig {
    /// Parse a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PorticoError::InvalidConfig {
            reason: e.to_string(),
        })
    }

    /// Read a file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| PorticoError::ConfigRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `PORTICO_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoints) = lookup("PORTICO_COORDINATION_ENDPOINTS") {
            self.coordination.endpoints = endpoints
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Some(key) = lookup("PORTICO_MASTER_AUTH_KEY") {
            self.auth.master_auth_key = Some(key);
        }
        if let Some(addr) = lookup("PORTICO_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
    }

    /// Reject settings no worker can run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(PorticoError::InvalidConfig {
                reason: reason.into(),
            })
        };

        if self.coordination.backend == CoordinationBackend::Etcd
            && self.coordination.endpoints.is_empty()
        {
            return invalid("coordination.endpoints must not be empty for the etcd backend");
        }
        if self.coordination.session_timeout_ms == 0 {
            return invalid("coordination.session_timeout_ms must be positive");
        }
        if self.agent.max_attempts == 0 {
            return invalid("agent.max_attempts must be at least 1");
        }
        if self.agent.retry_base_delay_ms > self.agent.retry_max_delay_ms {
            return invalid("agent.retry_base_delay_ms exceeds agent.retry_max_delay_ms");
        }
        if self.agent.max_concurrent_calls == 0 {
            return invalid("agent.max_concurrent_calls must be at least 1");
        }
        if !self.agent.request_uri_format.contains("{base_uri}")
            || !self.agent.batch_request_uri_format.contains("{base_uri}")
        {
            return invalid("agent URI formats must contain {base_uri}");
        }
        if self.worker.request_interval_ms == 0
            || self.worker.elb_interval_ms == 0
            || self.worker.purge_interval_ms == 0
        {
            return invalid("worker intervals must be positive");
        }
        Ok(())
    }
}
