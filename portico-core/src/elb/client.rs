//! Classic ELB registration client
//!
//! Pure-Rust async client using reqwest with SigV4 signing. The query
//! plumbing is shared with the application load balancer client.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::collections::BTreeSet;
use tracing::{debug, info};
use url::Url;

use super::signing::{sign_form_post, Credentials};
use crate::config::ElbConfig;
use crate::error::{PorticoError, Result};

const API_VERSION: &str = "2012-06-01";
const SERVICE: &str = "elasticloadbalancing";

/// Instance registrations of named cloud load balancers.
///
/// For application load balancers the name is a target group ARN.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Instance ids currently registered with `load_balancer`
    async fn describe_instances(&self, load_balancer: &str) -> Result<BTreeSet<String>>;

    async fn register_instances(&self, load_balancer: &str, instances: &[String]) -> Result<()>;

    async fn deregister_instances(&self, load_balancer: &str, instances: &[String]) -> Result<()>;
}

/// Values of every `<tag>...</tag>` element in an XML body
pub(crate) fn extract_tags(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    for part in body.split(open.as_str()).skip(1) {
        if let Some(end) = part.find(close.as_str()) {
            values.push(part[..end].trim().to_string());
        }
    }
    values
}

/// Signed form-POST access to one version of the load balancing query API
pub(crate) struct QueryClient {
    http: Client,
    endpoint: Url,
    region: String,
    credentials: Credentials,
    version: &'static str,
}

impl QueryClient {
    pub(crate) fn new(config: &ElbConfig, credentials: Credentials, version: &'static str) -> Result<Self> {
        let region = config.region().to_string();
        let raw = config
            .aws_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.{}.amazonaws.com", SERVICE, region));
        let endpoint = Url::parse(&raw).map_err(|e| PorticoError::InvalidConfig {
            reason: format!("Invalid cloud endpoint {}: {}", raw, e),
        })?;
        if endpoint.host_str().is_none() {
            return Err(PorticoError::InvalidConfig {
                reason: format!("Cloud endpoint {} has no host", raw),
            });
        }

        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PorticoError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        info!("Cloud load balancer client ({}) for {} at {}", version, region, endpoint);
        Ok(Self {
            http,
            endpoint,
            region,
            credentials,
            version,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// POST `action` against the resource named by `target` (`(param, value)`)
    pub(crate) async fn call(
        &self,
        action: &str,
        target: (&str, &str),
        params: &[(String, String)],
    ) -> Result<String> {
        let (target_param, target_name) = target;
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("Action", action)
                .append_pair("Version", self.version)
                .append_pair(target_param, target_name);
            for (key, value) in params {
                form.append_pair(key, value);
            }
            form.finish()
        };

        let headers = sign_form_post(
            &self.credentials,
            &self.region,
            SERVICE,
            &self.host(),
            &body,
            Utc::now(),
        )?;

        let api_error = |message: String| PorticoError::LoadBalancerApi {
            action: action.into(),
            load_balancer: target_name.into(),
            message,
        };

        let mut request = self.http.post(self.endpoint.clone()).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| PorticoError::LoadBalancerUnreachable {
                action: action.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PorticoError::LoadBalancerUnreachable {
                action: action.into(),
                reason: format!("failed to read response: {}", e),
            })?;

        if status.is_success() {
            debug!("{} on {} succeeded", action, target_name);
            return Ok(text);
        }

        let code = extract_tags(&text, "Code").into_iter().next().unwrap_or_default();
        if code == "Throttling" || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PorticoError::Throttled {
                action: action.into(),
            });
        }
        if status.is_server_error() {
            return Err(PorticoError::LoadBalancerUnavailable {
                action: action.into(),
                status: status.as_u16(),
            });
        }
        let message = extract_tags(&text, "Message")
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("HTTP {}", status));
        Err(api_error(format!("{} {}", code, message).trim().to_string()))
    }
}

/// Classic ELB API client, keyed by load balancer name
pub struct ElbClient {
    query: QueryClient,
}

impl ElbClient {
    /// Build a client; fails when no credentials can be found
    pub fn new(config: &ElbConfig) -> Result<Self> {
        let credentials = Credentials::resolve(config)?;
        Self::with_credentials(config, credentials)
    }

    pub fn with_credentials(config: &ElbConfig, credentials: Credentials) -> Result<Self> {
        Ok(Self {
            query: QueryClient::new(config, credentials, API_VERSION)?,
        })
    }

    async fn call(&self, action: &str, load_balancer: &str, params: &[(String, String)]) -> Result<String> {
        self.query
            .call(action, ("LoadBalancerName", load_balancer), params)
            .await
    }

    fn instance_params(instances: &[String]) -> Vec<(String, String)> {
        instances
            .iter()
            .enumerate()
            .map(|(i, id)| (format!("Instances.member.{}.InstanceId", i + 1), id.clone()))
            .collect()
    }
}

#[async_trait]
impl LoadBalancerApi for ElbClient {
    async fn describe_instances(&self, load_balancer: &str) -> Result<BTreeSet<String>> {
        let body = self.call("DescribeInstanceHealth", load_balancer, &[]).await?;
        Ok(extract_tags(&body, "InstanceId").into_iter().collect())
    }

    async fn register_instances(&self, load_balancer: &str, instances: &[String]) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        self.call(
            "RegisterInstancesWithLoadBalancer",
            load_balancer,
            &Self::instance_params(instances),
        )
        .await?;
        Ok(())
    }

    async fn deregister_instances(&self, load_balancer: &str, instances: &[String]) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        self.call(
            "DeregisterInstancesFromLoadBalancer",
            load_balancer,
            &Self::instance_params(instances),
        )
        .await?;
        Ok(())
    }
}
