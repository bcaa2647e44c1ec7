//! Application load balancer (ELBv2) registration client
//!
//! Registrations live on target groups, so every call is keyed by the target
//! group ARN. Targets are registered by instance id on the group's own port.

use async_trait::async_trait;
use std::collections::BTreeSet;

use super::client::{extract_tags, LoadBalancerApi, QueryClient};
use super::signing::Credentials;
use crate::config::ElbConfig;
use crate::error::Result;

const API_VERSION: &str = "2015-12-01";
const TARGET_GROUP_PARAM: &str = "TargetGroupArn";

/// ELBv2 API client
pub struct AlbClient {
    query: QueryClient,
}

impl AlbClient {
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

    fn target_params(instances: &[String]) -> Vec<(String, String)> {
        instances
            .iter()
            .enumerate()
            .map(|(i, id)| (format!("Targets.member.{}.Id", i + 1), id.clone()))
            .collect()
    }
}

#[async_trait]
impl LoadBalancerApi for AlbClient {
    async fn describe_instances(&self, target_group: &str) -> Result<BTreeSet<String>> {
        let body = self
            .query
            .call("DescribeTargetHealth", (TARGET_GROUP_PARAM, target_group), &[])
            .await?;
        Ok(extract_tags(&body, "Id").into_iter().collect())
    }

    async fn register_instances(&self, target_group: &str, instances: &[String]) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        self.query
            .call(
                "RegisterTargets",
                (TARGET_GROUP_PARAM, target_group),
                &Self::target_params(instances),
            )
            .await?;
        Ok(())
    }

    async fn deregister_instances(&self, target_group: &str, instances: &[String]) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        self.query
            .call(
                "DeregisterTargets",
                (TARGET_GROUP_PARAM, target_group),
                &Self::target_params(instances),
            )
            .await?;
        Ok(())
    }
}
