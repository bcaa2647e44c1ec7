//! Cloud load balancer registration sync
//!
//! Desired registrations come from service definitions: every cloud load
//! balancer named by a service should contain the instances of the agents in
//! that service's groups. Each tick diffs desired against what the cloud API
//! reports and applies the difference, registrations first.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{RetryPolicy, Worker};
use crate::coordinator::LeaderElector;
use crate::elb::LoadBalancerApi;
use crate::error::{PorticoError, Result};
use crate::metrics::standard;
use crate::store::{LoadBalancerKind, RequestStore, Service};

/// Registration changes for one cloud load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationDiff {
    pub to_register: Vec<String>,
    pub to_deregister: Vec<String>,
}

impl RegistrationDiff {
    pub fn between(desired: &BTreeSet<String>, actual: &BTreeSet<String>) -> Self {
        Self {
            to_register: desired.difference(actual).cloned().collect(),
            to_deregister: actual.difference(desired).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_register.is_empty() && self.to_deregister.is_empty()
    }
}

/// A cloud load balancer (or target group) and the API that manages it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CloudTarget {
    pub kind: LoadBalancerKind,
    pub name: String,
}

impl CloudTarget {
    pub fn classic(name: impl Into<String>) -> Self {
        Self {
            kind: LoadBalancerKind::Classic,
            name: name.into(),
        }
    }

    pub fn target_group(arn: impl Into<String>) -> Self {
        Self {
            kind: LoadBalancerKind::Application,
            name: arn.into(),
        }
    }

    fn actions(&self) -> [&'static str; 3] {
        match self.kind {
            LoadBalancerKind::Classic => [
                "DescribeInstanceHealth",
                "RegisterInstancesWithLoadBalancer",
                "DeregisterInstancesFromLoadBalancer",
            ],
            LoadBalancerKind::Application => ["DescribeTargetHealth", "RegisterTargets", "DeregisterTargets"],
        }
    }
}

impl fmt::Display for CloudTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// Agent groups feeding each cloud load balancer
pub fn groups_by_load_balancer(services: &[Service]) -> BTreeMap<CloudTarget, BTreeSet<String>> {
    let mut groups: BTreeMap<CloudTarget, BTreeSet<String>> = BTreeMap::new();
    for service in services {
        for load_balancer in &service.cloud_load_balancers {
            let target = CloudTarget {
                kind: service.load_balancer_kind,
                name: load_balancer.clone(),
            };
            groups
                .entry(target)
                .or_default()
                .extend(service.load_balancer_groups.iter().cloned());
        }
    }
    groups
}

/// Reconciles cloud load balancer registrations with agent membership
pub struct ElbSyncWorker {
    store: RequestStore,
    apis: BTreeMap<LoadBalancerKind, Arc<dyn LoadBalancerApi>>,
    leader: Arc<LeaderElector>,
    retry: RetryPolicy,
    drain_period: Duration,
    allow_empty_deregistration: bool,
    interval: Duration,
}

impl ElbSyncWorker {
    /// Worker syncing classic ELBs through `api`
    pub fn new(
        store: RequestStore,
        api: Arc<dyn LoadBalancerApi>,
        leader: Arc<LeaderElector>,
        retry: RetryPolicy,
        drain_period: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            apis: BTreeMap::from([(LoadBalancerKind::Classic, api)]),
            leader,
            retry,
            drain_period,
            allow_empty_deregistration: false,
            interval,
        }
    }

    /// Use `api` for load balancers of `kind`
    pub fn with_api(mut self, kind: LoadBalancerKind, api: Arc<dyn LoadBalancerApi>) -> Self {
        self.apis.insert(kind, api);
        self
    }

    /// Allow a sync to deregister every instance of a load balancer
    pub fn allow_empty_deregistration(mut self, allow: bool) -> Self {
        self.allow_empty_deregistration = allow;
        self
    }

    /// Desired instance ids per cloud load balancer, read fresh from the store
    pub async fn desired_state(&self) -> Result<BTreeMap<CloudTarget, BTreeSet<String>>> {
        let services = self.store.list_services().await?;
        let groups = groups_by_load_balancer(&services);

        let mut instances_by_group: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for group in groups.values().flatten() {
            if instances_by_group.contains_key(group) {
                continue;
            }
            let instances = self
                .store
                .list_agents(group)
                .await?
                .into_iter()
                .filter_map(|agent| agent.instance_id)
                .collect();
            instances_by_group.insert(group.clone(), instances);
        }

        Ok(groups
            .into_iter()
            .map(|(target, groups)| {
                let desired = groups
                    .iter()
                    .filter_map(|g| instances_by_group.get(g))
                    .flatten()
                    .cloned()
                    .collect();
                (target, desired)
            })
            .collect())
    }

    /// Bring one load balancer in line with `desired`.
    ///
    /// An empty `desired` never empties a load balancer unless
    /// `allow_empty_deregistration` is set; registered instances are kept.
    pub async fn reconcile(&self, target: &CloudTarget, desired: &BTreeSet<String>) -> Result<RegistrationDiff> {
        let api = self.apis.get(&target.kind).ok_or_else(|| PorticoError::InvalidConfig {
            reason: format!("no {} load balancer client configured for {}", target.kind, target.name),
        })?;
        let [describe, register, deregister] = target.actions();
        let name = target.name.as_str();

        let actual = self
            .retry
            .run(describe, |_| api.describe_instances(name))
            .await?;

        let mut diff = RegistrationDiff::between(desired, &actual);
        if desired.is_empty() && !actual.is_empty() && !self.allow_empty_deregistration {
            warn!(
                "Refusing to deregister every instance from {} ({} registered, none desired)",
                target,
                actual.len()
            );
            diff.to_deregister.clear();
        }
        if diff.is_empty() {
            debug!("{} already in sync ({} instances)", target, actual.len());
            return Ok(diff);
        }

        if !diff.to_register.is_empty() {
            self.leader.ensure_leader("register instances")?;
            self.retry
                .run(register, |_| api.register_instances(name, &diff.to_register))
                .await?;
            standard::ELB_REGISTRATIONS.inc_by(diff.to_register.len() as u64);
            info!("Registered {:?} with {}", diff.to_register, target);
        }

        if !diff.to_deregister.is_empty() {
            if !self.drain_period.is_zero() {
                debug!(
                    "Draining {:?} from {} for {:?}",
                    diff.to_deregister, target, self.drain_period
                );
                tokio::time::sleep(self.drain_period).await;
            }
            self.leader.ensure_leader("deregister instances")?;
            self.retry
                .run(deregister, |_| api.deregister_instances(name, &diff.to_deregister))
                .await?;
            standard::ELB_DEREGISTRATIONS.inc_by(diff.to_deregister.len() as u64);
            info!("Deregistered {:?} from {}", diff.to_deregister, target);
        }

        Ok(diff)
    }
}

#[async_trait]
impl Worker for ElbSyncWorker {
    fn name(&self) -> &'static str {
        "elb-sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> Result<()> {
        self.leader.ensure_leader("elb sync")?;
        let desired = self.desired_state().await?;

        let results = join_all(
            desired
                .iter()
                .map(|(target, instances)| self.reconcile(target, instances)),
        )
        .await;

        let mut first_error = None;
        for ((target, _), result) in desired.iter().zip(results) {
            if let Err(e) = result {
                error!("Sync of {} failed: {}", target, e);
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

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_between() {
        let diff = RegistrationDiff::between(&set(&["i1", "i2"]), &set(&["i1", "i3"]));
        assert_eq!(diff.to_register, vec!["i2"]);
        assert_eq!(diff.to_deregister, vec!["i3"]);
        assert!(RegistrationDiff::between(&set(&["i1"]), &set(&["i1"])).is_empty());
    }

    #[test]
    fn test_groups_merge_across_services() {
        let services = vec![
            Service::new("a").in_group("edge").with_cloud_load_balancer("public"),
            Service::new("b").in_group("core").with_cloud_load_balancer("public"),
            Service::new("c").in_group("edge"),
        ];
        let groups = groups_by_load_balancer(&services);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&CloudTarget::classic("public")], set(&["core", "edge"]));
    }

    #[test]
    fn test_same_name_under_different_kinds_stays_apart() {
        let services = vec![
            Service::new("a").in_group("edge").with_cloud_load_balancer("web"),
            Service::new("b").in_group("core").with_target_group("web"),
        ];
        let groups = groups_by_load_balancer(&services);
        assert_eq!(groups[&CloudTarget::classic("web")], set(&["edge"]));
        assert_eq!(groups[&CloudTarget::target_group("web")], set(&["core"]));
    }
}
