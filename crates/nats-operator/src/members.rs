//! Cluster members
//!
//! A member is one NATS server pod owned by a cluster. This module holds the
//! member model, the naming and scale-down ordering rules, the membership
//! plan computed from a desired size, and the [`MemberStore`] seam with its
//! Kubernetes implementation.
//!
//! # Naming
//!
//! Members are named `<cluster>-<ordinal>` with ordinals starting at 1. New
//! members take the smallest ordinals not used by any listed member,
//! including members that are still terminating, so a name is never reused
//! while its previous holder exists.
//!
//! # Scale-down order
//!
//! Members whose server process has exited (pod phase `Failed` or
//! `Succeeded`) never count towards the size; every pass deletes them and
//! creates replacements.
//!
//! Victims are chosen highest ordinal first. Members whose names do not
//! follow the ordinal scheme sort ahead of all ordinal members, by name
//! descending. The order depends on names alone, so retries under the same
//! observed membership always pick the same victims.

use crate::crd::{label_selector, ClusterDesiredState, ClusterKey, NatsClusterSpec, VERSION_LABEL};
use crate::error::{OperatorError, Result};
use crate::resources::ResourceBuilder;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "nats-operator";

/// One server process belonging to a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub cluster: ClusterKey,
    /// Whether the member passed its readiness checks
    pub ready: bool,
    /// Whether deletion of the member has already started
    pub terminating: bool,
    /// Whether the server process ended and will not be restarted
    pub exited: bool,
    /// Server version the member was created with
    pub version: Option<String>,
}

impl Member {
    pub fn new(name: impl Into<String>, cluster: ClusterKey) -> Self {
        Self {
            name: name.into(),
            cluster,
            ready: false,
            terminating: false,
            exited: false,
            version: None,
        }
    }

    /// Whether the member counts towards the cluster size
    pub fn is_active(&self) -> bool {
        !self.terminating && !self.exited
    }

    /// Exited but not yet being deleted
    fn needs_replacement(&self) -> bool {
        self.exited && !self.terminating
    }

    /// Ordinal encoded in the member name, if it follows `<cluster>-<n>`
    pub fn ordinal(&self) -> Option<u32> {
        parse_ordinal(&self.cluster.name, &self.name)
    }
}

/// Everything needed to create one member
#[derive(Debug, Clone, PartialEq)]
pub struct MemberSpec {
    pub name: String,
    pub cluster: ClusterKey,
    pub spec: NatsClusterSpec,
    pub owner_uid: Option<String>,
}

impl MemberSpec {
    pub fn for_cluster(cluster: &ClusterDesiredState, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster: cluster.key.clone(),
            spec: cluster.spec.clone(),
            owner_uid: cluster.uid.clone(),
        }
    }
}

/// Member name for `ordinal`
pub fn member_name(cluster_name: &str, ordinal: u32) -> String {
    format!("{}-{}", cluster_name, ordinal)
}

fn parse_ordinal(cluster_name: &str, member_name: &str) -> Option<u32> {
    let suffix = member_name.strip_prefix(cluster_name)?.strip_prefix('-')?;
    if suffix.starts_with('0') || suffix.starts_with('+') {
        return None;
    }
    suffix.parse().ok()
}

/// Pick `count` fresh names that collide with no listed member
pub fn next_member_names(cluster_name: &str, existing: &[Member], count: usize) -> Vec<String> {
    let taken: HashSet<&str> = existing.iter().map(|m| m.name.as_str()).collect();
    (1u32..)
        .map(|ordinal| member_name(cluster_name, ordinal))
        .filter(|name| !taken.contains(name.as_str()))
        .take(count)
        .collect()
}

fn scale_down_order(a: &Member, b: &Member) -> Ordering {
    match (a.ordinal(), b.ordinal()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => b.name.cmp(&a.name),
    }
}

/// Choose `count` members to remove, in a stable order
pub fn select_victims(members: &[Member], count: usize) -> Vec<String> {
    let mut candidates: Vec<&Member> = members.iter().filter(|m| m.is_active()).collect();
    candidates.sort_by(|a, b| scale_down_order(a, b));
    candidates
        .into_iter()
        .take(count)
        .map(|m| m.name.clone())
        .collect()
}

/// Members that count towards the cluster size
pub fn active_members(members: &[Member]) -> Vec<Member> {
    members.iter().filter(|m| m.is_active()).cloned().collect()
}

/// Membership changes needed to reach the desired size
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipPlan {
    pub create: Vec<String>,
    pub delete: Vec<String>,
}

impl MembershipPlan {
    /// Compute the plan for `desired_size` against the observed `members`.
    ///
    /// Exited members are always deleted, ahead of any scale-down victims.
    pub fn compute(cluster_name: &str, desired_size: usize, members: &[Member]) -> Self {
        let mut delete: Vec<String> = members
            .iter()
            .filter(|m| m.needs_replacement())
            .map(|m| m.name.clone())
            .collect();
        delete.sort();

        let active = members.iter().filter(|m| m.is_active()).count();
        let create = match desired_size.cmp(&active) {
            Ordering::Greater => next_member_names(cluster_name, members, desired_size - active),
            Ordering::Less => {
                delete.extend(select_victims(members, active - desired_size));
                Vec::new()
            }
            Ordering::Equal => Vec::new(),
        };

        Self { create, delete }
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty()
    }
}

/// Storage of cluster members
///
/// The list is always scoped to exactly one cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// List every member owned by `cluster`, terminating ones included
    async fn list(&self, cluster: &ClusterKey) -> Result<Vec<Member>>;

    /// Create one member
    async fn create(&self, member: &MemberSpec) -> Result<Member>;

    /// Delete one member; deleting a missing member succeeds
    async fn delete(&self, cluster: &ClusterKey, name: &str) -> Result<()>;
}

/// Members backed by Kubernetes Pods
pub struct KubeMemberStore {
    client: Client,
}

impl KubeMemberStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Ensure the headless management service exists before members need DNS
    async fn ensure_management_service(&self, cluster: &ClusterDesiredState) -> Result<()> {
        let svc = ResourceBuilder::new(cluster)?.build_management_service();
        apply_service(&self.client, &cluster.key.namespace, svc).await
    }
}

fn member_from_pod(cluster: &ClusterKey, pod: &Pod) -> Member {
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    // Pods run with restartPolicy Never, so these phases are final
    let exited = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Failed" || phase == "Succeeded");

    Member {
        name: pod.name_any(),
        cluster: cluster.clone(),
        ready: ready && !exited,
        terminating: pod.metadata.deletion_timestamp.is_some(),
        exited,
        version: pod.labels().get(VERSION_LABEL).cloned(),
    }
}

#[async_trait]
impl MemberStore for KubeMemberStore {
    async fn list(&self, cluster: &ClusterKey) -> Result<Vec<Member>> {
        let lp = ListParams::default().labels(&label_selector(&cluster.name));
        let pods = self.pods(&cluster.namespace).list(&lp).await?;
        Ok(pods
            .items
            .iter()
            .map(|pod| member_from_pod(cluster, pod))
            .collect())
    }

    async fn create(&self, member: &MemberSpec) -> Result<Member> {
        let desired = ClusterDesiredState {
            key: member.cluster.clone(),
            spec: member.spec.clone(),
            generation: None,
            uid: member.owner_uid.clone(),
        };
        self.ensure_management_service(&desired).await?;

        let pod = ResourceBuilder::new(&desired)?.build_member_pod(member);
        debug!(name = %member.name, cluster = %member.cluster, "Creating member pod");
        let created = self
            .pods(&member.cluster.namespace)
            .create(&PostParams::default(), &pod)
            .await?;

        info!(name = %member.name, cluster = %member.cluster, "Created member");
        Ok(member_from_pod(&member.cluster, &created))
    }

    async fn delete(&self, cluster: &ClusterKey, name: &str) -> Result<()> {
        debug!(name = %name, cluster = %cluster, "Deleting member pod");
        match self
            .pods(&cluster.namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(name = %name, cluster = %cluster, "Deleted member");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(name = %name, "Member already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Verify the operator still owns a resource before force-applying.
///
/// A resource labelled as managed by another controller is left alone.
fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get("app.kubernetes.io/managed-by"));
    match managed_by {
        Some(manager) if manager != FIELD_MANAGER => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; \
                 refusing to force-apply to avoid ownership conflict",
                name, manager, FIELD_MANAGER
            )))
        }
        _ => Ok(()),
    }
}

/// Apply a Service using server-side apply
async fn apply_service(client: &Client, namespace: &str, svc: Service) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let name = svc
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| OperatorError::InvalidConfig("Service missing metadata.name".into()))?;

    debug!(name = %name, "Applying Service");

    if let Some(existing) = api.get_opt(name).await? {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &patch_params, &Patch::Apply(&svc))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    fn key() -> ClusterKey {
        ClusterKey::new("default", "c1")
    }

    fn members(names: &[&str]) -> Vec<Member> {
        names.iter().map(|n| Member::new(*n, key())).collect()
    }

    #[test]
    fn test_parse_ordinal() {
        let m = |n: &str| Member::new(n, key());
        assert_eq!(m("c1-1").ordinal(), Some(1));
        assert_eq!(m("c1-12").ordinal(), Some(12));
        assert_eq!(m("c1-01").ordinal(), None);
        assert_eq!(m("c1-x").ordinal(), None);
        assert_eq!(m("c10-1").ordinal(), None);
        assert_eq!(m("c1").ordinal(), None);
    }

    #[test]
    fn test_next_names_fill_gaps() {
        let existing = members(&["c1-1", "c1-3"]);
        assert_eq!(
            next_member_names("c1", &existing, 3),
            vec!["c1-2", "c1-4", "c1-5"]
        );
    }

    #[test]
    fn test_next_names_skip_terminating() {
        let mut existing = members(&["c1-1", "c1-2"]);
        existing[1].terminating = true;
        assert_eq!(next_member_names("c1", &existing, 1), vec!["c1-3"]);
    }

    #[test]
    fn test_victims_highest_ordinal_first() {
        let existing = members(&["c1-2", "c1-10", "c1-1", "c1-3"]);
        assert_eq!(select_victims(&existing, 2), vec!["c1-10", "c1-3"]);
    }

    #[test]
    fn test_victims_prefer_foreign_names() {
        let existing = members(&["c1-1", "c1-manual", "c1-2", "c1-adopted"]);
        assert_eq!(
            select_victims(&existing, 3),
            vec!["c1-manual", "c1-adopted", "c1-2"]
        );
    }

    #[test]
    fn test_victims_stable_across_input_order() {
        let a = members(&["c1-1", "c1-2", "c1-3", "c1-4"]);
        let mut b = a.clone();
        b.reverse();
        assert_eq!(select_victims(&a, 2), select_victims(&b, 2));
    }

    #[test]
    fn test_plan_grow_shrink_steady() {
        let existing = members(&["c1-1", "c1-2"]);

        let grow = MembershipPlan::compute("c1", 4, &existing);
        assert_eq!(grow.create, vec!["c1-3", "c1-4"]);
        assert!(grow.delete.is_empty());

        let shrink = MembershipPlan::compute("c1", 0, &existing);
        assert_eq!(shrink.delete, vec!["c1-2", "c1-1"]);
        assert!(shrink.create.is_empty());

        assert!(MembershipPlan::compute("c1", 2, &existing).is_empty());
    }

    #[test]
    fn test_plan_ignores_terminating_members() {
        let mut existing = members(&["c1-1", "c1-2", "c1-3"]);
        existing[2].terminating = true;

        let plan = MembershipPlan::compute("c1", 3, &existing);
        assert_eq!(plan.create, vec!["c1-4"]);

        let plan = MembershipPlan::compute("c1", 1, &existing);
        assert_eq!(plan.delete, vec!["c1-2"]);
    }

    #[test]
    fn test_plan_replaces_exited_members() {
        let mut existing = members(&["c1-1", "c1-2", "c1-3"]);
        existing[1].exited = true;

        let plan = MembershipPlan::compute("c1", 3, &existing);
        assert_eq!(plan.create, vec!["c1-4"]);
        assert_eq!(plan.delete, vec!["c1-2"]);

        // Exited members go first, then the regular victims
        let plan = MembershipPlan::compute("c1", 1, &existing);
        assert!(plan.create.is_empty());
        assert_eq!(plan.delete, vec!["c1-2", "c1-3"]);

        let active = active_members(&existing);
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|m| m.name != "c1-2"));
    }

    #[test]
    fn test_exited_member_already_terminating_is_left_alone() {
        let mut existing = members(&["c1-1", "c1-2"]);
        existing[1].exited = true;
        existing[1].terminating = true;

        let plan = MembershipPlan::compute("c1", 2, &existing);
        assert_eq!(plan.create, vec!["c1-3"]);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_failed_pod_is_exited() {
        for phase in ["Failed", "Succeeded"] {
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some("c1-2".to_string()),
                    ..Default::default()
                },
                status: Some(PodStatus {
                    phase: Some(phase.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let member = member_from_pod(&key(), &pod);
            assert!(member.exited, "{} pod counted as running", phase);
            assert!(!member.is_active());
        }
    }

    #[test]
    fn test_member_from_pod() {
        let mut labels = BTreeMap::new();
        labels.insert(VERSION_LABEL.to_string(), "1.1.0".to_string());
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("c1-1".to_string()),
                labels: Some(labels),
                deletion_timestamp: Some(Time(chrono::Utc::now())),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let member = member_from_pod(&key(), &pod);
        assert_eq!(member.name, "c1-1");
        assert!(member.ready);
        assert!(member.terminating);
        assert!(!member.exited);
        assert_eq!(member.version.as_deref(), Some("1.1.0"));
    }

    #[test]
    fn test_verify_ownership() {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "helm".to_string(),
        );
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("c1-mgmt".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(verify_ownership(&svc).is_err());
        assert!(verify_ownership(&Service::default()).is_ok());
    }
}
