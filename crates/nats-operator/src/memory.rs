//! In-memory backend
//!
//! [`MemoryBackend`] implements every store seam ([`ClusterStore`],
//! [`ClusterWatcher`], [`MemberStore`], [`ArtifactStore`]) on shared maps.
//! It behaves like the API server where the controller can observe it:
//! generations bump on spec changes only, names collide with 409, missing
//! objects answer 404, and watches replay existing clusters on subscribe.
//! Operations can be failed or slowed on demand.

use crate::artifact::{Artifact, ArtifactStore};
use crate::cluster_client::{ClusterEvent, ClusterEventStream, ClusterStore, ClusterWatcher};
use crate::crd::{ClusterDesiredState, ClusterKey, NatsClusterSpec, NatsClusterStatus};
use crate::error::{OperatorError, Result};
use crate::members::{Member, MemberSpec, MemberStore};
use crate::natsconf::CONFIG_KEY;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Operation that can be failed on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetCluster,
    UpdateStatus,
    Watch,
    ListMembers,
    CreateMember,
    DeleteMember,
    GetArtifact,
    CreateArtifact,
    UpdateArtifact,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub member_creates: usize,
    pub member_deletes: usize,
    pub artifact_writes: usize,
    pub status_updates: usize,
}

struct StoredCluster {
    desired: ClusterDesiredState,
    status: Option<NatsClusterStatus>,
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<ClusterKey, StoredCluster>,
    members: BTreeMap<ClusterKey, BTreeMap<String, Member>>,
    artifacts: BTreeMap<ClusterKey, Artifact>,
    /// Remaining injected failures: (status code, count)
    failures: HashMap<Op, (u16, u32)>,
    subscribers: Vec<mpsc::UnboundedSender<Result<ClusterEvent>>>,
    counters: Counters,
    delays: HashMap<Op, Duration>,
    members_start_ready: bool,
    next_uid: u64,
}

/// Shared in-memory store; clones share state
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                members_start_ready: true,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or update a cluster, bumping its generation when the spec changed
    pub fn apply_cluster(&self, key: ClusterKey, spec: NatsClusterSpec) -> ClusterDesiredState {
        let mut guard = self.state();
        let state = &mut *guard;
        let event = match state.clusters.get_mut(&key) {
            Some(stored) => {
                if stored.desired.spec != spec {
                    stored.desired.spec = spec;
                    stored.desired.generation = stored.desired.generation.map(|g| g + 1);
                }
                ClusterEvent::Modified(stored.desired.clone())
            }
            None => {
                state.next_uid += 1;
                let mut desired = ClusterDesiredState::new(key.clone(), spec);
                desired.generation = Some(1);
                desired.uid = Some(format!("uid-{}", state.next_uid));
                state.clusters.insert(
                    key,
                    StoredCluster {
                        desired: desired.clone(),
                        status: None,
                    },
                );
                ClusterEvent::Added(desired)
            }
        };
        let desired = event.cluster().clone();
        broadcast(state, event);
        desired
    }

    /// Delete a cluster. Its members and artifact stay, as without garbage collection.
    pub fn delete_cluster(&self, key: &ClusterKey) {
        let mut state = self.state();
        if let Some(stored) = state.clusters.remove(key) {
            broadcast(&mut state, ClusterEvent::Deleted(stored.desired));
        }
    }

    pub fn status(&self, key: &ClusterKey) -> Option<NatsClusterStatus> {
        self.state()
            .clusters
            .get(key)
            .and_then(|c| c.status.clone())
    }

    /// Sorted names of every stored member of `key`
    pub fn member_names(&self, key: &ClusterKey) -> Vec<String> {
        self.state()
            .members
            .get(key)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Insert a member the controller did not create
    pub fn insert_member(&self, member: Member) {
        self.state()
            .members
            .entry(member.cluster.clone())
            .or_default()
            .insert(member.name.clone(), member);
    }

    /// Mark every member of `key` ready or not ready
    pub fn set_members_ready(&self, key: &ClusterKey, ready: bool) {
        if let Some(members) = self.state().members.get_mut(key) {
            for member in members.values_mut() {
                member.ready = ready;
            }
        }
    }

    /// Simulate the server process of member `name` exiting
    pub fn mark_member_exited(&self, key: &ClusterKey, name: &str) {
        if let Some(member) = self
            .state()
            .members
            .get_mut(key)
            .and_then(|m| m.get_mut(name))
        {
            member.exited = true;
            member.ready = false;
        }
    }

    /// Whether newly created members report ready immediately
    pub fn set_members_start_ready(&self, ready: bool) {
        self.state().members_start_ready = ready;
    }

    pub fn artifact(&self, key: &ClusterKey) -> Option<Artifact> {
        self.state().artifacts.get(key).cloned()
    }

    /// The stored `nats.conf`, as text
    pub fn config_text(&self, key: &ClusterKey) -> Option<String> {
        self.artifact(key)
            .and_then(|a| a.data.get(CONFIG_KEY).cloned())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Store an artifact directly, bypassing the counters
    pub fn put_artifact(&self, artifact: Artifact) {
        self.state()
            .artifacts
            .insert(artifact.key.clone(), artifact);
    }

    /// Fail the next `times` calls of `op` with HTTP status `code`
    pub fn fail(&self, op: Op, code: u16, times: u32) {
        self.state().failures.insert(op, (code, times));
    }

    /// Delay every call of `op` by `delay`
    pub fn slow(&self, op: Op, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    /// End every open watch stream
    pub fn close_watches(&self) {
        self.state().subscribers.clear();
    }

    pub fn counters(&self) -> Counters {
        self.state().counters
    }

    pub fn member_creates(&self) -> usize {
        self.counters().member_creates
    }

    pub fn member_deletes(&self) -> usize {
        self.counters().member_deletes
    }

    pub fn artifact_writes(&self) -> usize {
        self.counters().artifact_writes
    }

    /// Delay, then consume an injected failure for `op` if one is pending
    async fn enter(&self, op: Op) -> Result<()> {
        let delay = self.state().delays.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some((code, remaining)) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(OperatorError::Api {
                    code: *code,
                    message: format!("injected failure for {:?}", op),
                });
            }
        }
        Ok(())
    }
}

fn broadcast(state: &mut State, event: ClusterEvent) {
    state
        .subscribers
        .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
}

fn not_found(what: &str, key: &ClusterKey) -> OperatorError {
    OperatorError::Api {
        code: 404,
        message: format!("{} {} not found", what, key),
    }
}

#[async_trait]
impl ClusterStore for MemoryBackend {
    async fn get(&self, key: &ClusterKey) -> Result<Option<ClusterDesiredState>> {
        self.enter(Op::GetCluster).await?;
        Ok(self.state().clusters.get(key).map(|c| c.desired.clone()))
    }

    async fn update_status(&self, key: &ClusterKey, status: &NatsClusterStatus) -> Result<()> {
        self.enter(Op::UpdateStatus).await?;
        let mut guard = self.state();
        let state = &mut *guard;
        let stored = state
            .clusters
            .get_mut(key)
            .ok_or_else(|| not_found("NatsCluster", key))?;
        stored.status = Some(status.clone());
        // Status writes leave the generation alone, like the status subresource
        let event = ClusterEvent::Modified(stored.desired.clone());
        state.counters.status_updates += 1;
        broadcast(state, event);
        Ok(())
    }
}

#[async_trait]
impl ClusterWatcher for MemoryBackend {
    async fn watch(&self, namespace: Option<&str>) -> Result<ClusterEventStream> {
        self.enter(Op::Watch).await?;
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state();
        for stored in state.clusters.values() {
            // Receiver is alive, sending cannot fail
            let _ = tx.unbounded_send(Ok(ClusterEvent::Added(stored.desired.clone())));
        }
        state.subscribers.push(tx);

        let namespace = namespace.map(str::to_string);
        Ok(rx
            .filter(move |event| {
                let keep = match (&namespace, event) {
                    (Some(ns), Ok(event)) => event.cluster().key.namespace == *ns,
                    _ => true,
                };
                futures::future::ready(keep)
            })
            .boxed())
    }
}

#[async_trait]
impl MemberStore for MemoryBackend {
    async fn list(&self, cluster: &ClusterKey) -> Result<Vec<Member>> {
        self.enter(Op::ListMembers).await?;
        Ok(self
            .state()
            .members
            .get(cluster)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, spec: &MemberSpec) -> Result<Member> {
        self.enter(Op::CreateMember).await?;
        let mut guard = self.state();
        let state = &mut *guard;
        let mut member = Member::new(spec.name.clone(), spec.cluster.clone());
        member.ready = state.members_start_ready;
        member.version = Some(spec.spec.version.clone());

        let members = state.members.entry(spec.cluster.clone()).or_default();
        if members.contains_key(&spec.name) {
            return Err(OperatorError::Api {
                code: 409,
                message: format!("member {} already exists", spec.name),
            });
        }
        members.insert(spec.name.clone(), member.clone());
        state.counters.member_creates += 1;
        Ok(member)
    }

    async fn delete(&self, cluster: &ClusterKey, name: &str) -> Result<()> {
        self.enter(Op::DeleteMember).await?;
        let mut state = self.state();
        let removed = state
            .members
            .get_mut(cluster)
            .and_then(|m| m.remove(name))
            .is_some();
        if removed {
            state.counters.member_deletes += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MemoryBackend {
    async fn get(&self, key: &ClusterKey) -> Result<Option<Artifact>> {
        self.enter(Op::GetArtifact).await?;
        Ok(self.state().artifacts.get(key).cloned())
    }

    async fn create(&self, artifact: &Artifact) -> Result<()> {
        self.enter(Op::CreateArtifact).await?;
        let mut state = self.state();
        if state.artifacts.contains_key(&artifact.key) {
            return Err(OperatorError::Api {
                code: 409,
                message: format!("artifact {} already exists", artifact.key),
            });
        }
        state
            .artifacts
            .insert(artifact.key.clone(), artifact.clone());
        state.counters.artifact_writes += 1;
        Ok(())
    }

    async fn update(&self, artifact: &Artifact) -> Result<()> {
        self.enter(Op::UpdateArtifact).await?;
        let mut state = self.state();
        if !state.artifacts.contains_key(&artifact.key) {
            return Err(not_found("artifact", &artifact.key));
        }
        state
            .artifacts
            .insert(artifact.key.clone(), artifact.clone());
        state.counters.artifact_writes += 1;
        Ok(())
    }
}
