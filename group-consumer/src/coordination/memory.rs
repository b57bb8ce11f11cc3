use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{validate_partition, CoordinationClient, RegistrationHandle, SnapshotStream};
use crate::error::{Error, Result};
use crate::types::{ClaimOutcome, Partition};

type ClaimKey = (String, String, Partition);

/// Everything that changed ownership or checkpoint state, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    Registered {
        group: String,
        consumer_id: String,
    },
    Deregistered {
        group: String,
        consumer_id: String,
    },
    SessionExpired {
        group: String,
        consumer_id: String,
    },
    Claimed {
        topic: String,
        partition: Partition,
        consumer_id: String,
    },
    Released {
        topic: String,
        partition: Partition,
        consumer_id: String,
    },
    Rejected {
        topic: String,
        partition: Partition,
        consumer_id: String,
        owner: String,
    },
    CheckpointWritten {
        topic: String,
        partition: Partition,
        consumer_id: String,
        offset: i64,
    },
}

struct State {
    connected: bool,
    connection: CancellationToken,
    members: HashMap<String, BTreeMap<String, CancellationToken>>,
    claims: BTreeMap<ClaimKey, String>,
    checkpoints: HashMap<ClaimKey, i64>,
    partitions: HashMap<String, Vec<Partition>>,
    consumer_watchers: HashMap<String, watch::Sender<Vec<String>>>,
    partition_watchers: HashMap<String, watch::Sender<Vec<Partition>>>,
    failing_claims: u32,
    history: Vec<CoordinationEvent>,
}

impl State {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::TransientCoordination(
                "coordination service disconnected".to_string(),
            ))
        }
    }

    fn member_ids(&self, group: &str) -> Vec<String> {
        self.members
            .get(group)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn consumer_sender(&mut self, group: &str) -> &watch::Sender<Vec<String>> {
        let current = self.member_ids(group);
        self.consumer_watchers
            .entry(group.to_string())
            .or_insert_with(|| watch::channel(current).0)
    }

    fn partition_sender(&mut self, topic: &str) -> &watch::Sender<Vec<Partition>> {
        let current = self.partitions.get(topic).cloned().unwrap_or_default();
        self.partition_watchers
            .entry(topic.to_string())
            .or_insert_with(|| watch::channel(current).0)
    }

    fn notify_members(&mut self, group: &str) {
        let ids = self.member_ids(group);
        self.consumer_sender(group).send_replace(ids);
    }

    /// Remove a member and every claim it holds, as a lease expiry would.
    fn purge_member(&mut self, group: &str, consumer_id: &str) -> bool {
        let Some(token) = self
            .members
            .get_mut(group)
            .and_then(|m| m.remove(consumer_id))
        else {
            return false;
        };
        token.cancel();

        let held: Vec<ClaimKey> = self
            .claims
            .iter()
            .filter(|((g, _, _), owner)| g == group && owner.as_str() == consumer_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in held {
            self.claims.remove(&key);
            let (_, topic, partition) = key;
            self.history.push(CoordinationEvent::Released {
                topic,
                partition,
                consumer_id: consumer_id.to_string(),
            });
        }
        true
    }
}

/// In-process coordination service with fault injection.
///
/// Behaves like the etcd backend: registrations are ephemeral, claims are
/// conditional creates tied to the claimant's registration, and checkpoint
/// writes require a held claim. Every mutation is recorded in
/// [`history`](Self::history) so tests can check ownership invariants after
/// the fact.
pub struct MemoryCoordination {
    state: Mutex<State>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                connected: true,
                connection: CancellationToken::new(),
                members: HashMap::new(),
                claims: BTreeMap::new(),
                checkpoints: HashMap::new(),
                partitions: HashMap::new(),
                consumer_watchers: HashMap::new(),
                partition_watchers: HashMap::new(),
                failing_claims: 0,
                history: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Fault injection ──────────────────────────────────────────

    /// Drop the connection: every session expires, every claim is released
    /// and every open watch stream fails.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.connection.cancel();

        let groups: Vec<String> = state.members.keys().cloned().collect();
        for group in groups {
            for consumer_id in state.member_ids(&group) {
                state.purge_member(&group, &consumer_id);
                state.history.push(CoordinationEvent::SessionExpired {
                    group: group.clone(),
                    consumer_id,
                });
            }
            state.notify_members(&group);
        }
        tracing::info!("memory coordination disconnected");
    }

    pub fn reconnect(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.connection = CancellationToken::new();
        tracing::info!("memory coordination reconnected");
    }

    /// Expire a single member's session as if its lease ran out.
    pub fn expire_session(&self, group: &str, consumer_id: &str) {
        let mut state = self.lock();
        if state.purge_member(group, consumer_id) {
            state.history.push(CoordinationEvent::SessionExpired {
                group: group.to_string(),
                consumer_id: consumer_id.to_string(),
            });
            state.notify_members(group);
        }
    }

    /// Record `owner` as the holder of `partition` regardless of current state.
    pub fn force_claim(&self, group: &str, topic: &str, partition: &Partition, owner: &str) {
        let mut state = self.lock();
        state.claims.insert(
            (group.to_string(), topic.to_string(), partition.clone()),
            owner.to_string(),
        );
    }

    pub fn drop_claim(&self, group: &str, topic: &str, partition: &Partition) {
        let mut state = self.lock();
        state
            .claims
            .remove(&(group.to_string(), topic.to_string(), partition.clone()));
    }

    /// Fail the next `count` claim calls with a transient error.
    pub fn fail_next_claims(&self, count: u32) {
        self.lock().failing_claims = count;
    }

    pub fn set_checkpoint(&self, group: &str, topic: &str, partition: &Partition, offset: i64) {
        self.lock().checkpoints.insert(
            (group.to_string(), topic.to_string(), partition.clone()),
            offset,
        );
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn owner_of(&self, group: &str, topic: &str, partition: &Partition) -> Option<String> {
        self.lock()
            .claims
            .get(&(group.to_string(), topic.to_string(), partition.clone()))
            .cloned()
    }

    pub fn claims(&self, group: &str, topic: &str) -> BTreeMap<Partition, String> {
        self.lock()
            .claims
            .iter()
            .filter(|((g, t, _), _)| g == group && t == topic)
            .map(|((_, _, p), owner)| (p.clone(), owner.clone()))
            .collect()
    }

    pub fn checkpoint_of(&self, group: &str, topic: &str, partition: &Partition) -> Option<i64> {
        self.lock()
            .checkpoints
            .get(&(group.to_string(), topic.to_string(), partition.clone()))
            .copied()
    }

    pub fn members(&self, group: &str) -> Vec<String> {
        self.lock().member_ids(group)
    }

    pub fn history(&self) -> Vec<CoordinationEvent> {
        self.lock().history.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

/// Emit the receiver's current value, then every subsequent value, until the
/// connection drops.
fn snapshot_stream<T>(
    rx: watch::Receiver<T>,
    connection: CancellationToken,
    what: String,
) -> SnapshotStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    futures::stream::try_unfold((rx, false), move |(mut rx, primed)| {
        let connection = connection.clone();
        let what = what.clone();
        async move {
            if primed {
                tokio::select! {
                    biased;
                    _ = connection.cancelled() => {
                        return Err(Error::TransientCoordination(format!(
                            "watch on {what} lost its connection"
                        )));
                    }
                    changed = rx.changed() => {
                        changed.map_err(|_| {
                            Error::TransientCoordination(format!("watch on {what} closed"))
                        })?;
                    }
                }
            }
            let snapshot = rx.borrow_and_update().clone();
            Ok(Some((snapshot, (rx, true))))
        }
    })
    .boxed()
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    async fn register_self(&self, group: &str, consumer_id: &str) -> Result<RegistrationHandle> {
        let mut state = self.lock();
        state.ensure_connected()?;

        let members = state.members.entry(group.to_string()).or_default();
        if members.contains_key(consumer_id) {
            return Err(Error::invalid_state(format!(
                "consumer {consumer_id} is already registered in {group}"
            )));
        }
        let lost = CancellationToken::new();
        members.insert(consumer_id.to_string(), lost.clone());

        state.history.push(CoordinationEvent::Registered {
            group: group.to_string(),
            consumer_id: consumer_id.to_string(),
        });
        state.notify_members(group);
        Ok(RegistrationHandle::new(group, consumer_id, None, lost))
    }

    async fn deregister(&self, handle: &RegistrationHandle) -> Result<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        // Only the session that created the registration may remove it.
        let current = state
            .members
            .get(handle.group())
            .and_then(|m| m.get(handle.consumer_id()))
            .is_some_and(|_| !handle.is_lost());
        if current && state.purge_member(handle.group(), handle.consumer_id()) {
            state.history.push(CoordinationEvent::Deregistered {
                group: handle.group().to_string(),
                consumer_id: handle.consumer_id().to_string(),
            });
            state.notify_members(handle.group());
        }
        Ok(())
    }

    async fn watch_consumers(&self, group: &str) -> Result<SnapshotStream<Vec<String>>> {
        let mut state = self.lock();
        state.ensure_connected()?;
        let rx = state.consumer_sender(group).subscribe();
        Ok(snapshot_stream(
            rx,
            state.connection.clone(),
            format!("consumers of {group}"),
        ))
    }

    async fn watch_partitions(&self, topic: &str) -> Result<SnapshotStream<Vec<Partition>>> {
        let mut state = self.lock();
        state.ensure_connected()?;
        let rx = state.partition_sender(topic).subscribe();
        Ok(snapshot_stream(
            rx,
            state.connection.clone(),
            format!("partitions of {topic}"),
        ))
    }

    async fn publish_partitions(&self, topic: &str, partitions: &[Partition]) -> Result<()> {
        for p in partitions {
            validate_partition(p)?;
        }
        let mut state = self.lock();
        state.ensure_connected()?;

        let mut sorted = partitions.to_vec();
        sorted.sort();
        sorted.dedup();
        state.partitions.insert(topic.to_string(), sorted.clone());
        state.partition_sender(topic).send_replace(sorted);
        Ok(())
    }

    async fn claim(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
    ) -> Result<ClaimOutcome> {
        let mut state = self.lock();
        state.ensure_connected()?;
        if state.failing_claims > 0 {
            state.failing_claims -= 1;
            return Err(Error::TransientCoordination(format!(
                "injected claim failure for {partition}"
            )));
        }
        let registered = state
            .members
            .get(group)
            .is_some_and(|m| m.contains_key(consumer_id));
        if !registered {
            return Err(Error::invalid_state(format!(
                "consumer {consumer_id} is not registered in {group}"
            )));
        }

        let key = (group.to_string(), topic.to_string(), partition.clone());
        match state.claims.get(&key).cloned() {
            Some(owner) if owner == consumer_id => Ok(ClaimOutcome::Claimed),
            Some(owner) => {
                state.history.push(CoordinationEvent::Rejected {
                    topic: topic.to_string(),
                    partition: partition.clone(),
                    consumer_id: consumer_id.to_string(),
                    owner: owner.clone(),
                });
                Ok(ClaimOutcome::Conflict { owner })
            }
            None => {
                state.claims.insert(key, consumer_id.to_string());
                state.history.push(CoordinationEvent::Claimed {
                    topic: topic.to_string(),
                    partition: partition.clone(),
                    consumer_id: consumer_id.to_string(),
                });
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn release(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        let key = (group.to_string(), topic.to_string(), partition.clone());
        if state.claims.get(&key).is_some_and(|o| o == consumer_id) {
            state.claims.remove(&key);
            state.history.push(CoordinationEvent::Released {
                topic: topic.to_string(),
                partition: partition.clone(),
                consumer_id: consumer_id.to_string(),
            });
        }
        Ok(())
    }

    async fn read_checkpoint(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
    ) -> Result<Option<i64>> {
        let state = self.lock();
        state.ensure_connected()?;
        Ok(state
            .checkpoints
            .get(&(group.to_string(), topic.to_string(), partition.clone()))
            .copied())
    }

    async fn write_checkpoint(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
        offset: i64,
    ) -> Result<()> {
        let mut state = self.lock();
        state.ensure_connected()?;
        let key = (group.to_string(), topic.to_string(), partition.clone());
        if !state.claims.get(&key).is_some_and(|o| o == consumer_id) {
            return Err(Error::OwnershipLost(partition.clone()));
        }
        state.checkpoints.insert(key, offset);
        state.history.push(CoordinationEvent::CheckpointWritten {
            topic: topic.to_string(),
            partition: partition.clone(),
            consumer_id: consumer_id.to_string(),
            offset,
        });
        Ok(())
    }
}
