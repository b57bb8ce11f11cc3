//! The coordination service seam: membership registration, partition
//! discovery, exclusive ownership claims and checkpoint storage.

mod etcd;
mod memory;

pub use etcd::EtcdCoordination;
pub use memory::{CoordinationEvent, MemoryCoordination};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{ClaimOutcome, Partition};

/// A stream of full snapshots. Each item replaces the previous one. An `Err`
/// item, or the end of the stream, means the watch is broken for good.
pub type SnapshotStream<T> = BoxStream<'static, Result<T>>;

/// Proof of registration in a group.
///
/// `lost()` fires once the backing session is gone (lease expired, connection
/// dropped); every claim made under it is void from that point on. Dropping
/// the handle stops any background keepalive.
#[derive(Debug)]
pub struct RegistrationHandle {
    group: String,
    consumer_id: String,
    lease_id: Option<i64>,
    lost: CancellationToken,
    shutdown: CancellationToken,
}

impl RegistrationHandle {
    pub fn new(
        group: impl Into<String>,
        consumer_id: impl Into<String>,
        lease_id: Option<i64>,
        lost: CancellationToken,
    ) -> Self {
        Self {
            group: group.into(),
            consumer_id: consumer_id.into(),
            lease_id,
            lost,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn lease_id(&self) -> Option<i64> {
        self.lease_id
    }

    /// Resolves when the session behind this registration is gone.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Create this member's ephemeral registration. Fails if the id is
    /// already registered by a live session.
    async fn register_self(&self, group: &str, consumer_id: &str) -> Result<RegistrationHandle>;

    async fn deregister(&self, handle: &RegistrationHandle) -> Result<()>;

    /// Sorted consumer ids of the group, re-emitted on every change.
    async fn watch_consumers(&self, group: &str) -> Result<SnapshotStream<Vec<String>>>;

    /// Sorted partitions of the topic, re-emitted on every change.
    async fn watch_partitions(&self, topic: &str) -> Result<SnapshotStream<Vec<Partition>>>;

    /// Replace the published partition list of `topic`.
    async fn publish_partitions(&self, topic: &str, partitions: &[Partition]) -> Result<()>;

    /// Atomically create the ownership record for `partition` if absent.
    /// Re-claiming a partition already held by `consumer_id` succeeds.
    async fn claim(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
    ) -> Result<ClaimOutcome>;

    /// Remove the ownership record, but only if `consumer_id` holds it.
    async fn release(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
    ) -> Result<()>;

    async fn read_checkpoint(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
    ) -> Result<Option<i64>>;

    /// Persist the next offset to consume. Fails with
    /// [`Error::OwnershipLost`] when `consumer_id` no longer holds the claim.
    async fn write_checkpoint(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
        offset: i64,
    ) -> Result<()>;
}

pub(crate) fn validate_partition(partition: &Partition) -> Result<()> {
    if partition.addr.is_empty() || partition.addr.contains('/') {
        return Err(Error::invalid_state(format!(
            "partition address {:?} must be non-empty and contain no '/'",
            partition.addr
        )));
    }
    Ok(())
}
