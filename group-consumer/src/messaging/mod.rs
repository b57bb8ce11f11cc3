//! The messaging seam: partition discovery, offset resolution, fetching, and
//! handing fetched messages to the application.

mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::{FetchResponse, Message, OffsetPolicy, Partition};

/// Messaging client trait that both real and in-memory brokers implement.
#[async_trait]
pub trait MessagingClient: Send + Sync + 'static {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<Partition>>;

    /// Translate a policy into a concrete starting offset for `partition`.
    async fn resolve_offset(
        &self,
        topic: &str,
        partition: &Partition,
        policy: OffsetPolicy,
    ) -> Result<i64>;

    /// Fetch up to `max_messages` starting at `offset`.
    ///
    /// Returns [`Error::PartitionGone`] when the partition no longer exists and
    /// [`Error::Fetch`] for failures worth retrying.
    async fn fetch(
        &self,
        topic: &str,
        partition: &Partition,
        offset: i64,
        max_messages: usize,
    ) -> Result<FetchResponse>;
}

/// Receives each fetched batch before its offsets become eligible for
/// checkpointing. An error causes the batch to be redelivered.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn deliver(
        &self,
        topic: &str,
        partition: &Partition,
        messages: Vec<Message>,
    ) -> Result<()>;
}

/// Forwards every message into a bounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn deliver(
        &self,
        _topic: &str,
        _partition: &Partition,
        messages: Vec<Message>,
    ) -> Result<()> {
        for message in messages {
            self.tx
                .send(message)
                .await
                .map_err(|_| Error::Delivery("message channel closed".to_string()))?;
        }
        Ok(())
    }
}
