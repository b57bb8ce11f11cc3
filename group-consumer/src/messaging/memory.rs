use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::MessagingClient;
use crate::error::{Error, Result};
use crate::types::{FetchResponse, Message, OffsetPolicy, Partition};

#[derive(Default)]
struct Log {
    messages: Vec<Message>,
    failing_fetches: u32,
}

/// In-memory broker: an append-only log per partition.
///
/// Offsets start at zero and are dense. Partitions can be removed to simulate
/// topic shrinkage, and fetches can be made to fail a number of times.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, BTreeMap<Partition, Log>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<Partition, Log>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_topic(&self, topic: &str, partitions: &[Partition]) {
        let mut topics = self.lock();
        let logs = topics.entry(topic.to_string()).or_default();
        for p in partitions {
            logs.entry(p.clone()).or_default();
        }
    }

    /// Append a message and return its offset.
    pub fn append(
        &self,
        topic: &str,
        partition: &Partition,
        key: Option<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<i64> {
        let mut topics = self.lock();
        let log = topics
            .get_mut(topic)
            .and_then(|t| t.get_mut(partition))
            .ok_or_else(|| Error::PartitionGone(partition.clone()))?;
        let offset = log.messages.len() as i64;
        log.messages.push(Message {
            partition: partition.clone(),
            offset,
            key,
            value: value.into(),
        });
        Ok(offset)
    }

    pub fn remove_partition(&self, topic: &str, partition: &Partition) {
        if let Some(t) = self.lock().get_mut(topic) {
            t.remove(partition);
        }
    }

    pub fn fail_next_fetches(&self, topic: &str, partition: &Partition, count: u32) {
        if let Some(log) = self.lock().get_mut(topic).and_then(|t| t.get_mut(partition)) {
            log.failing_fetches = count;
        }
    }

    pub fn high_watermark(&self, topic: &str, partition: &Partition) -> Option<i64> {
        self.lock()
            .get(topic)
            .and_then(|t| t.get(partition))
            .map(|log| log.messages.len() as i64)
    }
}

#[async_trait]
impl MessagingClient for MemoryBroker {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<Partition>> {
        Ok(self
            .lock()
            .get(topic)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn resolve_offset(
        &self,
        topic: &str,
        partition: &Partition,
        policy: OffsetPolicy,
    ) -> Result<i64> {
        let topics = self.lock();
        let log = topics
            .get(topic)
            .and_then(|t| t.get(partition))
            .ok_or_else(|| Error::PartitionGone(partition.clone()))?;
        Ok(match policy {
            OffsetPolicy::Earliest => 0,
            OffsetPolicy::Latest => log.messages.len() as i64,
        })
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: &Partition,
        offset: i64,
        max_messages: usize,
    ) -> Result<FetchResponse> {
        let mut topics = self.lock();
        let log = topics
            .get_mut(topic)
            .and_then(|t| t.get_mut(partition))
            .ok_or_else(|| Error::PartitionGone(partition.clone()))?;

        if log.failing_fetches > 0 {
            log.failing_fetches -= 1;
            return Err(Error::Fetch {
                partition: partition.clone(),
                reason: "injected fetch failure".to_string(),
            });
        }

        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let messages: Vec<Message> = log
            .messages
            .iter()
            .skip(start)
            .take(max_messages)
            .cloned()
            .collect();
        let next_offset = messages.last().map(|m| m.offset + 1).unwrap_or(offset);
        Ok(FetchResponse {
            messages,
            next_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_respects_offset_and_limit() {
        let broker = MemoryBroker::new();
        let p = Partition::new("h", 0);
        broker.create_topic("t", &[p.clone()]);
        for i in 0..10 {
            broker.append("t", &p, None, format!("m{i}")).unwrap();
        }

        let resp = broker.fetch("t", &p, 3, 4).await.unwrap();
        let offsets: Vec<i64> = resp.messages.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![3, 4, 5, 6]);
        assert_eq!(resp.next_offset, 7);

        let empty = broker.fetch("t", &p, 10, 4).await.unwrap();
        assert!(empty.messages.is_empty());
        assert_eq!(empty.next_offset, 10);
    }

    #[tokio::test]
    async fn offset_policies() {
        let broker = MemoryBroker::new();
        let p = Partition::new("h", 0);
        broker.create_topic("t", &[p.clone()]);
        broker.append("t", &p, None, "a").unwrap();
        broker.append("t", &p, None, "b").unwrap();

        assert_eq!(broker.resolve_offset("t", &p, OffsetPolicy::Earliest).await.unwrap(), 0);
        assert_eq!(broker.resolve_offset("t", &p, OffsetPolicy::Latest).await.unwrap(), 2);
        assert_eq!(broker.high_watermark("t", &p), Some(2));
        assert_eq!(broker.high_watermark("t", &Partition::new("h", 1)), None);
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let broker = MemoryBroker::new();
        let p = Partition::new("h", 0);
        broker.create_topic("t", &[p.clone()]);
        broker.fail_next_fetches("t", &p, 2);

        assert!(matches!(broker.fetch("t", &p, 0, 1).await, Err(Error::Fetch { .. })));
        assert!(matches!(broker.fetch("t", &p, 0, 1).await, Err(Error::Fetch { .. })));
        assert!(broker.fetch("t", &p, 0, 1).await.is_ok());
    }

    #[tokio::test]
    async fn removed_partition_is_gone() {
        let broker = MemoryBroker::new();
        let p = Partition::new("h", 0);
        broker.create_topic("t", &[p.clone()]);
        broker.remove_partition("t", &p);
        assert!(matches!(
            broker.fetch("t", &p, 0, 1).await,
            Err(Error::PartitionGone(_))
        ));
        assert!(broker.list_partitions("t").await.unwrap().is_empty());
    }
}
