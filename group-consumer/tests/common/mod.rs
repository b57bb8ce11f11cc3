#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use group_consumer::config::Config;
use group_consumer::coordination::{CoordinationClient, EtcdCoordination, MemoryCoordination};
use group_consumer::coordinator::{CoordinatorConfig, RebalanceCoordinator};
use group_consumer::error::Result;
use group_consumer::messaging::{MemoryBroker, MessageSink, MessagingClient};
use group_consumer::notifier::Notifier;
use group_consumer::partition_consumer::PartitionConsumerConfig;
use group_consumer::types::{GroupState, Message, Partition};
use group_consumer::Error;

pub const GROUP: &str = "sarama-cluster-group";
pub const TOPIC: &str = "sarama-cluster-topic";
pub const ETCD_ENDPOINT: &str = "http://localhost:2379";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

/// Poll a synchronous condition with the default timeout.
pub async fn wait_until(f: impl Fn() -> bool) {
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || std::future::ready(f())).await
}

pub async fn test_coordination(test_name: &str) -> Arc<EtcdCoordination> {
    let mut config = Config::init_with_defaults().expect("default config should parse");
    config.etcd_endpoints = ETCD_ENDPOINT.to_string();
    config.etcd_prefix = format!("/test-{}-{}/", test_name, uuid::Uuid::new_v4());
    config.lease_ttl_secs = 5;
    config.keepalive_interval_secs = 1;
    let coordination = EtcdCoordination::connect(&config)
        .await
        .expect("failed to connect to etcd");
    Arc::new(coordination)
}

pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

pub fn partitions(addrs: &[&str], per_addr: u32) -> Vec<Partition> {
    let mut out: Vec<Partition> = addrs
        .iter()
        .flat_map(|a| (0..per_addr).map(move |id| Partition::new(*a, id)))
        .collect();
    out.sort();
    out
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        consumer: PartitionConsumerConfig {
            fetch_backoff: Duration::from_millis(5),
            idle_poll_interval: Duration::from_millis(5),
            checkpoint_interval: Duration::from_millis(20),
            ..Default::default()
        },
        stop_timeout: Duration::from_secs(2),
        claim_max_attempts: 3,
        claim_backoff_base: Duration::from_millis(5),
        claim_backoff_max: Duration::from_millis(50),
        session_max_attempts: 200,
        topology_refresh_interval: None,
    }
}

/// Create the topic on the broker and publish its partitions.
pub async fn seed_topic(
    coordination: &dyn CoordinationClient,
    broker: &MemoryBroker,
    partitions: &[Partition],
) {
    broker.create_topic(TOPIC, partitions);
    coordination
        .publish_partitions(TOPIC, partitions)
        .await
        .unwrap();
}

pub fn produce(broker: &MemoryBroker, partition: &Partition, count: usize) {
    for i in 0..count {
        broker
            .append(TOPIC, partition, None, format!("{partition}#{i}"))
            .unwrap();
    }
}

// ── Recording sink ──────────────────────────────────────────────

/// Records every delivered message together with the member that received it.
#[derive(Clone, Default)]
pub struct CollectingSink {
    deliveries: Arc<Mutex<Vec<(String, Message)>>>,
}

impl CollectingSink {
    pub fn for_member(&self, consumer_id: &str) -> MemberSink {
        MemberSink {
            consumer_id: consumer_id.to_string(),
            deliveries: self.deliveries.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    pub fn deliveries(&self) -> Vec<(String, Message)> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Offsets delivered per partition, in delivery order.
    pub fn offsets_by_partition(&self) -> BTreeMap<Partition, Vec<i64>> {
        let mut out: BTreeMap<Partition, Vec<i64>> = BTreeMap::new();
        for (_, message) in self.deliveries.lock().unwrap().iter() {
            out.entry(message.partition.clone())
                .or_default()
                .push(message.offset);
        }
        out
    }

    /// Members that consumed `partition`, one entry per ownership change.
    pub fn members_for(&self, partition: &Partition) -> Vec<String> {
        let mut members: Vec<String> = self
            .deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| &m.partition == partition)
            .map(|(member, _)| member.clone())
            .collect();
        members.dedup();
        members
    }
}

pub struct MemberSink {
    consumer_id: String,
    deliveries: Arc<Mutex<Vec<(String, Message)>>>,
}

#[async_trait]
impl MessageSink for MemberSink {
    async fn deliver(
        &self,
        _topic: &str,
        _partition: &Partition,
        messages: Vec<Message>,
    ) -> Result<()> {
        let mut deliveries = self.deliveries.lock().unwrap();
        for message in messages {
            deliveries.push((self.consumer_id.clone(), message));
        }
        Ok(())
    }
}

/// Never finishes a delivery. Consumers using it only stop by being aborted.
#[derive(Clone, Default)]
pub struct BlockingSink {
    entered: Arc<AtomicUsize>,
}

impl BlockingSink {
    /// Deliveries currently hanging.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for BlockingSink {
    async fn deliver(
        &self,
        _topic: &str,
        _partition: &Partition,
        _messages: Vec<Message>,
    ) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

// ── Recording notifier ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Start,
    Ok,
    Error(String),
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Recorded) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    /// Starts and outcomes must strictly alternate, beginning with a start.
    pub fn assert_paired(&self) {
        let events = self.events();
        let mut open = false;
        for (i, event) in events.iter().enumerate() {
            match event {
                Recorded::Start => {
                    assert!(!open, "start #{i} before previous cycle finished: {events:?}");
                    open = true;
                }
                Recorded::Ok | Recorded::Error(_) => {
                    assert!(open, "outcome #{i} without start: {events:?}");
                    open = false;
                }
            }
        }
    }
}

impl Notifier for RecordingNotifier {
    fn rebalance_start(&self, _group: &str) {
        self.events.lock().unwrap().push(Recorded::Start);
    }

    fn rebalance_ok(&self, _group: &str) {
        self.events.lock().unwrap().push(Recorded::Ok);
    }

    fn rebalance_error(&self, _group: &str, error: &Error) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Error(error.to_string()));
    }
}

// ── Members ─────────────────────────────────────────────────────

pub struct Member {
    pub consumer_id: String,
    pub coordinator: Arc<RebalanceCoordinator>,
    pub notifier: RecordingNotifier,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<()>>,
}

impl Member {
    pub fn owned(&self) -> Vec<Partition> {
        self.coordinator.owned_partitions().borrow().clone()
    }

    /// Graceful leave: stop consumers, release claims, deregister.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await.expect("coordinator task panicked")
    }
}

pub fn start_member(
    consumer_id: &str,
    coordination: Arc<MemoryCoordination>,
    broker: Arc<MemoryBroker>,
    sink: &CollectingSink,
    config: CoordinatorConfig,
) -> Member {
    start_member_with(consumer_id, coordination, broker, sink, config)
}

pub fn start_member_with(
    consumer_id: &str,
    coordination: Arc<dyn CoordinationClient>,
    messaging: Arc<dyn MessagingClient>,
    sink: &CollectingSink,
    config: CoordinatorConfig,
) -> Member {
    let sink = Arc::new(sink.for_member(consumer_id));
    start_member_with_sink(consumer_id, coordination, messaging, sink, config)
}

pub fn start_member_with_sink(
    consumer_id: &str,
    coordination: Arc<dyn CoordinationClient>,
    messaging: Arc<dyn MessagingClient>,
    sink: Arc<dyn MessageSink>,
    config: CoordinatorConfig,
) -> Member {
    let notifier = RecordingNotifier::default();
    let coordinator = Arc::new(RebalanceCoordinator::new(
        GroupState {
            group: GROUP.to_string(),
            topic: TOPIC.to_string(),
            consumer_id: consumer_id.to_string(),
        },
        config,
        coordination,
        messaging,
        sink,
        Arc::new(notifier.clone()),
    ));

    let cancel = CancellationToken::new();
    let task = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    Member {
        consumer_id: consumer_id.to_string(),
        coordinator,
        notifier,
        cancel,
        task,
    }
}
