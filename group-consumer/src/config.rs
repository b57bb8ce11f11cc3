use std::time::Duration;

use assignment_coordination::store::StoreConfig;
use envconfig::Envconfig;

use crate::coordinator::CoordinatorConfig;
use crate::partition_consumer::PartitionConsumerConfig;
use crate::types::{GroupState, OffsetPolicy};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "/group-consumer/")]
    pub etcd_prefix: String,

    #[envconfig(default = "15")]
    pub lease_ttl_secs: i64,

    #[envconfig(default = "5")]
    pub keepalive_interval_secs: u64,

    // ── Group membership ────────────────────────────────────────────
    #[envconfig(default = "default-group")]
    pub consumer_group: String,

    #[envconfig(default = "events")]
    pub topic: String,

    #[envconfig(default = "consumer-0")]
    pub consumer_id: String,

    // ── Rebalancing ─────────────────────────────────────────────────
    #[envconfig(default = "10000")]
    pub stop_timeout_ms: u64,

    #[envconfig(default = "5")]
    pub claim_max_attempts: u32,

    #[envconfig(default = "200")]
    pub claim_backoff_base_ms: u64,

    #[envconfig(default = "5000")]
    pub claim_backoff_max_ms: u64,

    #[envconfig(default = "10")]
    pub session_max_attempts: u32,

    /// Zero disables topology refresh.
    #[envconfig(default = "0")]
    pub topology_refresh_interval_secs: u64,

    // ── Consuming ───────────────────────────────────────────────────
    #[envconfig(default = "earliest")]
    pub offset_policy: OffsetPolicy,

    #[envconfig(default = "1000")]
    pub checkpoint_interval_ms: u64,

    #[envconfig(default = "500")]
    pub fetch_max_messages: usize,

    #[envconfig(default = "500")]
    pub fetch_backoff_ms: u64,

    #[envconfig(default = "100")]
    pub idle_poll_ms: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            endpoints: self.etcd_endpoint_list(),
            prefix: self.etcd_prefix.clone(),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn group_state(&self) -> GroupState {
        GroupState {
            group: self.consumer_group.clone(),
            topic: self.topic.clone(),
            consumer_id: self.consumer_id.clone(),
        }
    }

    pub fn topology_refresh_interval(&self) -> Option<Duration> {
        (self.topology_refresh_interval_secs > 0)
            .then(|| Duration::from_secs(self.topology_refresh_interval_secs))
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            consumer: PartitionConsumerConfig {
                offset_policy: self.offset_policy,
                fetch_max_messages: self.fetch_max_messages,
                fetch_backoff: Duration::from_millis(self.fetch_backoff_ms),
                idle_poll_interval: Duration::from_millis(self.idle_poll_ms),
                checkpoint_interval: Duration::from_millis(self.checkpoint_interval_ms),
            },
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            claim_max_attempts: self.claim_max_attempts,
            claim_backoff_base: Duration::from_millis(self.claim_backoff_base_ms),
            claim_backoff_max: Duration::from_millis(self.claim_backoff_max_ms),
            session_max_attempts: self.session_max_attempts,
            topology_refresh_interval: self.topology_refresh_interval(),
        }
    }
}
