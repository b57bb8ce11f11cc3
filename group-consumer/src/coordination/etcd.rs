use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use assignment_coordination::store::EtcdStore;
use assignment_coordination::util::{now_seconds, run_lease_keepalive, validate_identifier};
use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{GetOptions, Txn, TxnOp, WatchStream};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{validate_partition, CoordinationClient, RegistrationHandle, SnapshotStream};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{ClaimOutcome, Partition, RegisteredConsumer};

/// etcd's default `--max-txn-ops`.
const MAX_TXN_OPS: usize = 128;

/// All etcd key patterns used by the group consumer.
///
/// ```text
/// {prefix}groups/{group}/consumers/{consumer_id}          (leased)
/// {prefix}groups/{group}/owners/{topic}/{addr}/{id}       (leased, value = owner id)
/// {prefix}groups/{group}/offsets/{topic}/{addr}/{id}      (value = next offset)
/// {prefix}topics/{topic}/partitions/{addr}/{id}
/// ```
enum StoreKey<'a> {
    Consumer { group: &'a str, consumer_id: &'a str },
    ConsumersPrefix(&'a str),
    Owner {
        group: &'a str,
        topic: &'a str,
        partition: &'a Partition,
    },
    Offset {
        group: &'a str,
        topic: &'a str,
        partition: &'a Partition,
    },
    Partition { topic: &'a str, partition: &'a Partition },
    PartitionsPrefix(&'a str),
}

impl StoreKey<'_> {
    fn resolve(&self, prefix: &str) -> String {
        match self {
            StoreKey::Consumer { group, consumer_id } => {
                format!("{prefix}groups/{group}/consumers/{consumer_id}")
            }
            StoreKey::ConsumersPrefix(group) => format!("{prefix}groups/{group}/consumers/"),
            StoreKey::Owner {
                group,
                topic,
                partition,
            } => format!(
                "{prefix}groups/{group}/owners/{topic}/{}/{}",
                partition.addr, partition.id
            ),
            StoreKey::Offset {
                group,
                topic,
                partition,
            } => format!(
                "{prefix}groups/{group}/offsets/{topic}/{}/{}",
                partition.addr, partition.id
            ),
            StoreKey::Partition { topic, partition } => format!(
                "{prefix}topics/{topic}/partitions/{}/{}",
                partition.addr, partition.id
            ),
            StoreKey::PartitionsPrefix(topic) => format!("{prefix}topics/{topic}/partitions/"),
        }
    }
}

/// etcd-backed coordination.
///
/// Each registration owns one lease. The registration key and every
/// ownership claim made by that member are attached to it, so a crashed
/// member's claims vanish when the lease expires.
pub struct EtcdCoordination {
    store: EtcdStore,
    leases: DashMap<(String, String), i64>,
    lease_ttl: i64,
    keepalive_interval: Duration,
}

impl EtcdCoordination {
    pub fn new(store: EtcdStore, lease_ttl: i64, keepalive_interval: Duration) -> Self {
        Self {
            store,
            leases: DashMap::new(),
            lease_ttl,
            keepalive_interval,
        }
    }

    /// Connect to the endpoints named in `config`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = EtcdStore::connect(config.store_config()).await?;
        Ok(Self::new(
            store,
            config.lease_ttl_secs,
            config.keepalive_interval(),
        ))
    }

    pub fn store(&self) -> &EtcdStore {
        &self.store
    }

    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(self.store.prefix())
    }

    fn lease_for(&self, group: &str, consumer_id: &str) -> Result<i64> {
        self.leases
            .get(&(group.to_string(), consumer_id.to_string()))
            .map(|l| *l)
            .ok_or_else(|| {
                Error::invalid_state(format!("consumer {consumer_id} is not registered in {group}"))
            })
    }

    /// Emit the current listing of `prefix`, then a fresh listing after every
    /// watch notification. The watch is opened before the first listing so no
    /// change can slip in between.
    async fn snapshot_stream<T: Send + 'static>(
        &self,
        prefix: String,
        decode: fn(Vec<Vec<u8>>) -> Result<T>,
    ) -> Result<SnapshotStream<T>> {
        struct WatchState {
            store: EtcdStore,
            prefix: String,
            stream: WatchStream,
            primed: bool,
        }

        let stream = self.store.watch(&prefix).await?;
        let state = WatchState {
            store: self.store.clone(),
            prefix,
            stream,
            primed: false,
        };

        let snapshots = futures::stream::try_unfold(state, move |mut st| async move {
            if st.primed {
                let resp = st.stream.message().await?.ok_or_else(|| {
                    Error::TransientCoordination(format!("watch on {} ended", st.prefix))
                })?;
                if resp.canceled() {
                    return Err(Error::TransientCoordination(format!(
                        "watch on {} cancelled: {}",
                        st.prefix,
                        resp.cancel_reason()
                    )));
                }
            }
            st.primed = true;
            let snapshot = decode(st.store.list_raw(&st.prefix).await?)?;
            Ok(Some((snapshot, st)))
        });

        Ok(snapshots.boxed())
    }
}

fn batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        out.push(items.by_ref().take(size).collect());
    }
    out
}

fn decode_consumers(values: Vec<Vec<u8>>) -> Result<Vec<String>> {
    let mut ids = values
        .iter()
        .map(|v| serde_json::from_slice::<RegisteredConsumer>(v).map(|c| c.consumer_id))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    ids.sort();
    Ok(ids)
}

fn decode_partitions(values: Vec<Vec<u8>>) -> Result<Vec<Partition>> {
    let mut partitions = values
        .iter()
        .map(|v| serde_json::from_slice::<Partition>(v))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    partitions.sort();
    Ok(partitions)
}

#[async_trait]
impl CoordinationClient for EtcdCoordination {
    async fn register_self(&self, group: &str, consumer_id: &str) -> Result<RegistrationHandle> {
        validate_identifier(group)?;
        validate_identifier(consumer_id)?;

        let lease_id = self.store.grant_lease(self.lease_ttl).await?;
        let key = self.key(StoreKey::Consumer { group, consumer_id });
        let record = RegisteredConsumer {
            consumer_id: consumer_id.to_string(),
            registered_at: now_seconds(),
        };
        let value = serde_json::to_string(&record)?;

        let conflict = self
            .store
            .create_if_absent(&key, &value, Some(lease_id))
            .await?;
        if conflict.is_some() {
            if let Err(e) = self.store.revoke_lease(lease_id).await {
                tracing::warn!(consumer_id, error = %e, "failed to revoke unused lease");
            }
            return Err(Error::invalid_state(format!(
                "consumer {consumer_id} is already registered in {group}"
            )));
        }

        self.leases
            .insert((group.to_string(), consumer_id.to_string()), lease_id);

        let lost = CancellationToken::new();
        let handle = RegistrationHandle::new(group, consumer_id, Some(lease_id), lost.clone());

        let store = self.store.clone();
        let interval = self.keepalive_interval;
        let shutdown = handle.shutdown_token();
        let id = consumer_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = run_lease_keepalive(store, lease_id, interval, shutdown).await {
                tracing::error!(consumer_id = %id, lease_id, error = %e, "registration lease lost");
                lost.cancel();
            }
        });

        tracing::info!(group, consumer_id, lease_id, "registered consumer");
        Ok(handle)
    }

    async fn deregister(&self, handle: &RegistrationHandle) -> Result<()> {
        handle.shutdown_token().cancel();
        self.leases.remove(&(
            handle.group().to_string(),
            handle.consumer_id().to_string(),
        ));

        let key = self.key(StoreKey::Consumer {
            group: handle.group(),
            consumer_id: handle.consumer_id(),
        });
        self.store.delete(&key).await?;
        // Revoking the lease also drops any claim still attached to it.
        if let Some(lease_id) = handle.lease_id() {
            self.store.revoke_lease(lease_id).await?;
        }
        tracing::info!(
            group = handle.group(),
            consumer_id = handle.consumer_id(),
            "deregistered consumer"
        );
        Ok(())
    }

    async fn watch_consumers(&self, group: &str) -> Result<SnapshotStream<Vec<String>>> {
        validate_identifier(group)?;
        let prefix = self.key(StoreKey::ConsumersPrefix(group));
        self.snapshot_stream(prefix, decode_consumers).await
    }

    async fn watch_partitions(&self, topic: &str) -> Result<SnapshotStream<Vec<Partition>>> {
        validate_identifier(topic)?;
        let prefix = self.key(StoreKey::PartitionsPrefix(topic));
        self.snapshot_stream(prefix, decode_partitions).await
    }

    async fn publish_partitions(&self, topic: &str, partitions: &[Partition]) -> Result<()> {
        validate_identifier(topic)?;
        for p in partitions {
            validate_partition(p)?;
        }

        let prefix = self.key(StoreKey::PartitionsPrefix(topic));
        let resp = self
            .store
            .client()
            .clone()
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let existing = resp
            .kvs()
            .iter()
            .map(|kv| Ok((kv.key_str()?.to_string(), kv.value().to_vec())))
            .collect::<Result<BTreeMap<String, Vec<u8>>>>()?;

        // Only new or changed keys are written.
        let mut wanted = BTreeSet::new();
        let mut ops = Vec::new();
        for partition in partitions {
            let key = self.key(StoreKey::Partition { topic, partition });
            let value = serde_json::to_string(partition)?;
            if existing.get(&key).map(Vec::as_slice) != Some(value.as_bytes()) {
                ops.push(TxnOp::put(key.as_str(), value, None));
            }
            wanted.insert(key);
        }
        for key in existing.keys().filter(|k| !wanted.contains(*k)) {
            ops.push(TxnOp::delete(key.as_str(), None));
        }

        // Batches apply in order: every put lands before the first delete.
        let changed = ops.len();
        for batch in batches(ops, MAX_TXN_OPS) {
            self.store.txn(Txn::new().and_then(batch)).await?;
        }
        tracing::info!(topic, count = partitions.len(), changed, "published partitions");
        Ok(())
    }

    async fn claim(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
    ) -> Result<ClaimOutcome> {
        validate_partition(partition)?;
        let lease_id = self.lease_for(group, consumer_id)?;
        let key = self.key(StoreKey::Owner {
            group,
            topic,
            partition,
        });

        match self
            .store
            .create_if_absent(&key, consumer_id, Some(lease_id))
            .await?
        {
            None => Ok(ClaimOutcome::Claimed),
            Some(existing) if existing == consumer_id.as_bytes() => Ok(ClaimOutcome::Claimed),
            Some(existing) => Ok(ClaimOutcome::Conflict {
                owner: String::from_utf8_lossy(&existing).into_owned(),
            }),
        }
    }

    async fn release(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
    ) -> Result<()> {
        let key = self.key(StoreKey::Owner {
            group,
            topic,
            partition,
        });
        if !self.store.delete_if_value(&key, consumer_id).await? {
            tracing::debug!(%partition, consumer_id, "release skipped, claim not held");
        }
        Ok(())
    }

    async fn read_checkpoint(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
    ) -> Result<Option<i64>> {
        let key = self.key(StoreKey::Offset {
            group,
            topic,
            partition,
        });
        match self.store.get_raw(&key).await? {
            None => Ok(None),
            Some(raw) => {
                let text = String::from_utf8_lossy(&raw);
                text.trim().parse::<i64>().map(Some).map_err(|_| {
                    Error::invalid_state(format!("corrupt checkpoint {text:?} for {partition}"))
                })
            }
        }
    }

    async fn write_checkpoint(
        &self,
        group: &str,
        topic: &str,
        partition: &Partition,
        consumer_id: &str,
        offset: i64,
    ) -> Result<()> {
        let owner_key = self.key(StoreKey::Owner {
            group,
            topic,
            partition,
        });
        let offset_key = self.key(StoreKey::Offset {
            group,
            topic,
            partition,
        });
        let written = self
            .store
            .put_if_value(&owner_key, consumer_id, &offset_key, &offset.to_string())
            .await?;
        if !written {
            return Err(Error::OwnershipLost(partition.clone()));
        }
        Ok(())
    }
}
