use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, GetOptions, PutOptions, Txn, TxnOp, TxnOpResponse,
    TxnResponse, WatchOptions, WatchStream,
};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    /// Key prefix for all operations.
    /// e.g. "/group-consumer/" or "/test-{uuid}/"
    pub prefix: String,
}

/// Prefixed etcd client.
///
/// Provides the generic building blocks that domain-specific stores compose:
/// get, list, put, delete, watch, lease management, and conditional writes.
///
/// `Client` is `Clone` (wraps an inner `Arc`), so each method clones it cheaply.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    config: StoreConfig,
}

impl EtcdStore {
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        Ok(Self { client, config })
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    // ── Raw helpers ──────────────────────────────────────────────

    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.client.clone().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    /// Values of every key under `prefix`, in key order.
    pub async fn list_raw(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        Ok(resp.kvs().iter().map(|kv| kv.value().to_vec()).collect())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let options = DeleteOptions::new().with_prefix();
        self.client.clone().delete(prefix, Some(options)).await?;
        Ok(())
    }

    pub async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let options = WatchOptions::new().with_prefix();
        let stream = self.client.clone().watch(prefix, Some(options)).await?;
        Ok(stream)
    }

    // ── Conditional writes ───────────────────────────────────────

    /// Create `key` only if it does not exist yet (version == 0).
    ///
    /// Returns `None` when the key was created, or the value currently stored
    /// under `key` when someone else got there first. Two concurrent callers
    /// racing on the same key always see exactly one `None`.
    pub async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease_id: Option<i64>,
    ) -> Result<Option<Vec<u8>>> {
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, options)])
            .or_else(vec![TxnOp::get(key, None)]);

        let resp = self.txn(txn).await?;
        if resp.succeeded() {
            return Ok(None);
        }

        // The key may have vanished between the compare and the read; report
        // an empty holder so the caller still treats it as a conflict.
        let existing = resp
            .op_responses()
            .into_iter()
            .find_map(|op| match op {
                TxnOpResponse::Get(get) => get.kvs().first().map(|kv| kv.value().to_vec()),
                _ => None,
            })
            .unwrap_or_default();
        Ok(Some(existing))
    }

    /// Delete `key` only if its current value equals `expected`.
    pub async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::value(key, CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::delete(key, None)]);
        Ok(self.txn(txn).await?.succeeded())
    }

    /// Write `value` under `key` only while `guard_key` holds `expected`.
    pub async fn put_if_value(
        &self,
        guard_key: &str,
        expected: &str,
        key: &str,
        value: &str,
    ) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::value(guard_key, CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        Ok(self.txn(txn).await?.succeeded())
    }

    // ── Transactions ─────────────────────────────────────────────

    pub async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        Ok(self.client.clone().txn(txn).await?)
    }

    // ── Lease operations ─────────────────────────────────────────

    pub async fn grant_lease(&self, ttl: i64) -> Result<i64> {
        let resp = self.client.clone().lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    pub async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<(etcd_client::LeaseKeeper, etcd_client::LeaseKeepAliveStream)> {
        let (keeper, stream) = self.client.clone().lease_keep_alive(lease_id).await?;
        Ok((keeper, stream))
    }

    pub async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        self.client.clone().lease_revoke(lease_id).await?;
        Ok(())
    }

    // ── Cleanup ──────────────────────────────────────────────────

    pub async fn delete_all(&self) -> Result<()> {
        self.delete_prefix(&self.config.prefix).await
    }
}
