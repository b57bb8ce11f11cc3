use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::EtcdStore;

/// Validate that an identifier is safe for use in etcd key paths.
///
/// Identifiers (group names, topic names, consumer ids) are interpolated into
/// etcd key paths. Without validation, a name like `../owners/x` could write
/// to arbitrary keys.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::InvalidState(
            "identifier must be 1-128 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidState(format!(
            "identifier {name:?} contains invalid characters (only alphanumeric, dash, underscore, dot allowed)"
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidState(format!("identifier {name:?} is reserved")));
    }
    Ok(())
}

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Exponential backoff capped at `max`, with the upper half randomized.
///
/// `attempt` counts from zero. The result always lies in
/// `[min(base * 2^attempt, max) / 2, min(base * 2^attempt, max)]`.
pub fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let ceiling = base.saturating_mul(1u32 << attempt.min(20)).min(max);
    let floor = ceiling / 2;
    let spread = (ceiling - floor).as_millis() as u64;
    if spread == 0 {
        return ceiling;
    }
    floor + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Keep `lease_id` alive until `cancel` fires.
///
/// Returns an error when etcd stops acknowledging keepalives; anything keyed
/// on the lease disappears shortly after.
pub async fn run_lease_keepalive(
    store: EtcdStore,
    lease_id: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut keeper, mut stream) = store.keep_alive(lease_id).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {
                keeper.keep_alive().await?;
                match stream.message().await? {
                    Some(resp) if resp.ttl() > 0 => {}
                    _ => return Err(Error::LeaseLost),
                }
            }
        }
    }
}
