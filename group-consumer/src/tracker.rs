//! Membership tracking.
//!
//! Merges the consumer and partition watches into one [`Membership`]
//! snapshot and raises a rebalance trigger whenever it changes. Triggers go
//! through a single-slot channel: while one is pending, further triggers are
//! folded into it, so a burst of membership churn causes one rebalance that
//! sees the latest snapshot.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::CoordinationClient;
use crate::error::{Error, Result};
use crate::messaging::MessagingClient;
use crate::metrics_const::COALESCED_TRIGGERS_COUNTER;
use crate::types::{Membership, Partition};

/// Sending half of the rebalance trigger.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Request a rebalance. Never blocks; a request made while another is
    /// pending is merged with it.
    pub fn fire(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("rebalance already pending, coalescing trigger");
                counter!(COALESCED_TRIGGERS_COUNTER).increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(())) => {}
        }
    }
}

pub struct MembershipTracker {
    coordination: Arc<dyn CoordinationClient>,
    group: String,
    topic: String,
}

impl MembershipTracker {
    pub fn new(
        coordination: Arc<dyn CoordinationClient>,
        group: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            coordination,
            group: group.into(),
            topic: topic.into(),
        }
    }

    /// Open both watches and spawn the merge loop.
    ///
    /// The first trigger fires once both watches have produced a snapshot.
    /// The task ends with [`Error::FatalTracker`] if either watch breaks.
    pub async fn start(self, cancel: CancellationToken) -> Result<TrackerHandle> {
        let mut consumers = self.coordination.watch_consumers(&self.group).await?;
        let mut partitions = self.coordination.watch_partitions(&self.topic).await?;

        let (snapshot_tx, snapshot_rx) = watch::channel(Membership::default());
        let (trigger, triggers) = Trigger::new();
        let cancel = cancel.child_token();

        let task = {
            let trigger = trigger.clone();
            let cancel = cancel.clone();
            let group = self.group.clone();
            let topic = self.topic.clone();
            tokio::spawn(async move {
                let mut seen_consumers: Option<Vec<String>> = None;
                let mut seen_partitions: Option<Vec<Partition>> = None;
                let mut published = false;

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok::<(), Error>(()),
                        item = consumers.next() => {
                            seen_consumers = Some(unwrap_snapshot(item, "consumer")?);
                        }
                        item = partitions.next() => {
                            seen_partitions = Some(unwrap_snapshot(item, "partition")?);
                        }
                    }

                    let (Some(c), Some(p)) = (&seen_consumers, &seen_partitions) else {
                        continue;
                    };
                    let membership = Membership::new(c.clone(), p.clone());
                    if published && *snapshot_tx.borrow() == membership {
                        continue;
                    }

                    info!(
                        group = %group,
                        topic = %topic,
                        consumers = membership.consumers.len(),
                        partitions = membership.partitions.len(),
                        "membership changed"
                    );
                    snapshot_tx.send_replace(membership);
                    published = true;
                    trigger.fire();
                }
            })
        };

        Ok(TrackerHandle {
            snapshot: snapshot_rx,
            triggers,
            trigger,
            task,
            cancel,
        })
    }
}

fn unwrap_snapshot<T>(item: Option<Result<T>>, what: &str) -> Result<T> {
    match item {
        Some(Ok(snapshot)) => Ok(snapshot),
        Some(Err(e)) => Err(Error::FatalTracker(format!("{what} watch failed: {e}"))),
        None => Err(Error::FatalTracker(format!("{what} watch ended"))),
    }
}

/// A running tracker. Dropping it stops the merge loop.
pub struct TrackerHandle {
    pub(crate) snapshot: watch::Receiver<Membership>,
    pub(crate) triggers: mpsc::Receiver<()>,
    trigger: Trigger,
    pub(crate) task: JoinHandle<Result<()>>,
    cancel: CancellationToken,
}

impl TrackerHandle {
    /// Latest merged membership.
    pub fn snapshot(&self) -> Membership {
        self.snapshot.borrow().clone()
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger.clone()
    }

    pub async fn next_trigger(&mut self) -> Option<()> {
        self.triggers.recv().await
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Periodically copy the broker's partition list into the coordination
/// service so that every member's partition watch sees topic changes.
pub async fn run_topology_refresh(
    messaging: Arc<dyn MessagingClient>,
    coordination: Arc<dyn CoordinationClient>,
    topic: String,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<Vec<Partition>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let mut partitions = match messaging.list_partitions(&topic).await {
            Ok(p) => p,
            Err(e) => {
                warn!(topic = %topic, error = %e, "failed to list partitions");
                continue;
            }
        };
        partitions.sort();
        if last.as_ref() == Some(&partitions) {
            continue;
        }

        match coordination.publish_partitions(&topic, &partitions).await {
            Ok(()) => {
                info!(topic = %topic, count = partitions.len(), "refreshed topic partitions");
                last = Some(partitions);
            }
            Err(e) => warn!(topic = %topic, error = %e, "failed to publish partitions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;
    use crate::messaging::MemoryBroker;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn parts(n: u32) -> Vec<Partition> {
        (0..n).map(|i| Partition::new("host1:9092", i)).collect()
    }

    async fn wait_for_snapshot(handle: &TrackerHandle, pred: impl Fn(&Membership) -> bool) {
        let mut rx = handle.snapshot.clone();
        tokio::time::timeout(TIMEOUT, rx.wait_for(|m| pred(m)))
            .await
            .expect("timed out waiting for snapshot")
            .expect("tracker stopped");
    }

    #[tokio::test]
    async fn first_trigger_after_both_snapshots() {
        let coord = Arc::new(MemoryCoordination::new());
        let _reg = coord.register_self("g", "c-0").await.unwrap();
        coord.publish_partitions("t", &parts(3)).await.unwrap();

        let mut handle = MembershipTracker::new(coord.clone(), "g", "t")
            .start(CancellationToken::new())
            .await
            .unwrap();

        tokio::time::timeout(TIMEOUT, handle.next_trigger())
            .await
            .unwrap()
            .unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.consumers, vec!["c-0"]);
        assert_eq!(snapshot.partitions, parts(3));
    }

    #[tokio::test]
    async fn bursts_coalesce_into_one_trigger() {
        let coord = Arc::new(MemoryCoordination::new());
        coord.publish_partitions("t", &parts(2)).await.unwrap();
        let mut handle = MembershipTracker::new(coord.clone(), "g", "t")
            .start(CancellationToken::new())
            .await
            .unwrap();

        let mut regs = Vec::new();
        for i in 0..5 {
            regs.push(coord.register_self("g", &format!("c-{i}")).await.unwrap());
        }
        wait_for_snapshot(&handle, |m| m.consumers.len() == 5).await;

        handle.next_trigger().await.unwrap();
        assert!(handle.triggers.try_recv().is_err());
    }

    #[tokio::test]
    async fn broken_watch_is_fatal() {
        let coord = Arc::new(MemoryCoordination::new());
        let mut handle = MembershipTracker::new(coord.clone(), "g", "t")
            .start(CancellationToken::new())
            .await
            .unwrap();

        coord.disconnect();
        let result = tokio::time::timeout(TIMEOUT, &mut handle.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::FatalTracker(_))));
    }

    #[tokio::test]
    async fn topology_refresh_publishes_changes() {
        let coord = Arc::new(MemoryCoordination::new());
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("t", &parts(2));

        let cancel = CancellationToken::new();
        let refresher = tokio::spawn(run_topology_refresh(
            broker.clone(),
            coord.clone(),
            "t".to_string(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        let mut partitions = coord.watch_partitions("t").await.unwrap();
        let seen = tokio::time::timeout(TIMEOUT, async {
            loop {
                let snapshot = partitions.next().await.unwrap().unwrap();
                if snapshot.len() == 2 {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(seen, parts(2));

        cancel.cancel();
        refresher.await.unwrap().unwrap();
    }
}
