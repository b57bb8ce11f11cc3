//! Partition consumer - one task per owned partition.
//!
//! Each consumer resolves its start offset, then fetches, delivers and
//! periodically checkpoints until asked to stop. A clean stop writes a final
//! checkpoint before releasing the ownership claim, so the next owner resumes
//! exactly where this one left off.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::CoordinationClient;
use crate::error::{Error, Result};
use crate::messaging::{MessageSink, MessagingClient};
use crate::metrics_const::{
    CHECKPOINT_WRITES_COUNTER, FETCH_ERRORS_COUNTER, MESSAGES_DELIVERED_COUNTER,
};
use crate::types::{Checkpoint, GroupState, OffsetPolicy, Partition};

/// Configuration for partition consumers
#[derive(Debug, Clone)]
pub struct PartitionConsumerConfig {
    /// Where to start when the partition has no checkpoint
    pub offset_policy: OffsetPolicy,
    pub fetch_max_messages: usize,
    /// Pause after a failed fetch or delivery
    pub fetch_backoff: Duration,
    /// Pause after a fetch that returned nothing
    pub idle_poll_interval: Duration,
    pub checkpoint_interval: Duration,
}

impl Default for PartitionConsumerConfig {
    fn default() -> Self {
        Self {
            offset_policy: OffsetPolicy::Earliest,
            fetch_max_messages: 500,
            fetch_backoff: Duration::from_millis(500),
            idle_poll_interval: Duration::from_millis(100),
            checkpoint_interval: Duration::from_secs(1),
        }
    }
}

/// Sent when a consumer task ends on its own, without being asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerExit {
    pub partition: Partition,
    pub epoch: u64,
}

#[derive(Debug)]
pub enum StopOutcome {
    /// Final checkpoint written and claim released.
    Clean(Checkpoint),
    Failed(Error),
    /// The consumer did not finish within the grace period and was aborted.
    Degraded,
}

pub struct PartitionConsumer {
    state: GroupState,
    partition: Partition,
    coordination: Arc<dyn CoordinationClient>,
    messaging: Arc<dyn MessagingClient>,
    sink: Arc<dyn MessageSink>,
    config: PartitionConsumerConfig,
}

impl PartitionConsumer {
    pub fn new(
        state: GroupState,
        partition: Partition,
        coordination: Arc<dyn CoordinationClient>,
        messaging: Arc<dyn MessagingClient>,
        sink: Arc<dyn MessageSink>,
        config: PartitionConsumerConfig,
    ) -> Self {
        Self {
            state,
            partition,
            coordination,
            messaging,
            sink,
            config,
        }
    }

    /// Spawn the consumer. If it ends before `stop` is requested, an exit
    /// notice tagged with `epoch` is sent on `exits`.
    pub fn spawn(
        self,
        epoch: u64,
        exits: mpsc::UnboundedSender<ConsumerExit>,
    ) -> PartitionConsumerHandle {
        let stop = CancellationToken::new();
        let partition = self.partition.clone();

        let task = {
            let stop = stop.clone();
            let partition = partition.clone();
            tokio::spawn(async move {
                let result = self.run(stop.clone()).await;
                if !stop.is_cancelled() && exits.send(ConsumerExit { partition, epoch }).is_err() {
                    debug!("coordinator gone, dropping consumer exit notice");
                }
                result
            })
        };

        PartitionConsumerHandle {
            partition,
            epoch,
            stop,
            task: Some(task),
        }
    }

    pub async fn run(self, stop: CancellationToken) -> Result<Checkpoint> {
        let (mut offset, mut committed) = match self.start_offset(&stop).await {
            Ok(Some(start)) => start,
            Ok(None) => {
                self.release().await?;
                return Err(Error::Cancelled);
            }
            Err(e) => return self.fail(e).await,
        };

        info!(
            partition = %self.partition,
            consumer_id = %self.state.consumer_id,
            offset,
            "partition consumer started"
        );
        let mut next_commit = Instant::now() + self.config.checkpoint_interval;

        'consume: loop {
            let fetched = tokio::select! {
                biased;
                _ = stop.cancelled() => break 'consume,
                r = self.messaging.fetch(
                    &self.state.topic,
                    &self.partition,
                    offset,
                    self.config.fetch_max_messages,
                ) => r,
            };

            match fetched {
                Ok(resp) if resp.messages.is_empty() => {
                    offset = offset.max(resp.next_offset);
                    if self.pause(&stop, self.config.idle_poll_interval).await {
                        break 'consume;
                    }
                }
                Ok(resp) => {
                    let count = resp.messages.len();
                    loop {
                        match self
                            .sink
                            .deliver(&self.state.topic, &self.partition, resp.messages.clone())
                            .await
                        {
                            Ok(()) => break,
                            Err(e) => {
                                warn!(
                                    partition = %self.partition,
                                    error = %e,
                                    "delivery failed, retrying"
                                );
                                if self.pause(&stop, self.config.fetch_backoff).await {
                                    break 'consume;
                                }
                            }
                        }
                    }
                    counter!(MESSAGES_DELIVERED_COUNTER).increment(count as u64);
                    offset = resp.next_offset;
                }
                Err(Error::PartitionGone(p)) => {
                    warn!(partition = %p, "partition disappeared");
                    return self.fail(Error::PartitionGone(p)).await;
                }
                Err(e) if e.is_transient() => {
                    counter!(FETCH_ERRORS_COUNTER, "reason" => "transient").increment(1);
                    warn!(partition = %self.partition, error = %e, "fetch failed, backing off");
                    if self.pause(&stop, self.config.fetch_backoff).await {
                        break 'consume;
                    }
                }
                Err(e) => {
                    counter!(FETCH_ERRORS_COUNTER, "reason" => "fatal").increment(1);
                    return self.fail(e).await;
                }
            }

            if Instant::now() >= next_commit {
                next_commit = Instant::now() + self.config.checkpoint_interval;
                if committed != Some(offset) {
                    match self.commit(offset).await {
                        Ok(()) => committed = Some(offset),
                        Err(e @ Error::OwnershipLost(_)) => return Err(e),
                        Err(e) => {
                            warn!(
                                partition = %self.partition,
                                error = %e,
                                "checkpoint failed, will retry"
                            )
                        }
                    }
                }
            }
        }

        if committed != Some(offset) {
            self.commit(offset).await?;
        }
        self.release().await?;
        info!(partition = %self.partition, offset, "partition consumer stopped");
        Ok(Checkpoint {
            partition: self.partition,
            offset,
        })
    }

    /// Returns the start offset and whether it came from a checkpoint, or
    /// `None` if stopped before it could be determined.
    async fn start_offset(&self, stop: &CancellationToken) -> Result<Option<(i64, Option<i64>)>> {
        loop {
            let resolved = match self
                .coordination
                .read_checkpoint(&self.state.group, &self.state.topic, &self.partition)
                .await
            {
                Ok(Some(offset)) => Ok((offset, Some(offset))),
                Ok(None) => self
                    .messaging
                    .resolve_offset(&self.state.topic, &self.partition, self.config.offset_policy)
                    .await
                    .map(|offset| (offset, None)),
                Err(e) => Err(e),
            };

            match resolved {
                Ok(start) => return Ok(Some(start)),
                Err(e) if e.is_transient() => {
                    warn!(
                        partition = %self.partition,
                        error = %e,
                        "cannot resolve start offset yet"
                    );
                    if self.pause(stop, self.config.fetch_backoff).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep for `duration`; returns true if stopped in the meantime.
    async fn pause(&self, stop: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = stop.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn commit(&self, offset: i64) -> Result<()> {
        let result = self
            .coordination
            .write_checkpoint(
                &self.state.group,
                &self.state.topic,
                &self.partition,
                &self.state.consumer_id,
                offset,
            )
            .await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(CHECKPOINT_WRITES_COUNTER, "outcome" => outcome).increment(1);
        result
    }

    async fn release(&self) -> Result<()> {
        self.coordination
            .release(
                &self.state.group,
                &self.state.topic,
                &self.partition,
                &self.state.consumer_id,
            )
            .await
    }

    async fn fail(&self, error: Error) -> Result<Checkpoint> {
        if let Err(e) = self.release().await {
            warn!(partition = %self.partition, error = %e, "failed to release claim");
        }
        Err(error)
    }
}

/// Owning handle for a spawned partition consumer.
pub struct PartitionConsumerHandle {
    partition: Partition,
    epoch: u64,
    stop: CancellationToken,
    task: Option<JoinHandle<Result<Checkpoint>>>,
}

impl PartitionConsumerHandle {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Ask the consumer to stop and wait up to `grace` for it to finish.
    pub async fn stop(mut self, grace: Duration) -> StopOutcome {
        self.stop.cancel();
        let Some(mut task) = self.task.take() else {
            return StopOutcome::Degraded;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(checkpoint))) => StopOutcome::Clean(checkpoint),
            Ok(Ok(Err(e))) => StopOutcome::Failed(e),
            Ok(Err(join_err)) => StopOutcome::Failed(Error::TaskFailed(join_err.to_string())),
            Err(_) => {
                warn!(partition = %self.partition, "consumer ignored stop, aborting");
                task.abort();
                StopOutcome::Degraded
            }
        }
    }

    /// Wait for a consumer that has already exited.
    pub async fn join(mut self) -> Result<Checkpoint> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::TaskFailed(e.to_string()))?,
            None => Err(Error::TaskFailed("consumer already joined".to_string())),
        }
    }
}

impl Drop for PartitionConsumerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
