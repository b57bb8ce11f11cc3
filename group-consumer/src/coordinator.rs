//! Rebalance coordinator - the per-member control loop.
//!
//! One coordinator runs per group member. It owns the member's registration,
//! the membership tracker and every partition consumer, and drives the cycle:
//!
//! ```text
//! Idle ─trigger─▶ Stopping ─▶ Assigning ─▶ Claiming ─▶ Running
//!                                             │
//!                                             └─▶ Error ─▶ Idle
//! ```
//!
//! Every owned consumer has acknowledged its stop (final checkpoint written,
//! claim released) before the next assignment is computed, and the claim
//! phase is all-or-nothing: if any claim fails, the ones already acquired are
//! released and the whole phase is retried from a fresh snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assignment_coordination::util::backoff_with_jitter;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assigner::{AssignmentStrategy, RoundRobinStrategy};
use crate::coordination::{CoordinationClient, RegistrationHandle};
use crate::error::{Error, Result};
use crate::messaging::{MessageSink, MessagingClient};
use crate::metrics_const::{
    CLAIM_ATTEMPTS_COUNTER, CLAIM_RETRIES_COUNTER, CONSUMER_EXITS_COUNTER,
    OWNED_PARTITIONS_GAUGE, REBALANCE_CYCLES_COUNTER, REBALANCE_DURATION_HISTOGRAM,
    SESSION_RECOVERIES_COUNTER,
};
use crate::notifier::Notifier;
use crate::partition_consumer::{
    ConsumerExit, PartitionConsumer, PartitionConsumerConfig, PartitionConsumerHandle,
    StopOutcome,
};
use crate::tracker::{run_topology_refresh, MembershipTracker, TrackerHandle};
use crate::types::{ClaimOutcome, GroupState, Partition, RebalanceState};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub consumer: PartitionConsumerConfig,
    /// How long a partition consumer gets to acknowledge a stop before it is
    /// aborted.
    pub stop_timeout: Duration,
    /// Whole-phase claim attempts per rebalance cycle.
    pub claim_max_attempts: u32,
    pub claim_backoff_base: Duration,
    pub claim_backoff_max: Duration,
    /// Attempts to re-open the coordination session after a fatal failure.
    pub session_max_attempts: u32,
    /// Publish the broker's partition list at this interval. `None` leaves
    /// partition publication to someone else.
    pub topology_refresh_interval: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            consumer: PartitionConsumerConfig::default(),
            stop_timeout: Duration::from_secs(10),
            claim_max_attempts: 5,
            claim_backoff_base: Duration::from_millis(200),
            claim_backoff_max: Duration::from_secs(5),
            session_max_attempts: 10,
            topology_refresh_interval: None,
        }
    }
}

/// Registration plus everything that depends on it. Torn down and rebuilt
/// as a unit when the coordination session fails.
struct Session {
    registration: RegistrationHandle,
    tracker: TrackerHandle,
    refresher: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

/// Mutable state of a single `run` invocation.
struct Runtime {
    consumers: BTreeMap<Partition, PartitionConsumerHandle>,
    /// Bumped every time all consumers are stopped.
    epoch: u64,
    exits_tx: mpsc::UnboundedSender<ConsumerExit>,
    reclaim_tx: mpsc::UnboundedSender<Reclaim>,
    reclaim_attempts: BTreeMap<Partition, u32>,
    failed_cycles: u32,
}

/// Take back a partition whose consumer ended on its own. Dropped if the
/// epoch moved on in the meantime.
#[derive(Debug)]
struct Reclaim {
    partition: Partition,
    epoch: u64,
}

pub struct RebalanceCoordinator {
    state: GroupState,
    config: CoordinatorConfig,
    coordination: Arc<dyn CoordinationClient>,
    messaging: Arc<dyn MessagingClient>,
    sink: Arc<dyn MessageSink>,
    notifier: Arc<dyn Notifier>,
    strategy: Arc<dyn AssignmentStrategy>,
    state_tx: watch::Sender<RebalanceState>,
    owned_tx: watch::Sender<Vec<Partition>>,
}

impl RebalanceCoordinator {
    pub fn new(
        state: GroupState,
        config: CoordinatorConfig,
        coordination: Arc<dyn CoordinationClient>,
        messaging: Arc<dyn MessagingClient>,
        sink: Arc<dyn MessageSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state_tx, _) = watch::channel(RebalanceState::Idle);
        let (owned_tx, _) = watch::channel(Vec::new());
        Self {
            state,
            config,
            coordination,
            messaging,
            sink,
            notifier,
            strategy: Arc::new(RoundRobinStrategy),
            state_tx,
            owned_tx,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AssignmentStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn group_state(&self) -> &GroupState {
        &self.state
    }

    /// Current rebalance state, updated on every transition.
    pub fn state(&self) -> watch::Receiver<RebalanceState> {
        self.state_tx.subscribe()
    }

    /// Partitions with a running consumer, in canonical order.
    pub fn owned_partitions(&self) -> watch::Receiver<Vec<Partition>> {
        self.owned_tx.subscribe()
    }

    /// Run the control loop until `cancel` fires.
    ///
    /// On cancellation every consumer is stopped (checkpointing and releasing
    /// its claim) and the registration is removed. Returns an error only if
    /// the coordination session cannot be (re-)established.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();
        let (reclaim_tx, mut reclaim_rx) = mpsc::unbounded_channel();
        let mut rt = Runtime {
            consumers: BTreeMap::new(),
            epoch: 0,
            exits_tx,
            reclaim_tx,
            reclaim_attempts: BTreeMap::new(),
            failed_cycles: 0,
        };

        let mut session = match self.open_session_with_retry(&cancel).await {
            Ok(session) => session,
            Err(Error::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        };
        info!(
            group = %self.state.group,
            topic = %self.state.topic,
            consumer = %self.state.consumer_id,
            "coordinator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = &mut session.tracker.task => {
                    let cause = match res {
                        Ok(Ok(())) => Error::FatalTracker("membership tracker stopped".to_string()),
                        Ok(Err(e)) => e,
                        Err(e) => Error::FatalTracker(format!("membership tracker panicked: {e}")),
                    };
                    match self.recover(session, &mut rt, cause, &cancel).await {
                        Ok(next) => session = next,
                        Err(Error::Cancelled) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                _ = session.registration.lost() => {
                    let cause = Error::FatalTracker("registration lease lost".to_string());
                    match self.recover(session, &mut rt, cause, &cancel).await {
                        Ok(next) => session = next,
                        Err(Error::Cancelled) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                Some(exit) = exits_rx.recv() => self.handle_exit(&session, &mut rt, exit).await,
                Some(request) = reclaim_rx.recv() => self.reclaim(&session, &mut rt, request).await,
                Some(()) = session.tracker.triggers.recv() => {
                    self.rebalance(&session, &mut rt, &cancel).await;
                }
            }
        }

        info!(
            group = %self.state.group,
            consumer = %self.state.consumer_id,
            "coordinator shutting down"
        );
        self.stop_all(&mut rt).await;
        self.close_session(session).await;
        self.set_state(RebalanceState::Idle);
        Ok(())
    }

    // ── Rebalance cycle ──────────────────────────────────────────

    async fn rebalance(&self, session: &Session, rt: &mut Runtime, cancel: &CancellationToken) {
        let started = Instant::now();
        let group = self.state.group.as_str();

        self.set_state(RebalanceState::Stopping);
        self.notifier.rebalance_start(group);
        self.stop_all(rt).await;

        match self.claim_assignment(&session.tracker, rt, cancel).await {
            Ok(owned) => {
                info!(
                    group,
                    consumer = %self.state.consumer_id,
                    partitions = owned.len(),
                    "claimed assignment"
                );
                self.start_consumers(rt, owned);
                rt.failed_cycles = 0;
                self.set_state(RebalanceState::Running);
                counter!(REBALANCE_CYCLES_COUNTER, "outcome" => "ok").increment(1);
                self.notifier.rebalance_ok(group);
            }
            Err(e) => {
                self.set_state(RebalanceState::Error);
                counter!(REBALANCE_CYCLES_COUNTER, "outcome" => "error").increment(1);
                self.notifier.rebalance_error(group, &e);
                self.set_state(RebalanceState::Idle);
                if !matches!(e, Error::Cancelled) {
                    // Nothing is owned now; try again rather than wait for
                    // the next membership change.
                    rt.failed_cycles = rt.failed_cycles.saturating_add(1);
                    session.tracker.trigger().fire();
                }
            }
        }

        histogram!(REBALANCE_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
    }

    /// Claim every partition assigned to this member, or none of them.
    async fn claim_assignment(
        &self,
        tracker: &TrackerHandle,
        rt: &Runtime,
        cancel: &CancellationToken,
    ) -> Result<Vec<Partition>> {
        let max_attempts = self.config.claim_max_attempts.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 0..max_attempts {
            let step = attempt.saturating_add(rt.failed_cycles);
            if step > 0 {
                let delay = backoff_with_jitter(
                    step - 1,
                    self.config.claim_backoff_base,
                    self.config.claim_backoff_max,
                );
                debug!(attempt, ?delay, "backing off before claim phase");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(RebalanceState::Assigning);
            let membership = tracker.snapshot();
            if !membership.contains_consumer(&self.state.consumer_id) {
                last_error = Some(Error::TransientCoordination(format!(
                    "consumer {} not yet visible in group membership",
                    self.state.consumer_id
                )));
                continue;
            }
            let assignment = match self
                .strategy
                .assign(&membership.partitions, &membership.consumers)
            {
                Ok(a) => a,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            let mine = assignment.partitions_for(&self.state.consumer_id).to_vec();

            self.set_state(RebalanceState::Claiming);
            match self.claim_all(&mine).await {
                Ok(()) => return Ok(mine),
                Err(e) => {
                    counter!(CLAIM_RETRIES_COUNTER).increment(1);
                    warn!(
                        group = %self.state.group,
                        consumer = %self.state.consumer_id,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "claim phase failed, rolled back"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(Error::RebalanceExhausted {
            attempts: max_attempts,
            cause: Box::new(last_error.unwrap_or(Error::TransientCoordination(
                "claim phase never attempted".to_string(),
            ))),
        })
    }

    /// Claim all partitions concurrently. On any failure the claims that did
    /// succeed are released again and the first failure is returned.
    async fn claim_all(&self, partitions: &[Partition]) -> Result<()> {
        let GroupState {
            group,
            topic,
            consumer_id,
        } = &self.state;

        let results = join_all(
            partitions
                .iter()
                .map(|p| self.coordination.claim(group, topic, p, consumer_id)),
        )
        .await;

        let mut acquired = Vec::new();
        let mut failure: Option<Error> = None;
        for (partition, result) in partitions.iter().zip(results) {
            match result {
                Ok(ClaimOutcome::Claimed) => {
                    counter!(CLAIM_ATTEMPTS_COUNTER, "outcome" => "claimed").increment(1);
                    acquired.push(partition);
                }
                Ok(ClaimOutcome::Conflict { owner }) => {
                    counter!(CLAIM_ATTEMPTS_COUNTER, "outcome" => "conflict").increment(1);
                    if failure.is_none() {
                        failure = Some(Error::ClaimConflict {
                            partition: partition.clone(),
                            owner,
                        });
                    }
                }
                Err(e) => {
                    counter!(CLAIM_ATTEMPTS_COUNTER, "outcome" => "error").increment(1);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        let Some(failure) = failure else {
            return Ok(());
        };
        for partition in acquired {
            self.release_claim(partition).await;
        }
        Err(failure)
    }

    fn start_consumers(&self, rt: &mut Runtime, partitions: Vec<Partition>) {
        rt.reclaim_attempts.clear();
        for partition in partitions {
            self.spawn_consumer(rt, partition);
        }
        self.publish_owned(rt);
    }

    fn spawn_consumer(&self, rt: &mut Runtime, partition: Partition) {
        let consumer = PartitionConsumer::new(
            self.state.clone(),
            partition.clone(),
            self.coordination.clone(),
            self.messaging.clone(),
            self.sink.clone(),
            self.config.consumer.clone(),
        );
        let handle = consumer.spawn(rt.epoch, rt.exits_tx.clone());
        rt.consumers.insert(partition, handle);
    }

    /// Stop every running consumer and wait for the acknowledgements.
    /// Claims of consumers that did not stop cleanly are released here.
    async fn stop_all(&self, rt: &mut Runtime) {
        // Pending reclaims belong to the old epoch and are discarded.
        rt.epoch += 1;
        if rt.consumers.is_empty() {
            return;
        }
        let grace = self.config.stop_timeout;
        let handles = std::mem::take(&mut rt.consumers);
        let outcomes = join_all(handles.into_values().map(|handle| async move {
            let partition = handle.partition().clone();
            (partition, handle.stop(grace).await)
        }))
        .await;
        self.publish_owned(rt);

        for (partition, outcome) in outcomes {
            match outcome {
                StopOutcome::Clean(checkpoint) => {
                    counter!(CONSUMER_EXITS_COUNTER, "outcome" => "clean").increment(1);
                    debug!(%partition, offset = checkpoint.offset, "partition consumer stopped");
                }
                StopOutcome::Failed(e) => {
                    counter!(CONSUMER_EXITS_COUNTER, "outcome" => "failed").increment(1);
                    warn!(%partition, error = %e, "partition consumer failed while stopping");
                    self.release_claim(&partition).await;
                }
                StopOutcome::Degraded => {
                    counter!(CONSUMER_EXITS_COUNTER, "outcome" => "degraded").increment(1);
                    warn!(%partition, timeout = ?grace, "partition consumer stop timed out");
                    self.release_claim(&partition).await;
                }
            }
        }
    }

    /// A consumer ended without being stopped. Its siblings keep running and
    /// the partition is reclaimed after a backoff.
    async fn handle_exit(&self, session: &Session, rt: &mut Runtime, exit: ConsumerExit) {
        let current = rt
            .consumers
            .get(&exit.partition)
            .is_some_and(|h| h.epoch() == exit.epoch);
        if !current {
            return;
        }
        let Some(handle) = rt.consumers.remove(&exit.partition) else {
            return;
        };
        self.publish_owned(rt);

        match handle.join().await {
            Ok(checkpoint) => {
                counter!(CONSUMER_EXITS_COUNTER, "outcome" => "clean").increment(1);
                info!(
                    partition = %exit.partition,
                    offset = checkpoint.offset,
                    "partition consumer finished"
                );
            }
            Err(e) => {
                counter!(CONSUMER_EXITS_COUNTER, "outcome" => "failed").increment(1);
                warn!(
                    partition = %exit.partition,
                    error = %e,
                    "partition consumer exited, other partitions keep running"
                );
            }
        }
        self.schedule_reclaim(session, rt, exit.partition);
    }

    fn schedule_reclaim(&self, session: &Session, rt: &mut Runtime, partition: Partition) {
        let attempt = rt.reclaim_attempts.entry(partition.clone()).or_insert(0);
        let delay = backoff_with_jitter(
            *attempt,
            self.config.claim_backoff_base,
            self.config.claim_backoff_max,
        );
        *attempt = attempt.saturating_add(1);
        debug!(%partition, ?delay, "scheduling partition reclaim");

        let request = Reclaim {
            partition,
            epoch: rt.epoch,
        };
        let reclaim_tx = rt.reclaim_tx.clone();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if reclaim_tx.send(request).is_err() {
                        debug!("coordinator gone, dropping reclaim");
                    }
                }
            }
        });
    }

    /// Claim a single partition back if the current view still assigns it
    /// to this member. Retries with backoff while someone else holds it.
    async fn reclaim(&self, session: &Session, rt: &mut Runtime, request: Reclaim) {
        let Reclaim { partition, epoch } = request;
        if epoch != rt.epoch || rt.consumers.contains_key(&partition) {
            return;
        }

        let membership = session.tracker.snapshot();
        let still_mine = membership.contains_consumer(&self.state.consumer_id)
            && self
                .strategy
                .assign(&membership.partitions, &membership.consumers)
                .is_ok_and(|a| a.partitions_for(&self.state.consumer_id).contains(&partition));
        if !still_mine {
            info!(%partition, "partition no longer assigned here, not reclaiming");
            return;
        }

        let GroupState {
            group,
            topic,
            consumer_id,
        } = &self.state;
        match self.coordination.claim(group, topic, &partition, consumer_id).await {
            Ok(ClaimOutcome::Claimed) => {
                counter!(CLAIM_ATTEMPTS_COUNTER, "outcome" => "claimed").increment(1);
                info!(%partition, consumer = %consumer_id, "reclaimed partition");
                self.spawn_consumer(rt, partition);
                self.publish_owned(rt);
            }
            Ok(ClaimOutcome::Conflict { owner }) => {
                counter!(CLAIM_ATTEMPTS_COUNTER, "outcome" => "conflict").increment(1);
                debug!(%partition, owner = %owner, "partition still held elsewhere");
                self.schedule_reclaim(session, rt, partition);
            }
            Err(e) => {
                counter!(CLAIM_ATTEMPTS_COUNTER, "outcome" => "error").increment(1);
                warn!(%partition, error = %e, "failed to reclaim partition");
                self.schedule_reclaim(session, rt, partition);
            }
        }
    }

    async fn release_claim(&self, partition: &Partition) {
        if let Err(e) = self
            .coordination
            .release(
                &self.state.group,
                &self.state.topic,
                partition,
                &self.state.consumer_id,
            )
            .await
        {
            warn!(%partition, error = %e, "failed to release claim");
        }
    }

    // ── Session management ───────────────────────────────────────

    async fn open_session(&self, cancel: &CancellationToken) -> Result<Session> {
        let registration = self
            .coordination
            .register_self(&self.state.group, &self.state.consumer_id)
            .await?;

        let session_cancel = cancel.child_token();
        let tracker = MembershipTracker::new(
            self.coordination.clone(),
            self.state.group.clone(),
            self.state.topic.clone(),
        )
        .start(session_cancel.clone())
        .await;
        let tracker = match tracker {
            Ok(tracker) => tracker,
            Err(e) => {
                if let Err(dereg) = self.coordination.deregister(&registration).await {
                    warn!(error = %dereg, "failed to deregister after tracker start failure");
                }
                return Err(e);
            }
        };

        let refresher = self.config.topology_refresh_interval.map(|interval| {
            tokio::spawn(run_topology_refresh(
                self.messaging.clone(),
                self.coordination.clone(),
                self.state.topic.clone(),
                interval,
                session_cancel.clone(),
            ))
        });

        Ok(Session {
            registration,
            tracker,
            refresher,
            cancel: session_cancel,
        })
    }

    async fn open_session_with_retry(&self, cancel: &CancellationToken) -> Result<Session> {
        let max_attempts = self.config.session_max_attempts.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = backoff_with_jitter(
                    attempt - 1,
                    self.config.claim_backoff_base,
                    self.config.claim_backoff_max,
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            match self.open_session(cancel).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(
                        group = %self.state.group,
                        consumer = %self.state.consumer_id,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "failed to open coordination session"
                    );
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!(group = %self.state.group, error = %cause, "giving up on coordination session");
        Err(Error::FatalTracker(format!(
            "could not open coordination session after {max_attempts} attempts: {cause}"
        )))
    }

    /// Tear everything down after a fatal session failure and start over.
    async fn recover(
        &self,
        session: Session,
        rt: &mut Runtime,
        cause: Error,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let group = self.state.group.as_str();
        error!(
            group,
            consumer = %self.state.consumer_id,
            error = %cause,
            "coordination session failed"
        );
        counter!(SESSION_RECOVERIES_COUNTER).increment(1);

        self.set_state(RebalanceState::Stopping);
        self.notifier.rebalance_start(group);
        self.stop_all(rt).await;
        self.set_state(RebalanceState::Error);
        counter!(REBALANCE_CYCLES_COUNTER, "outcome" => "error").increment(1);
        self.notifier.rebalance_error(group, &cause);

        self.close_session(session).await;
        self.set_state(RebalanceState::Idle);

        let session = self.open_session_with_retry(cancel).await?;
        info!(group, consumer = %self.state.consumer_id, "coordination session re-established");
        session.tracker.trigger().fire();
        Ok(session)
    }

    async fn close_session(&self, mut session: Session) {
        session.cancel.cancel();
        if let Some(refresher) = session.refresher.take() {
            refresher.abort();
        }
        if !session.registration.is_lost() {
            if let Err(e) = self.coordination.deregister(&session.registration).await {
                warn!(consumer = %self.state.consumer_id, error = %e, "failed to deregister");
            }
        }
    }

    // ── Observability ────────────────────────────────────────────

    fn set_state(&self, next: RebalanceState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(
                consumer = %self.state.consumer_id,
                from = %previous,
                to = %next,
                "rebalance state transition"
            );
        }
    }

    fn publish_owned(&self, rt: &Runtime) {
        let owned: Vec<Partition> = rt.consumers.keys().cloned().collect();
        gauge!(OWNED_PARTITIONS_GAUGE).set(owned.len() as f64);
        self.owned_tx.send_replace(owned);
    }
}
