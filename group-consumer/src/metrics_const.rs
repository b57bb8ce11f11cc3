// ==== Rebalance metrics ====
/// Counter for rebalance cycles, labelled with outcome: ok/error
pub const REBALANCE_CYCLES_COUNTER: &str = "group_consumer_rebalance_cycles_total";

/// Histogram for the duration of a full stop-assign-claim-start cycle
pub const REBALANCE_DURATION_HISTOGRAM: &str = "group_consumer_rebalance_duration_seconds";

/// Counter for claim attempts, labelled with outcome: claimed/conflict/error
pub const CLAIM_ATTEMPTS_COUNTER: &str = "group_consumer_claim_attempts_total";

/// Counter for claim phases that were rolled back and retried
pub const CLAIM_RETRIES_COUNTER: &str = "group_consumer_claim_retries_total";

/// Gauge for the number of partitions currently owned by this member
pub const OWNED_PARTITIONS_GAUGE: &str = "group_consumer_owned_partitions";

/// Counter for coordination session teardowns triggered by fatal errors
pub const SESSION_RECOVERIES_COUNTER: &str = "group_consumer_session_recoveries_total";

/// Counter for rebalance triggers dropped because one was already pending
pub const COALESCED_TRIGGERS_COUNTER: &str = "group_consumer_coalesced_triggers_total";

// ==== Partition consumer metrics ====
/// Counter for messages handed to the sink
pub const MESSAGES_DELIVERED_COUNTER: &str = "group_consumer_messages_delivered_total";

/// Counter for failed fetches, labelled with reason
pub const FETCH_ERRORS_COUNTER: &str = "group_consumer_fetch_errors_total";

/// Counter for checkpoint writes, labelled with outcome: ok/error
pub const CHECKPOINT_WRITES_COUNTER: &str = "group_consumer_checkpoint_writes_total";

/// Counter for partition consumers that ended, labelled with outcome: clean/failed/degraded
pub const CONSUMER_EXITS_COUNTER: &str = "group_consumer_partition_consumer_exits_total";
