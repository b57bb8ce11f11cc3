//! Client-driven consumer groups on top of a coordination service.
//!
//! Every member registers itself, watches the group's membership and the
//! topic's partitions, and independently computes the same round-robin
//! assignment. Ownership of each partition is an ephemeral claim that must be
//! created conditionally, so two members can never consume one partition at
//! the same time. [`coordinator::RebalanceCoordinator`] drives the
//! stop → assign → claim → run cycle whenever the view changes.

pub mod assigner;
pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod messaging;
pub mod metrics_const;
pub mod notifier;
pub mod partition_consumer;
pub mod tracker;
pub mod types;

pub use assigner::{AssignmentStrategy, RoundRobinStrategy};
pub use coordinator::{CoordinatorConfig, RebalanceCoordinator};
pub use error::{Error, Result};
pub use notifier::{ChannelNotifier, LoggingNotifier, Notifier, RebalanceEvent};
pub use types::{
    Assignment, Checkpoint, GroupState, Message, OffsetPolicy, Partition, RebalanceState,
};
