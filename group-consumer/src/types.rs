use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One partition of a topic, identified by the broker address that leads it
/// and its numeric id.
///
/// Field order matters: the derived `Ord` sorts by `addr` first and `id`
/// second, which is the canonical order every member uses before assigning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub addr: String,
    pub id: u32,
}

impl Partition {
    pub fn new(addr: impl Into<String>, id: u32) -> Self {
        Self {
            addr: addr.into(),
            id,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.id)
    }
}

/// Identity of this member within its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub group: String,
    pub topic: String,
    pub consumer_id: String,
}

/// Mapping of consumer id to the partitions it must own.
///
/// Partition lists are kept in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment(BTreeMap<String, Vec<Partition>>);

impl Assignment {
    pub fn new(map: BTreeMap<String, Vec<Partition>>) -> Self {
        Self(map)
    }

    pub fn partitions_for(&self, consumer_id: &str) -> &[Partition] {
        self.0.get(consumer_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn owner_of(&self, partition: &Partition) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, parts)| parts.contains(partition))
            .map(|(consumer, _)| consumer.as_str())
    }

    pub fn consumers(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Partition>)> {
        self.0.iter()
    }

    pub fn partition_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

/// Last committed position for a partition: the next offset to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub partition: Partition,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    Idle,
    Stopping,
    Assigning,
    Claiming,
    Running,
    Error,
}

impl fmt::Display for RebalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebalanceState::Idle => "idle",
            RebalanceState::Stopping => "stopping",
            RebalanceState::Assigning => "assigning",
            RebalanceState::Claiming => "claiming",
            RebalanceState::Running => "running",
            RebalanceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Where to start a partition that has no checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetPolicy {
    #[default]
    Earliest,
    Latest,
}

impl FromStr for OffsetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "oldest" => Ok(OffsetPolicy::Earliest),
            "latest" | "newest" => Ok(OffsetPolicy::Latest),
            other => Err(format!("unknown offset policy {other:?}")),
        }
    }
}

impl fmt::Display for OffsetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetPolicy::Earliest => f.write_str("earliest"),
            OffsetPolicy::Latest => f.write_str("latest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Conflict { owner: String },
}

/// A consistent view of group members and topic partitions, both sorted and
/// free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub consumers: Vec<String>,
    pub partitions: Vec<Partition>,
}

impl Membership {
    pub fn new(mut consumers: Vec<String>, mut partitions: Vec<Partition>) -> Self {
        consumers.sort();
        consumers.dedup();
        partitions.sort();
        partitions.dedup();
        Self {
            consumers,
            partitions,
        }
    }

    pub fn contains_consumer(&self, consumer_id: &str) -> bool {
        self.consumers.binary_search_by(|c| c.as_str().cmp(consumer_id)).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResponse {
    pub messages: Vec<Message>,
    /// Offset to request next; equals the requested offset when nothing was
    /// returned.
    pub next_offset: i64,
}

/// Registration record stored under the member's ephemeral key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredConsumer {
    pub consumer_id: String,
    pub registered_at: i64,
}
