use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{Assignment, Partition};

/// Trait for partition assignment strategies.
///
/// Every member of the group runs the strategy locally on its own view of the
/// membership, so implementations must be pure: the same inputs (in any
/// order) must produce the same assignment on every member.
pub trait AssignmentStrategy: Send + Sync {
    fn assign(&self, partitions: &[Partition], consumers: &[String]) -> Result<Assignment>;
}

/// Deals partitions out like cards: the i-th partition in canonical order
/// goes to the `i mod C`-th consumer in sorted order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinStrategy;

impl AssignmentStrategy for RoundRobinStrategy {
    fn assign(&self, partitions: &[Partition], consumers: &[String]) -> Result<Assignment> {
        assign_round_robin(partitions, consumers)
    }
}

pub fn assign_round_robin(partitions: &[Partition], consumers: &[String]) -> Result<Assignment> {
    let mut consumers: Vec<&String> = consumers.iter().collect();
    consumers.sort();
    consumers.dedup();
    if consumers.is_empty() {
        return Err(Error::NoConsumers);
    }

    let mut partitions: Vec<&Partition> = partitions.iter().collect();
    partitions.sort();
    partitions.dedup();

    let mut map: BTreeMap<String, Vec<Partition>> = consumers
        .iter()
        .map(|c| ((*c).clone(), Vec::new()))
        .collect();

    for (i, partition) in partitions.into_iter().enumerate() {
        let consumer = consumers[i % consumers.len()];
        if let Some(owned) = map.get_mut(consumer) {
            owned.push(partition.clone());
        }
    }

    Ok(Assignment::new(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(addrs: &[&str], per_addr: u32) -> Vec<Partition> {
        addrs
            .iter()
            .flat_map(|a| (0..per_addr).map(move |id| Partition::new(*a, id)))
            .collect()
    }

    fn consumers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c-{i}")).collect()
    }

    #[test]
    fn deals_in_canonical_order() {
        let p = vec![
            Partition::new("host2", 0),
            Partition::new("host1", 1),
            Partition::new("host1", 0),
        ];
        let a = assign_round_robin(&p, &["b".to_string(), "a".to_string()]).unwrap();
        assert_eq!(
            a.partitions_for("a"),
            &[Partition::new("host1", 0), Partition::new("host2", 0)]
        );
        assert_eq!(a.partitions_for("b"), &[Partition::new("host1", 1)]);
    }

    #[test]
    fn deterministic_regardless_of_input_order() {
        let p = parts(&["h1", "h2", "h3"], 4);
        let c = consumers(3);

        let mut p_rev = p.clone();
        p_rev.reverse();
        let mut c_rev = c.clone();
        c_rev.reverse();

        assert_eq!(
            assign_round_robin(&p, &c).unwrap(),
            assign_round_robin(&p_rev, &c_rev).unwrap()
        );
    }

    #[test]
    fn covers_every_partition_exactly_once_and_balances() {
        for n_parts in [0u32, 1, 5, 12, 31] {
            for n_cons in 1..=7 {
                let p = parts(&["host"], n_parts);
                let a = assign_round_robin(&p, &consumers(n_cons)).unwrap();

                let mut seen: Vec<Partition> =
                    a.iter().flat_map(|(_, v)| v.iter().cloned()).collect();
                seen.sort();
                let mut expected = p.clone();
                expected.sort();
                assert_eq!(seen, expected, "parts={n_parts} consumers={n_cons}");

                let sizes: Vec<usize> = a.iter().map(|(_, v)| v.len()).collect();
                let max = sizes.iter().max().copied().unwrap_or(0);
                let min = sizes.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1, "parts={n_parts} consumers={n_cons}");
            }
        }
    }

    #[test]
    fn remainder_goes_to_first_consumers() {
        let a = assign_round_robin(&parts(&["h"], 5), &consumers(3)).unwrap();
        assert_eq!(a.partitions_for("c-0").len(), 2);
        assert_eq!(a.partitions_for("c-1").len(), 2);
        assert_eq!(a.partitions_for("c-2").len(), 1);
    }

    #[test]
    fn more_consumers_than_partitions_leaves_some_idle() {
        let a = assign_round_robin(&parts(&["h"], 2), &consumers(4)).unwrap();
        assert_eq!(a.consumers().count(), 4);
        assert!(a.partitions_for("c-2").is_empty());
        assert!(a.partitions_for("c-3").is_empty());
    }

    #[test]
    fn duplicates_are_ignored() {
        let p = vec![Partition::new("h", 0), Partition::new("h", 0)];
        let c = vec!["c-0".to_string(), "c-0".to_string()];
        let a = assign_round_robin(&p, &c).unwrap();
        assert_eq!(a.partitions_for("c-0"), &[Partition::new("h", 0)]);
    }

    #[test]
    fn no_consumers_is_an_error() {
        let err = assign_round_robin(&parts(&["h"], 3), &[]).unwrap_err();
        assert!(matches!(err, Error::NoConsumers));
    }
}
