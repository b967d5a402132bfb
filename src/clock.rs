use std::collections::BTreeMap;

use crate::message::{NodeId, Value};

/// A per-node counter map establishing causal ordering between writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VectorClock(BTreeMap<NodeId, u64>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    Equal,
    Greater,
    Concurrent,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &NodeId) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Advance `node`'s coordinate to `seqno`. Rejects non-increasing
    /// sequence numbers: a clock regression is a fatal programming error,
    /// not a recoverable condition.
    pub fn update(&mut self, node: &NodeId, seqno: u64) -> anyhow::Result<()> {
        let current = self.get(node);
        anyhow::ensure!(
            seqno > current,
            "clock regression on {node:?}: {seqno} <= {current}"
        );
        self.0.insert(node.clone(), seqno);
        Ok(())
    }

    pub fn compare(&self, other: &Self) -> Comparison {
        let mut less = false;
        let mut greater = false;
        let nodes = self.0.keys().chain(other.0.keys());
        for node in nodes {
            let a = self.get(node);
            let b = other.get(node);
            if a < b {
                less = true
            } else if a > b {
                greater = true
            }
        }
        match (less, greater) {
            (false, false) => Comparison::Equal,
            (true, false) => Comparison::Less,
            (false, true) => Comparison::Greater,
            (true, true) => Comparison::Concurrent,
        }
    }

    /// Coordinate-wise maximum over a set of clocks.
    pub fn converge<'a>(clocks: impl IntoIterator<Item = &'a VectorClock>) -> VectorClock {
        let mut merged = BTreeMap::new();
        for clock in clocks {
            for (node, &seqno) in &clock.0 {
                let entry = merged.entry(node.clone()).or_insert(0);
                *entry = (*entry).max(seqno);
            }
        }
        VectorClock(merged)
    }

    /// Reduce a set of (value, clock) pairs to the causal frontier: equal
    /// values are merged (their clocks converged), then any pair whose
    /// clock is strictly dominated by another surviving pair is dropped.
    /// Idempotent: re-running on the result is a no-op.
    pub fn coalesce(pairs: Vec<(Value, VectorClock)>) -> Vec<(Value, VectorClock)> {
        let mut buckets: Vec<(Value, VectorClock)> = Vec::new();
        for (value, clock) in pairs {
            if let Some(existing) = buckets.iter_mut().find(|(v, _)| *v == value) {
                existing.1 = VectorClock::converge([&existing.1, &clock]);
            } else {
                buckets.push((value, clock));
            }
        }
        buckets
            .iter()
            .enumerate()
            .filter(|(i, (_, clock))| {
                !buckets
                    .iter()
                    .enumerate()
                    .any(|(j, (_, other))| *i != j && clock.compare(other) == Comparison::Less)
            })
            .map(|(_, pair)| pair.clone())
            .collect()
    }
}
