use std::collections::HashSet;

use crate::{crypto::DigestHash, message::NodeId};

/// A node's position on the ring: its name and which of its `T` virtual
/// replicas this is.
#[derive(Hash)]
struct NodePosition<'a> {
    name: &'a str,
    repeat: u32,
}

#[derive(Hash)]
struct KeyPosition<'a> {
    key: &'a str,
}

fn position_of<T: DigestHash>(value: &T) -> u64 {
    let digest = value.sha256();
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Consistent hash ring: every node owns `T` positions, derived
/// deterministically from `(name, repeat-index)`, so the ring is a pure
/// function of the node set and `T`.
#[derive(Debug, Clone)]
pub struct Ring {
    // sorted by position; ties broken by insertion order (stable sort)
    positions: Vec<(u64, NodeId)>,
}

impl Ring {
    pub fn build(nodes: &[NodeId], t: u32) -> Self {
        let mut positions = Vec::with_capacity(nodes.len() * t as usize);
        for node in nodes {
            for repeat in 0..t {
                let pos = position_of(&NodePosition {
                    name: node.as_str(),
                    repeat,
                });
                positions.push((pos, node.clone()));
            }
        }
        positions.sort_by_key(|(pos, _)| *pos);
        Self { positions }
    }

    /// Walk clockwise from `hash(key)`, collecting up to `n` distinct
    /// non-avoided node identities into `preferred`, and up to `n` identities
    /// that were skipped because they're in `avoid` into `avoided` (in the
    /// order encountered). Duplicate identities (repeat positions of a node
    /// already seen) are silently skipped either way.
    pub fn find_nodes(&self, key: &str, n: usize, avoid: &[NodeId]) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut preferred = Vec::new();
        let mut avoided = Vec::new();
        if self.positions.is_empty() || n == 0 {
            return (preferred, avoided);
        }

        let avoid_set: HashSet<&NodeId> = avoid.iter().collect();
        let mut seen = HashSet::new();

        let start = position_of(&KeyPosition { key });
        let start_idx = self.positions.partition_point(|(pos, _)| *pos < start);
        let len = self.positions.len();

        for i in 0..len {
            if preferred.len() >= n {
                break;
            }
            let (_, node) = &self.positions[(start_idx + i) % len];
            if !seen.insert(node.clone()) {
                continue;
            }
            if avoid_set.contains(node) {
                if avoided.len() < n {
                    avoided.push(node.clone());
                }
                continue;
            }
            preferred.push(node.clone());
        }

        (preferred, avoided)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    #[test]
    fn find_nodes_is_deterministic() {
        let ids = nodes(&["a", "b", "c", "d", "e"]);
        let ring = Ring::build(&ids, 10);
        let (p1, a1) = ring.find_nodes("some-key", 3, &[]);
        let (p2, a2) = ring.find_nodes("some-key", 3, &[]);
        assert_eq!(p1, p2);
        assert_eq!(a1, a2);
    }

    #[test]
    fn find_nodes_returns_distinct_identities() {
        let ids = nodes(&["a", "b", "c", "d", "e"]);
        let ring = Ring::build(&ids, 10);
        let (preferred, _) = ring.find_nodes("some-key", 3, &[]);
        assert_eq!(preferred.len(), 3);
        let unique: HashSet<_> = preferred.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn find_nodes_skips_avoided() {
        let ids = nodes(&["a", "b", "c", "d", "e"]);
        let ring = Ring::build(&ids, 10);
        let (preferred_full, _) = ring.find_nodes("some-key", 5, &[]);
        let avoid = vec![preferred_full[0].clone()];
        let (preferred, avoided) = ring.find_nodes("some-key", 3, &avoid);
        assert!(!preferred.contains(&avoid[0]));
        assert_eq!(avoided, avoid);
    }

    #[test]
    fn find_nodes_caps_at_available_nodes() {
        let ids = nodes(&["a", "b"]);
        let ring = Ring::build(&ids, 10);
        let (preferred, _) = ring.find_nodes("some-key", 5, &[]);
        assert_eq!(preferred.len(), 2);
    }
}
