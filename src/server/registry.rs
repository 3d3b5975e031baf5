//! Family membership registry: the set of peers this node currently knows.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Identity of a family member node, i.e. its peer-facing address.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeInfo {
    pub host: String,
    pub port: u16,
}

impl NodeInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeInfo {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Thread-safe membership registry. Self is inserted at creation and can
/// never be removed. The view is purely local to this node.
#[derive(Debug)]
pub struct FamilyRegistry {
    /// My own identity.
    me: NodeInfo,

    /// Known members, ordered by `(host, port)`.
    members: RwLock<BTreeSet<NodeInfo>>,
}

impl FamilyRegistry {
    /// Creates a new registry containing only myself.
    pub fn new(me: NodeInfo) -> Self {
        let members = BTreeSet::from([me.clone()]);
        FamilyRegistry {
            me,
            members: RwLock::new(members),
        }
    }

    /// Returns my own identity.
    pub fn me(&self) -> &NodeInfo {
        &self.me
    }

    /// Inserts a member. Returns true if it was not known before.
    pub fn add(&self, node: NodeInfo) -> bool {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node)
    }

    /// Merges a batch of members under a single lock acquisition, so that no
    /// snapshot can observe half of the batch. Returns the number of newly
    /// known members.
    pub fn add_all(&self, nodes: impl IntoIterator<Item = NodeInfo>) -> usize {
        let mut members =
            self.members.write().unwrap_or_else(PoisonError::into_inner);
        nodes
            .into_iter()
            .filter(|node| members.insert(node.clone()))
            .count()
    }

    /// Removes a member. Returns true if it was known. Removing myself is a
    /// no-op that returns false.
    pub fn remove(&self, node: &NodeInfo) -> bool {
        if *node == self.me {
            return false;
        }
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node)
    }

    /// Returns true if the node is currently a member.
    pub fn contains(&self, node: &NodeInfo) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node)
    }

    /// Number of known members, myself included.
    pub fn size(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns an owned, ordered copy of the membership as of one instant.
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn node(port: u16) -> NodeInfo {
        NodeInfo::new("127.0.0.1", port)
    }

    #[test]
    fn self_always_member() {
        let registry = FamilyRegistry::new(node(5555));
        assert_eq!(registry.snapshot(), vec![node(5555)]);
        assert!(!registry.remove(&node(5555)));
        assert!(registry.contains(&node(5555)));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn add_remove_idempotent() {
        let registry = FamilyRegistry::new(node(5555));
        assert!(registry.add(node(5557)));
        assert!(!registry.add(node(5557)));
        assert_eq!(registry.add_all(vec![node(5556), node(5557), node(5558)]), 2);
        assert_eq!(
            registry.snapshot(),
            vec![node(5555), node(5556), node(5557), node(5558)]
        );
        assert!(registry.remove(&node(5556)));
        assert!(!registry.remove(&node(5556)));
        assert_eq!(registry.snapshot(), vec![node(5555), node(5557), node(5558)]);
    }

    #[test]
    fn snapshot_is_independent() {
        let registry = FamilyRegistry::new(node(5555));
        registry.add(node(5556));
        let mut snap = registry.snapshot();
        snap.clear();
        snap.push(node(9999));
        assert_eq!(registry.snapshot(), vec![node(5555), node(5556)]);
    }

    #[test]
    fn removed_stays_removed_until_readded() {
        let registry = FamilyRegistry::new(node(5555));
        registry.add_all((5556..5560).map(node));
        registry.remove(&node(5557));
        for _ in 0..3 {
            registry.add(node(5559));
            registry.remove(&node(5558));
            assert!(!registry.snapshot().contains(&node(5557)));
        }
        registry.add(node(5557));
        assert!(registry.snapshot().contains(&node(5557)));
        assert!(!registry.snapshot().contains(&node(5558)));
    }

    #[test]
    fn concurrent_batches_atomic() {
        let registry = Arc::new(FamilyRegistry::new(node(5555)));
        let writers: Vec<_> = (0..4u16)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for round in 0..50u16 {
                        let base = 6000 + t * 1000 + round * 2;
                        registry.add_all(vec![node(base), node(base + 1)]);
                    }
                })
            })
            .collect();

        // every snapshot must hold whole pairs only
        for _ in 0..200 {
            let snap = registry.snapshot();
            assert!(snap.contains(&node(5555)));
            let others = snap.iter().filter(|n| n.port >= 6000);
            for n in others {
                let partner = if n.port % 2 == 0 { n.port + 1 } else { n.port - 1 };
                assert!(snap.contains(&node(partner)));
            }
        }

        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(registry.size(), 1 + 4 * 50 * 2);
    }
}
