//! Consistent-hash ring over runner addresses

use sha2::{Digest, Sha256};

/// Default virtual nodes per runner
pub const DEFAULT_VIRTUAL_NODES: usize = 64;

/// Hash ring with virtual nodes
///
/// A key maps to a point on the ring; walking clockwise from that point
/// yields every node exactly once, in a preference order that only shifts
/// locally when membership changes.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Sorted virtual-node positions
    ring: Vec<(u64, usize)>,
    nodes: Vec<String>,
}

impl HashRing {
    pub fn new(nodes: Vec<String>, virtual_nodes: usize) -> Self {
        let virtual_nodes = virtual_nodes.max(1);
        let mut ring = Vec::with_capacity(nodes.len() * virtual_nodes);
        for (idx, node) in nodes.iter().enumerate() {
            for vn in 0..virtual_nodes {
                let key = format!("{}#{}", node, vn);
                ring.push((hash_bytes(key.as_bytes()), idx));
            }
        }
        // Ties resolve by node index so the order is stable for a given input
        ring.sort_unstable();
        Self { ring, nodes }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node indices in preference order for `key`
    pub fn walk(&self, key: &str) -> Vec<usize> {
        if self.ring.is_empty() {
            return Vec::new();
        }

        let hash = hash_bytes(key.as_bytes());
        let start = self.ring.partition_point(|&(h, _)| h < hash);

        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        for offset in 0..self.ring.len() {
            let (_, idx) = self.ring[(start + offset) % self.ring.len()];
            if !seen[idx] {
                seen[idx] = true;
                order.push(idx);
                if order.len() == self.nodes.len() {
                    break;
                }
            }
        }
        order
    }

    /// Addresses in preference order for `key`
    pub fn candidates(&self, key: &str) -> Vec<&str> {
        self.walk(key)
            .into_iter()
            .map(|idx| self.nodes[idx].as_str())
            .collect()
    }
}

fn hash_bytes(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
