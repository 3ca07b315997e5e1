//! Graph fingerprints for change detection.
//!
//! Fingerprints cover declared inputs (with output references in their
//! logical form), options and edges, so the same program produces the same
//! fingerprint on every run regardless of the values providers return.

use sha2::{Digest, Sha256};

use crate::graph::DependencyGraph;
use crate::resource::ResourceNode;

/// Hasher for dependency graph fingerprints.
#[derive(Debug, Default)]
pub struct GraphHasher;

impl GraphHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a whole graph.
    #[must_use]
    pub fn hash_graph(&self, graph: &DependencyGraph) -> String {
        let mut hasher = Sha256::new();

        for (index, node) in graph.nodes().iter().enumerate() {
            hasher.update(self.hash_node(node).as_bytes());
            for dep in graph.dependencies(index) {
                hasher.update(graph.node(dep).name.as_bytes());
            }
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of one declared resource.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        let mut hasher = Sha256::new();

        hasher.update(node.name.as_bytes());
        hasher.update(node.type_token().as_bytes());

        // BTreeMap iteration keeps inputs sorted by name.
        for (key, value) in node.declared_inputs() {
            hasher.update(key.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }

        let mut depends_on = node.options.depends_on.clone();
        depends_on.sort_unstable();
        for name in depends_on {
            hasher.update(name.as_bytes());
        }
        hasher.update(if node.options.protect { [1u8] } else { [0u8] });
        hasher.update(format!("{:?}", node.replace_order()).as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
