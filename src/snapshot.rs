//! Point-in-time view of both relations, with consistency checking.
//!
//! A committed state is consistent when the closure relation is exactly the
//! strict transitive closure of the direct relation. [`ClosureSnapshot::verify`]
//! recomputes that closure in memory and reports the difference.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash_hex;
use crate::types::{ClosureEdge, DirectEdge, NodeKey};

/// Both relations as read inside one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureSnapshot<N: Ord> {
    /// Every direct edge.
    pub direct: BTreeSet<DirectEdge<N>>,
    /// Every closure row.
    pub closure: BTreeSet<ClosureEdge<N>>,
}

/// Difference between the stored closure and the one implied by the direct edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureDrift<N: Ord> {
    /// Implied rows that are not stored.
    pub missing: BTreeSet<ClosureEdge<N>>,
    /// Stored rows that no path justifies.
    pub extraneous: BTreeSet<ClosureEdge<N>>,
}

impl<N: Ord> ClosureDrift<N> {
    /// Whether the stored closure matched exactly.
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extraneous.is_empty()
    }
}

impl<N: NodeKey> ClosureSnapshot<N> {
    /// Build a snapshot from raw relations.
    pub fn new(direct: BTreeSet<DirectEdge<N>>, closure: BTreeSet<ClosureEdge<N>>) -> Self {
        Self { direct, closure }
    }

    /// Strict transitive closure of the direct edges.
    pub fn expected_closure(&self) -> BTreeSet<ClosureEdge<N>> {
        transitive_closure(&self.direct)
    }

    /// Compare the stored closure against the expected one.
    pub fn verify(&self) -> ClosureDrift<N> {
        let expected = self.expected_closure();
        ClosureDrift {
            missing: expected.difference(&self.closure).cloned().collect(),
            extraneous: self.closure.difference(&expected).cloned().collect(),
        }
    }

    /// Whether the closure is exactly the transitive closure of the direct edges.
    pub fn is_consistent(&self) -> bool {
        self.verify().is_empty()
    }

    /// Stored ancestors of `node`.
    pub fn ancestors_of(&self, node: &N) -> BTreeSet<N> {
        self.closure
            .iter()
            .filter(|row| &row.descendant == node)
            .map(|row| row.ancestor.clone())
            .collect()
    }

    /// Stored descendants of `node`.
    pub fn descendants_of(&self, node: &N) -> BTreeSet<N> {
        self.closure
            .iter()
            .filter(|row| &row.ancestor == node)
            .map(|row| row.descendant.clone())
            .collect()
    }
}

impl<N: NodeKey + Serialize> ClosureSnapshot<N> {
    /// xxh64 of the canonical JSON encoding, as 16 hex digits.
    ///
    /// Equal relations give equal fingerprints regardless of backend.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        canonical_hash_hex(self)
    }
}

/// Strict transitive closure of a set of direct edges.
///
/// Reflexive pairs are never produced, even if the input contains a cycle.
pub fn transitive_closure<N: NodeKey>(direct: &BTreeSet<DirectEdge<N>>) -> BTreeSet<ClosureEdge<N>> {
    let mut adjacency: BTreeMap<&N, Vec<&N>> = BTreeMap::new();
    for edge in direct {
        adjacency.entry(&edge.parent).or_default().push(&edge.child);
    }

    let mut closure = BTreeSet::new();
    for &start in adjacency.keys() {
        let mut seen: BTreeSet<&N> = BTreeSet::new();
        let mut stack: Vec<&N> = adjacency[start].clone();
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            if node != start {
                closure.insert(ClosureEdge::new(start.clone(), node.clone()));
            }
            if let Some(next) = adjacency.get(node) {
                stack.extend(next.iter().copied());
            }
        }
    }
    closure
}
