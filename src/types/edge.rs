//! Edge types for the closure kernel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immediate parent → child relationship.
///
/// Derived `Ord` gives the canonical ordering: parent, then child.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirectEdge<N> {
    /// Parent node (source).
    pub parent: N,
    /// Child node (target).
    pub child: N,
}

impl<N> DirectEdge<N> {
    /// Create a new direct edge.
    pub fn new(parent: N, child: N) -> Self {
        Self { parent, child }
    }
}

impl<N: PartialEq> DirectEdge<N> {
    /// True when the edge points a node at itself.
    pub fn is_self_loop(&self) -> bool {
        self.parent == self.child
    }
}

impl<N: Clone> DirectEdge<N> {
    /// The closure pair this edge contributes on its own.
    pub fn to_closure(&self) -> ClosureEdge<N> {
        ClosureEdge::new(self.parent.clone(), self.child.clone())
    }
}

impl<N: fmt::Debug> fmt::Display for DirectEdge<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {:?}", self.parent, self.child)
    }
}

/// Ancestor → descendant pair implied by one or more directed paths.
///
/// Derived `Ord` gives the canonical ordering: ancestor, then descendant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClosureEdge<N> {
    /// Ancestor node.
    pub ancestor: N,
    /// Descendant node.
    pub descendant: N,
}

impl<N> ClosureEdge<N> {
    /// Create a new closure edge.
    pub fn new(ancestor: N, descendant: N) -> Self {
        Self { ancestor, descendant }
    }
}

impl<N: PartialEq> ClosureEdge<N> {
    /// True for the reflexive pair `(n, n)`, which is never stored.
    pub fn is_reflexive(&self) -> bool {
        self.ancestor == self.descendant
    }
}

impl<N: fmt::Debug> fmt::Display for ClosureEdge<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ~> {:?}", self.ancestor, self.descendant)
    }
}

impl<N> From<(N, N)> for ClosureEdge<N> {
    fn from((ancestor, descendant): (N, N)) -> Self {
        Self::new(ancestor, descendant)
    }
}

impl<N> From<(N, N)> for DirectEdge<N> {
    fn from((parent, child): (N, N)) -> Self {
        Self::new(parent, child)
    }
}
