//! Core types for the closure kernel.

pub mod node;
pub mod edge;

pub use node::NodeKey;
pub use edge::{DirectEdge, ClosureEdge};
