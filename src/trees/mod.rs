//! Tree data structures.

pub mod addtree;
pub mod leaf_iter;
pub mod node;
pub mod tree;

pub use addtree::AddTree;
pub use leaf_iter::LeafIter;
pub use node::SplitCondition;
pub use tree::{NodeId, Tree, TreeBuilder, ROOT};
