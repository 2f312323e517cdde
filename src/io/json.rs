//! JSON representation of additive tree ensembles.
//!
//! The schema mirrors the in-memory data model: an ensemble is a base-score
//! vector plus a list of trees, each tree a list of node records in id order.
//!
//! ```json
//! {
//!   "base_scores": [0.5],
//!   "trees": [
//!     { "nodes": [
//!       { "kind": "split", "feat": 0, "value": 0.5, "left": 1, "right": 2 },
//!       { "kind": "leaf", "values": [1.0] },
//!       { "kind": "leaf", "values": [2.0] }
//!     ] }
//!   ]
//! }
//! ```
//!
//! Every structural invariant (dense ids, binary internal nodes, matching
//! leaf arity, finite split values) is validated on read; a file that loads
//! successfully always yields a usable [`AddTree`].

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::trees::{AddTree, Tree, TreeBuilder};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum NodeRecord {
    Split {
        feat: u32,
        value: f32,
        left: u32,
        right: u32,
    },
    Leaf {
        values: Vec<f32>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeRecord {
    nodes: Vec<NodeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnsembleRecord {
    base_scores: Vec<f32>,
    trees: Vec<TreeRecord>,
}

/// Parse an ensemble from a JSON string.
pub fn addtree_from_json(json: &str) -> Result<AddTree, ModelError> {
    let record: EnsembleRecord = serde_json::from_str(json)?;
    convert_ensemble(record)
}

/// Parse an ensemble from a reader.
pub fn addtree_from_reader<R: std::io::Read>(reader: R) -> Result<AddTree, ModelError> {
    let record: EnsembleRecord = serde_json::from_reader(reader)?;
    convert_ensemble(record)
}

/// Serialize an ensemble to a JSON string.
pub fn addtree_to_json(at: &AddTree) -> Result<String, ModelError> {
    Ok(serde_json::to_string(&to_record(at))?)
}

/// Serialize an ensemble to a writer.
pub fn addtree_to_writer<W: std::io::Write>(at: &AddTree, writer: W) -> Result<(), ModelError> {
    Ok(serde_json::to_writer(writer, &to_record(at))?)
}

fn convert_ensemble(record: EnsembleRecord) -> Result<AddTree, ModelError> {
    let n_leaf_values = record.base_scores.len().max(1);
    let mut at = AddTree::new(n_leaf_values).with_base_scores(if record.base_scores.is_empty() {
        vec![0.0]
    } else {
        record.base_scores
    });
    for (tree_index, tree_record) in record.trees.into_iter().enumerate() {
        let tree = convert_tree(tree_record, n_leaf_values)
            .map_err(|e| e.with_tree(tree_index))?;
        at.add_tree(tree)?;
    }
    Ok(at)
}

fn convert_tree(record: TreeRecord, n_leaf_values: usize) -> Result<Tree, ModelError> {
    let mut builder = TreeBuilder::new(n_leaf_values);
    for (node_index, node) in record.nodes.iter().enumerate() {
        match node {
            NodeRecord::Split {
                feat,
                value,
                left,
                right,
            } => {
                if !value.is_finite() {
                    return Err(ModelError::InvalidSplitValue {
                        tree: 0,
                        node: node_index,
                        value: *value,
                    });
                }
                builder.add_split(*feat, *value, *left, *right);
            }
            NodeRecord::Leaf { values } => {
                builder.add_leaf(values);
            }
        }
    }
    builder.build()
}

fn to_record(at: &AddTree) -> EnsembleRecord {
    let trees = at
        .trees()
        .map(|tree| {
            let nodes = (0..tree.num_nodes() as u32)
                .map(|node| {
                    if tree.is_leaf(node) {
                        NodeRecord::Leaf {
                            values: tree.leaf_values(node).to_vec(),
                        }
                    } else {
                        let cond = tree.split(node);
                        NodeRecord::Split {
                            feat: cond.feat,
                            value: cond.value,
                            left: tree.left(node),
                            right: tree.right(node),
                        }
                    }
                })
                .collect();
            TreeRecord { nodes }
        })
        .collect();
    EnsembleRecord {
        base_scores: at.base_scores().to_vec(),
        trees,
    }
}
