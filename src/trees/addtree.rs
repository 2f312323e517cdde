//! Additive tree ensembles.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::error::ModelError;
use crate::interval::FeatId;
use crate::trees::tree::Tree;

/// An additive ensemble: a sequence of trees whose outputs are summed with a
/// base score.
///
/// Every tree carries the same number of leaf values; the base score has one
/// entry per leaf-value slot. The ensemble is read-only once handed to a
/// search session.
#[derive(Debug, Clone)]
pub struct AddTree {
    trees: Vec<Tree>,
    base_scores: Vec<f32>,
}

impl AddTree {
    /// Create an empty ensemble with the given number of leaf values.
    pub fn new(n_leaf_values: usize) -> Self {
        assert!(n_leaf_values >= 1, "ensemble needs at least one leaf value");
        Self {
            trees: Vec::new(),
            base_scores: vec![0.0; n_leaf_values],
        }
    }

    /// Set the base scores (one per leaf-value slot).
    pub fn with_base_scores(mut self, base_scores: Vec<f32>) -> Self {
        assert_eq!(base_scores.len(), self.base_scores.len());
        self.base_scores = base_scores;
        self
    }

    /// Append a tree, checking the leaf-value arity matches.
    pub fn add_tree(&mut self, tree: Tree) -> Result<(), ModelError> {
        if tree.num_leaf_values() != self.num_leaf_values() {
            return Err(ModelError::LeafArityMismatch {
                tree: self.trees.len(),
                got: tree.num_leaf_values(),
                expected: self.num_leaf_values(),
            });
        }
        self.trees.push(tree);
        Ok(())
    }

    /// Number of trees.
    #[inline]
    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Number of values per leaf.
    #[inline]
    pub fn num_leaf_values(&self) -> usize {
        self.base_scores.len()
    }

    /// Base score of one leaf-value slot.
    #[inline]
    pub fn base_score(&self, slot: usize) -> f32 {
        self.base_scores[slot]
    }

    /// All base scores.
    #[inline]
    pub fn base_scores(&self) -> &[f32] {
        &self.base_scores
    }

    /// Access a tree by index.
    #[inline]
    pub fn tree(&self, index: usize) -> &Tree {
        &self.trees[index]
    }

    /// Iterate over the trees.
    pub fn trees(&self) -> impl Iterator<Item = &Tree> {
        self.trees.iter()
    }

    /// Total node count over all trees.
    pub fn num_nodes(&self) -> usize {
        self.trees.iter().map(|t| t.num_nodes()).sum()
    }

    /// Total leaf count over all trees.
    pub fn num_leaves(&self) -> usize {
        self.trees.iter().map(|t| t.num_leaves()).sum()
    }

    /// Evaluate the ensemble on a single row: `base + sum of tree outputs`.
    pub fn eval_row(&self, row: &[f32]) -> Vec<f32> {
        let mut out = self.base_scores.clone();
        for tree in &self.trees {
            tree.eval(row, &mut out);
        }
        out
    }

    /// Evaluate a batch of rows in parallel.
    pub fn eval_batch(&self, rows: &[&[f32]]) -> Vec<Vec<f32>> {
        rows.par_iter().map(|row| self.eval_row(row)).collect()
    }

    /// Map feature id to the sorted, deduplicated split values used on it.
    pub fn get_splits(&self) -> BTreeMap<FeatId, Vec<f32>> {
        let mut splits: BTreeMap<FeatId, Vec<f32>> = BTreeMap::new();
        for tree in &self.trees {
            for node in 0..tree.num_nodes() as u32 {
                if !tree.is_leaf(node) {
                    let cond = tree.split(node);
                    splits.entry(cond.feat).or_default().push(cond.value);
                }
            }
        }
        for values in splits.values_mut() {
            values.sort_by(f32::total_cmp);
            values.dedup();
        }
        splits
    }

    /// Extract a single-class ensemble for leaf-value slot `c`.
    pub fn make_singleclass(&self, c: usize) -> AddTree {
        assert!(c < self.num_leaf_values(), "slot out of range");
        AddTree {
            trees: self.trees.iter().map(|t| t.extract_slot(c)).collect(),
            base_scores: vec![self.base_scores[c]],
        }
    }

    /// Negate all leaf values and base scores: minimizing this ensemble is
    /// maximizing the negation.
    pub fn negate_leaf_values(&self) -> AddTree {
        AddTree {
            trees: self.trees.iter().map(|t| t.map_leaf_values(|v| -v)).collect(),
            base_scores: self.base_scores.iter().map(|b| -b).collect(),
        }
    }

    /// Shift each tree's leaf values so they are non-negative, compensating in
    /// the base score. The ensemble output is unchanged; relaxed search scores
    /// of partial selections become meaningful to compare.
    ///
    /// Only defined for single-slot ensembles.
    pub fn neutralize_negative_leaf_values(&self) -> AddTree {
        assert_eq!(self.num_leaf_values(), 1);
        let mut base = self.base_scores[0];
        let mut trees = Vec::with_capacity(self.trees.len());
        for tree in &self.trees {
            let offset = tree.min_leaf_value().min(0.0);
            base += offset;
            trees.push(tree.map_leaf_values(|v| v - offset));
        }
        AddTree {
            trees,
            base_scores: vec![base],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_approx_eq;
    use crate::trees::tree::TreeBuilder;

    fn stump(feat: FeatId, split: f32, left: f32, right: f32) -> Tree {
        let mut b = TreeBuilder::new(1);
        b.add_split(feat, split, 1, 2);
        b.add_scalar_leaf(left);
        b.add_scalar_leaf(right);
        b.build().unwrap()
    }

    fn two_tree_ensemble() -> AddTree {
        let mut at = AddTree::new(1).with_base_scores(vec![0.5]);
        at.add_tree(stump(0, 0.0, -1.0, 1.0)).unwrap();
        at.add_tree(stump(0, 0.0, 2.0, -2.0)).unwrap();
        at
    }

    #[test]
    fn eval_sums_trees_and_base() {
        let at = two_tree_ensemble();
        // x0 < 0: 0.5 - 1 + 2 = 1.5
        assert_approx_eq!(at.eval_row(&[-1.0])[0], 1.5, 1e-6);
        // x0 >= 0: 0.5 + 1 - 2 = -0.5
        assert_approx_eq!(at.eval_row(&[1.0])[0], -0.5, 1e-6);
    }

    #[test]
    fn eval_batch_matches_rows() {
        let at = two_tree_ensemble();
        let rows: Vec<&[f32]> = vec![&[-1.0], &[1.0], &[0.0]];
        let batch = at.eval_batch(&rows);
        for (row, out) in rows.iter().zip(&batch) {
            assert_eq!(out, &at.eval_row(row));
        }
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let mut at = AddTree::new(2);
        let err = at.add_tree(stump(0, 0.0, 1.0, 2.0)).unwrap_err();
        assert!(matches!(
            err,
            ModelError::LeafArityMismatch { got: 1, expected: 2, .. }
        ));
    }

    #[test]
    fn get_splits_sorted_unique() {
        let mut at = AddTree::new(1);
        at.add_tree(stump(0, 1.0, 0.0, 0.0)).unwrap();
        at.add_tree(stump(0, -1.0, 0.0, 0.0)).unwrap();
        at.add_tree(stump(0, 1.0, 0.0, 0.0)).unwrap();
        at.add_tree(stump(3, 0.25, 0.0, 0.0)).unwrap();

        let splits = at.get_splits();
        assert_eq!(splits[&0], vec![-1.0, 1.0]);
        assert_eq!(splits[&3], vec![0.25]);
    }

    #[test]
    fn neutralize_preserves_outputs() {
        let at = two_tree_ensemble();
        let neutral = at.neutralize_negative_leaf_values();

        for x in [-2.0f32, -0.5, 0.0, 0.5, 2.0] {
            assert_approx_eq!(
                at.eval_row(&[x])[0],
                neutral.eval_row(&[x])[0],
                1e-5
            );
        }
        // all shifted leaf values are non-negative
        for tree in neutral.trees() {
            tree.visit_leaves(|id| assert!(tree.leaf_value(id, 0) >= 0.0));
        }
    }

    #[test]
    fn singleclass_extraction() {
        let mut b = TreeBuilder::new(3);
        b.add_split(0, 0.0, 1, 2);
        b.add_leaf(&[1.0, 2.0, 3.0]);
        b.add_leaf(&[4.0, 5.0, 6.0]);
        let mut at = AddTree::new(3).with_base_scores(vec![0.1, 0.2, 0.3]);
        at.add_tree(b.build().unwrap()).unwrap();

        let c1 = at.make_singleclass(1);
        assert_eq!(c1.num_leaf_values(), 1);
        assert_approx_eq!(c1.eval_row(&[-1.0])[0], 2.2, 1e-6);
        assert_approx_eq!(c1.eval_row(&[1.0])[0], 5.2, 1e-6);
    }

    #[test]
    fn negation_flips_outputs() {
        let at = two_tree_ensemble();
        let neg = at.negate_leaf_values();
        for x in [-1.0f32, 1.0] {
            assert_approx_eq!(neg.eval_row(&[x])[0], -at.eval_row(&[x])[0], 1e-6);
        }
    }
}
