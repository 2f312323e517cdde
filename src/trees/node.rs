//! Split conditions for decision nodes.

use crate::interval::FeatId;

/// Split condition of an internal node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitCondition {
    /// Feature index to split on
    pub feat: FeatId,
    /// Threshold value (go left if feature < threshold)
    pub value: f32,
}

impl SplitCondition {
    pub fn new(feat: FeatId, value: f32) -> Self {
        Self { feat, value }
    }

    /// Evaluate which direction to go for a feature value.
    /// Returns true for left, false for right.
    #[inline]
    pub fn go_left(&self, feature_value: f32) -> bool {
        feature_value < self.value
    }
}
