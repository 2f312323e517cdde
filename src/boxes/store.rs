//! Append-only arena for box storage.

use crate::boxes::{BoxRef, DomainPair};
use crate::error::SearchError;
use crate::interval::{FeatId, Interval};

const PAIR_SIZE: usize = std::mem::size_of::<DomainPair>();

/// Capacity of the first block, in pairs (~64 KiB).
const INITIAL_BLOCK_PAIRS: usize = 64 * 1024 / PAIR_SIZE;

/// Default memory ceiling: 4 GiB, matching common verification workloads.
pub const DEFAULT_MEM_CAPACITY: usize = 4 * 1024 * 1024 * 1024;

/// Arena of `(feature, interval)` pairs, organized in append-only blocks.
///
/// Blocks grow by doubling until the configured memory ceiling is approached,
/// at which point the next block is trimmed to whatever budget remains. A
/// commit that cannot fit fails with [`SearchError::OutOfMemory`]; the store
/// stays usable for reads.
///
/// A single scratch *workspace* is used to assemble a box before committing
/// it. The workspace is logically empty between engine steps; committing or
/// clearing it restores that state.
#[derive(Debug, Clone)]
pub struct BoxStore {
    blocks: Vec<Vec<DomainPair>>,
    workspace: Vec<DomainPair>,
    max_mem_bytes: usize,
}

impl Default for BoxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxStore {
    pub fn new() -> Self {
        Self::with_mem_capacity(DEFAULT_MEM_CAPACITY)
    }

    pub fn with_mem_capacity(max_mem_bytes: usize) -> Self {
        let first_cap = INITIAL_BLOCK_PAIRS.min(max_mem_bytes / PAIR_SIZE).max(1);
        Self {
            blocks: vec![Vec::with_capacity(first_cap)],
            workspace: Vec::new(),
            max_mem_bytes,
        }
    }

    /// Bytes currently reserved by all blocks.
    pub fn mem_used(&self) -> usize {
        self.blocks.iter().map(|b| b.capacity() * PAIR_SIZE).sum()
    }

    /// The configured ceiling in bytes.
    #[inline]
    pub fn mem_capacity(&self) -> usize {
        self.max_mem_bytes
    }

    pub fn set_mem_capacity(&mut self, max_mem_bytes: usize) {
        self.max_mem_bytes = max_mem_bytes;
    }

    /// Resolve a handle to its pair slice.
    #[inline]
    pub fn get(&self, r: BoxRef) -> &[DomainPair] {
        debug_assert!(!r.is_invalid(), "resolving an invalidated BoxRef");
        if r.is_empty() {
            return &[];
        }
        &self.blocks[r.block()][r.range()]
    }

    /// View of the workspace under construction.
    #[inline]
    pub fn workspace_box(&self) -> &[DomainPair] {
        &self.workspace
    }

    /// Discard the workspace without committing it.
    #[inline]
    pub fn clear_workspace(&mut self) {
        self.workspace.clear();
    }

    /// Fold the constraint of one `x < value` split into the workspace,
    /// intersecting with any constraint already present on the feature.
    pub fn refine_workspace(&mut self, feat: FeatId, split_value: f32, went_left: bool) {
        match self.workspace.iter_mut().find(|(f, _)| *f == feat) {
            Some((_, iv)) => *iv = iv.refine(split_value, went_left),
            None => {
                let iv = Interval::ALL.refine(split_value, went_left);
                self.workspace.push((feat, iv));
                // keep pairs sorted by feature id
                let mut i = self.workspace.len() - 1;
                while i > 0 && self.workspace[i - 1].0 > self.workspace[i].0 {
                    self.workspace.swap(i - 1, i);
                    i -= 1;
                }
            }
        }
    }

    /// Merge an external pair slice with one of this store's boxes into the
    /// workspace, intersecting on shared dimensions.
    ///
    /// Returns `false` (and clears the workspace) when some shared dimension
    /// intersects empty.
    pub fn combine_in_workspace(&mut self, a: &[DomainPair], b: BoxRef) -> bool {
        debug_assert!(self.workspace.is_empty(), "workspace not empty");
        let b = if b.is_empty() {
            [].as_slice()
        } else {
            &self.blocks[b.block()][b.range()]
        };
        merge_pairs(&mut self.workspace, a, b)
    }

    /// [`Self::combine_in_workspace`] for two boxes owned by this store.
    pub fn combine_refs_in_workspace(&mut self, a: BoxRef, b: BoxRef) -> bool {
        debug_assert!(self.workspace.is_empty(), "workspace not empty");
        fn slice_of(blocks: &[Vec<DomainPair>], r: BoxRef) -> &[DomainPair] {
            if r.is_empty() {
                &[]
            } else {
                &blocks[r.block()][r.range()]
            }
        }
        // split borrows: workspace is written, blocks only read
        let Self {
            blocks, workspace, ..
        } = self;
        merge_pairs(workspace, slice_of(blocks, a), slice_of(blocks, b))
    }

    /// Commit the workspace into the current block and clear it.
    ///
    /// An empty workspace commits to [`BoxRef::EMPTY`]. On out-of-memory the
    /// workspace is cleared as well, so the step boundary invariant holds.
    pub fn push_workspace(&mut self) -> Result<BoxRef, SearchError> {
        if self.workspace.is_empty() {
            return Ok(BoxRef::EMPTY);
        }
        let needed = self.workspace.len();
        let block_index = match self.block_with_capacity(needed) {
            Ok(i) => i,
            Err(e) => {
                self.workspace.clear();
                return Err(e);
            }
        };
        let block = &mut self.blocks[block_index];
        let start = block.len();
        block.extend_from_slice(&self.workspace);
        self.workspace.clear();
        Ok(BoxRef::new(block_index, start, needed))
    }

    /// Combine two boxes and commit the result.
    ///
    /// Returns `Ok(None)` when the boxes do not intersect.
    pub fn combine_and_push(
        &mut self,
        a: BoxRef,
        b: BoxRef,
    ) -> Result<Option<BoxRef>, SearchError> {
        if !self.combine_refs_in_workspace(a, b) {
            return Ok(None);
        }
        self.push_workspace().map(Some)
    }

    /// Copy an already-assembled pair slice into the store.
    pub fn push_pairs(&mut self, pairs: &[DomainPair]) -> Result<BoxRef, SearchError> {
        if pairs.is_empty() {
            return Ok(BoxRef::EMPTY);
        }
        let block_index = self.block_with_capacity(pairs.len())?;
        let block = &mut self.blocks[block_index];
        let start = block.len();
        block.extend_from_slice(pairs);
        Ok(BoxRef::new(block_index, start, pairs.len()))
    }

    /// Index of a block with at least `needed` free pairs, allocating a new
    /// block if the current one is exhausted. Blocks are never reallocated,
    /// which keeps committed [`BoxRef`]s stable.
    fn block_with_capacity(&mut self, needed: usize) -> Result<usize, SearchError> {
        let used = self.mem_used();
        // a lowered ceiling fails the next commit even if block space remains
        if used > self.max_mem_bytes {
            return Err(SearchError::OutOfMemory {
                needed: needed * PAIR_SIZE,
                capacity: self.max_mem_bytes,
            });
        }
        let last = self.blocks.last().expect("store has at least one block");
        if last.capacity() - last.len() >= needed {
            return Ok(self.blocks.len() - 1);
        }

        let budget_pairs = self.max_mem_bytes.saturating_sub(used) / PAIR_SIZE;
        // double the block size each time, unless the ceiling trims it
        let new_cap = budget_pairs.min(last.capacity() * 2);
        if new_cap < needed {
            return Err(SearchError::OutOfMemory {
                needed: needed * PAIR_SIZE,
                capacity: self.max_mem_bytes,
            });
        }
        self.blocks.push(Vec::with_capacity(new_cap));
        Ok(self.blocks.len() - 1)
    }
}

/// Two-finger merge of two sorted pair slices into `out`, intersecting shared
/// dimensions. Clears `out` and returns `false` on an empty intersection.
fn merge_pairs(out: &mut Vec<DomainPair>, a: &[DomainPair], b: &[DomainPair]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (fa, da) = a[i];
        let (fb, db) = b[j];
        match fa.cmp(&fb) {
            std::cmp::Ordering::Equal => {
                match da.intersect(&db) {
                    Some(iv) => out.push((fa, iv)),
                    None => {
                        out.clear();
                        return false;
                    }
                }
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(lo: f32, hi: f32) -> Interval {
        Interval::new(lo, hi)
    }

    #[test]
    fn refine_builds_sorted_workspace() {
        let mut store = BoxStore::new();
        store.refine_workspace(3, 1.0, true);
        store.refine_workspace(1, 0.5, false);
        store.refine_workspace(3, 0.25, false);

        let ws = store.workspace_box();
        assert_eq!(ws.len(), 2);
        assert_eq!(ws[0], (1, Interval::at_or_above(0.5)));
        assert_eq!(ws[1], (3, iv(0.25, 1.0)));
    }

    #[test]
    fn push_and_read_back() {
        let mut store = BoxStore::new();
        store.refine_workspace(0, 2.0, true);
        let r = store.push_workspace().unwrap();
        assert!(store.workspace_box().is_empty());
        assert_eq!(store.get(r), &[(0, Interval::below(2.0))]);
    }

    #[test]
    fn empty_workspace_pushes_empty_ref() {
        let mut store = BoxStore::new();
        let r = store.push_workspace().unwrap();
        assert!(r.is_empty());
        assert!(store.get(r).is_empty());
    }

    #[test]
    fn combine_intersects_shared_dims() {
        let mut store = BoxStore::new();
        let a = store.push_pairs(&[(0, iv(0.0, 2.0)), (2, iv(0.0, 1.0))]).unwrap();
        let b = store.push_pairs(&[(0, iv(1.0, 3.0)), (1, iv(5.0, 6.0))]).unwrap();

        let c = store.combine_and_push(a, b).unwrap().unwrap();
        assert_eq!(
            store.get(c),
            &[(0, iv(1.0, 2.0)), (1, iv(5.0, 6.0)), (2, iv(0.0, 1.0))]
        );
    }

    #[test]
    fn combine_reports_empty_intersection() {
        let mut store = BoxStore::new();
        let a = store.push_pairs(&[(0, iv(0.0, 1.0))]).unwrap();
        let b = store.push_pairs(&[(0, iv(2.0, 3.0))]).unwrap();
        assert_eq!(store.combine_and_push(a, b).unwrap(), None);
        assert!(store.workspace_box().is_empty());
    }

    #[test]
    fn combine_with_empty_box_copies_through() {
        let mut store = BoxStore::new();
        let a = store.push_pairs(&[(4, iv(0.0, 1.0))]).unwrap();
        let c = store.combine_and_push(a, BoxRef::EMPTY).unwrap().unwrap();
        assert_eq!(store.get(c), store.get(a));
    }

    #[test]
    fn refs_stay_valid_across_block_growth() {
        let mut store = BoxStore::new();
        let first = store.push_pairs(&[(0, iv(0.0, 1.0))]).unwrap();
        let mut refs = vec![first];
        for k in 0..INITIAL_BLOCK_PAIRS {
            let f = (k % 17) as FeatId;
            refs.push(store.push_pairs(&[(f, iv(0.0, 1.0 + k as f32))]).unwrap());
        }
        assert!(store.mem_used() > INITIAL_BLOCK_PAIRS * PAIR_SIZE);
        assert_eq!(store.get(first), &[(0, iv(0.0, 1.0))]);
        for (k, r) in refs[1..].iter().enumerate() {
            assert_eq!(store.get(*r), &[((k % 17) as FeatId, iv(0.0, 1.0 + k as f32))]);
        }
    }

    #[test]
    fn ceiling_fails_the_push_loudly() {
        let mut store = BoxStore::with_mem_capacity(PAIR_SIZE * 4);
        store.push_pairs(&[(0, iv(0.0, 1.0))]).unwrap();
        // a push that cannot fit under the ceiling must fail, not grow
        let pairs: Vec<DomainPair> = (0..8).map(|f| (f, iv(0.0, 1.0))).collect();
        let err = store.push_pairs(&pairs).unwrap_err();
        assert!(matches!(err, SearchError::OutOfMemory { .. }));
        // previously committed data is still readable
        assert_eq!(store.get(BoxRef::new(0, 0, 1)), &[(0, iv(0.0, 1.0))]);
    }
}
