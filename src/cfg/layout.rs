//! Function layout: the linear order in which basic blocks are emitted.
//!
//! The layout is the single source of truth for fall-through relationships and for
//! forward/backward branch direction. Reordering passes replace the whole order atomically via
//! [`FunctionLayout::update`]; everything else queries it.
//!
//! A layout may be split into fragments (hot/cold). The main fragment always starts at
//! position zero; `split_point` marks the first cold block, or `None` for unsplit functions.

use std::collections::HashMap;

use crate::cfg::BlockId;

/// Linear block order plus fragment information for a function.
#[derive(Debug, Clone, Default)]
pub struct FunctionLayout {
    /// Blocks in emission order.
    order: Vec<BlockId>,
    /// Position of each block in `order`; rebuilt by [`update_indices`](Self::update_indices).
    indices: HashMap<BlockId, usize>,
    /// Index into `order` of the first cold block, when the function is split.
    split_point: Option<usize>,
}

impl FunctionLayout {
    /// Creates a layout with the given initial order.
    #[must_use]
    pub fn new(order: Vec<BlockId>) -> Self {
        let mut layout = FunctionLayout {
            order,
            indices: HashMap::new(),
            split_point: None,
        };
        layout.update_indices();
        layout
    }

    /// Returns the blocks in emission order.
    #[must_use]
    pub fn blocks(&self) -> &[BlockId] {
        &self.order
    }

    /// Returns `true` if the layout contains no blocks.
    #[must_use]
    pub fn block_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the number of laid-out blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.order.len()
    }

    /// Returns the layout position of `block`, if it is laid out.
    #[must_use]
    pub fn index_of(&self, block: BlockId) -> Option<usize> {
        self.indices.get(&block).copied()
    }

    /// Returns the block immediately after `block` in emission order.
    #[must_use]
    pub fn block_after(&self, block: BlockId) -> Option<BlockId> {
        let idx = self.index_of(block)?;
        self.order.get(idx + 1).copied()
    }

    /// Returns the first cold block position for split functions.
    #[must_use]
    pub fn split_point(&self) -> Option<usize> {
        self.split_point
    }

    /// Marks the layout as split at `index`; blocks from `index` on form the cold fragment.
    pub fn set_split_point(&mut self, index: Option<usize>) {
        self.split_point = index;
    }

    /// Returns the hot-fragment blocks (the whole layout when unsplit).
    #[must_use]
    pub fn main_fragment(&self) -> &[BlockId] {
        match self.split_point {
            Some(split) => &self.order[..split],
            None => &self.order,
        }
    }

    /// Returns the cold-fragment blocks (empty when unsplit).
    #[must_use]
    pub fn cold_fragment(&self) -> &[BlockId] {
        match self.split_point {
            Some(split) => &self.order[split..],
            None => &[],
        }
    }

    /// Rebuilds the block-to-position index map.
    pub fn update_indices(&mut self) {
        self.indices.clear();
        for (idx, &block) in self.order.iter().enumerate() {
            self.indices.insert(block, idx);
        }
    }

    /// Atomically replaces the block order.
    ///
    /// The new order must be a permutation of the current one; a no-op update (identical
    /// order) is detected and reported.
    ///
    /// # Arguments
    ///
    /// * `new_order` - The replacement emission order
    ///
    /// # Returns
    ///
    /// `true` if the order actually changed, `false` for an identical permutation.
    pub fn update(&mut self, new_order: Vec<BlockId>) -> bool {
        debug_assert_eq!(
            {
                let mut a = self.order.clone();
                a.sort_unstable();
                a
            },
            {
                let mut b = new_order.clone();
                b.sort_unstable();
                b
            },
            "layout update must permute the existing blocks"
        );

        if new_order == self.order {
            return false;
        }
        self.order = new_order;
        self.update_indices();
        true
    }

    /// Removes a block from the layout (used by the invalid-block sweep).
    pub fn erase(&mut self, block: BlockId) {
        if let Some(idx) = self.index_of(block) {
            self.order.remove(idx);
            if let Some(split) = self.split_point {
                if idx < split {
                    self.split_point = Some(split - 1);
                }
            }
            self.update_indices();
        }
    }

    /// Inserts `block` immediately after `after` (or at the end when `after` is not laid out).
    pub fn insert_after(&mut self, after: BlockId, block: BlockId) {
        match self.index_of(after) {
            Some(idx) => self.order.insert(idx + 1, block),
            None => self.order.push(block),
        }
        self.update_indices();
    }

    /// Appends `block` to the end of the layout.
    pub fn push(&mut self, block: BlockId) {
        self.order.push(block);
        self.update_indices();
    }

    /// Computes the edit distance between the current order and `old_order`.
    ///
    /// This is the Levenshtein distance over block handles, used only when per-function
    /// reordering statistics were requested.
    #[must_use]
    pub fn edit_distance(&self, old_order: &[BlockId]) -> u64 {
        let new = &self.order;
        let old = old_order;
        if old.is_empty() {
            return new.len() as u64;
        }
        if new.is_empty() {
            return old.len() as u64;
        }

        let mut prev: Vec<u64> = (0..=old.len() as u64).collect();
        let mut curr: Vec<u64> = vec![0; old.len() + 1];

        for (i, &n) in new.iter().enumerate() {
            curr[0] = i as u64 + 1;
            for (j, &o) in old.iter().enumerate() {
                let subst = prev[j] + u64::from(n != o);
                curr[j + 1] = subst.min(prev[j + 1] + 1).min(curr[j] + 1);
            }
            std::mem::swap(&mut prev, &mut curr);
        }
        prev[old.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[usize]) -> Vec<BlockId> {
        raw.iter().map(|&i| BlockId::new(i)).collect()
    }

    #[test]
    fn test_update_detects_noop() {
        let mut layout = FunctionLayout::new(ids(&[0, 1, 2]));
        assert!(!layout.update(ids(&[0, 1, 2])));
        assert!(layout.update(ids(&[0, 2, 1])));
        assert_eq!(layout.blocks(), ids(&[0, 2, 1]).as_slice());
    }

    #[test]
    fn test_block_after_follows_order() {
        let layout = FunctionLayout::new(ids(&[0, 2, 1]));
        assert_eq!(layout.block_after(BlockId::new(0)), Some(BlockId::new(2)));
        assert_eq!(layout.block_after(BlockId::new(2)), Some(BlockId::new(1)));
        assert_eq!(layout.block_after(BlockId::new(1)), None);
    }

    #[test]
    fn test_erase_updates_split_point() {
        let mut layout = FunctionLayout::new(ids(&[0, 1, 2, 3]));
        layout.set_split_point(Some(2));
        layout.erase(BlockId::new(1));
        assert_eq!(layout.split_point(), Some(1));
        assert_eq!(layout.main_fragment(), ids(&[0]).as_slice());
        assert_eq!(layout.cold_fragment(), ids(&[2, 3]).as_slice());
    }

    #[test]
    fn test_edit_distance() {
        let layout = FunctionLayout::new(ids(&[0, 1, 2, 3]));
        assert_eq!(layout.edit_distance(&ids(&[0, 1, 2, 3])), 0);
        assert_eq!(layout.edit_distance(&ids(&[3, 2, 1, 0])), 4);
        assert_eq!(layout.edit_distance(&ids(&[0, 2, 1, 3])), 2);
        assert_eq!(layout.edit_distance(&[]), 4);
    }
}
