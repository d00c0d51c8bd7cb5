use crate::ir::def::*;
use rustc_hash::FxHashMap;

// Container for the lane predicates the external mask analysis materialized
// as IR values. The transforms only read and re-register entries; they never
// compute masks.
#[derive(Debug, Clone, Default)]
pub struct MaskAnalysis {
    // Per-lane predicate under which (block, successor index) is taken.
    exit_masks: FxHashMap<(BlockId, usize), ValueId>,
    // Per-lane predicate that any exit of the loop (keyed by header) is taken.
    combined_loop_exit: FxHashMap<BlockId, ValueId>,
}

impl MaskAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_exit_mask(&mut self, block: BlockId, succ_idx: usize, mask: ValueId) {
        self.exit_masks.insert((block, succ_idx), mask);
    }

    pub fn exit_mask(&self, block: BlockId, succ_idx: usize) -> Option<ValueId> {
        self.exit_masks.get(&(block, succ_idx)).copied()
    }

    // Lookup by successor block rather than index.
    pub fn exit_mask_to(&self, fn_ir: &FnIR, block: BlockId, succ: BlockId) -> Option<ValueId> {
        let idx = fn_ir.successors(block).iter().position(|&s| s == succ)?;
        self.exit_mask(block, idx)
    }

    pub fn set_combined_loop_exit_mask(&mut self, header: BlockId, mask: ValueId) {
        self.combined_loop_exit.insert(header, mask);
    }

    pub fn combined_loop_exit_mask(&self, header: BlockId) -> Option<ValueId> {
        self.combined_loop_exit.get(&header).copied()
    }

    // Re-register the latch's edge masks after it was rebuilt into the
    // uniform two-way exit branch (successor 0 is the header).
    pub fn update_exit_masks(&mut self, latch: BlockId, to_header: ValueId, to_exit: ValueId) {
        self.exit_masks.insert((latch, 0), to_header);
        self.exit_masks.insert((latch, 1), to_exit);
    }

    // A two-successor terminator collapsed into an unconditional branch; the
    // surviving edge's mask moves to successor index 0.
    pub fn retarget_uncond(&mut self, block: BlockId, surviving_idx: usize) {
        let kept = self.exit_masks.remove(&(block, surviving_idx));
        self.exit_masks.remove(&(block, 1 - surviving_idx));
        if let Some(mask) = kept {
            self.exit_masks.insert((block, 0), mask);
        }
    }
}
