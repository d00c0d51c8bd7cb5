use crate::analyze::dom::DomTree;
use crate::analyze::loops::{LoopForest, LoopId, LoopInfo};
use crate::analyze::mask::MaskAnalysis;
use crate::ir::def::*;
use crate::vectorize::ctx::VecInfo;
use std::env;

use rustc_hash::FxHashMap;

// A scheduled future target. Relay nodes form chains ordered by ascending
// target index; the relay block is a fresh empty block that collects every
// branch that has to converge on the target before it is emitted.
#[derive(Debug, Clone)]
pub(crate) struct RelayNode {
    pub block: BlockId,
    pub next: Option<usize>,
}

// Folds divergent branches and rewrites divergent loops so that the dynamic
// control flow of the region is uniform across all lanes. Per-lane selection
// survives as data: select chains fed by edge masks and tracker phis.
pub struct Linearizer<'a> {
    pub(crate) fn_ir: &'a mut FnIR,
    pub(crate) vec_info: &'a mut VecInfo,
    pub(crate) masks: &'a mut MaskAnalysis,
    pub(crate) dom: &'a mut DomTree,
    pub(crate) forest: LoopForest,

    pub(crate) block_index: FxHashMap<BlockId, usize>,
    pub(crate) index_to_block: Vec<BlockId>,
    pub(crate) relays: FxHashMap<usize, RelayNode>,
    // Lane predicate of each surviving or folded edge, keyed by (pred, succ).
    pub(crate) edge_masks: FxHashMap<(BlockId, BlockId), ValueId>,
    pub(crate) reduction_name: String,
    trace: bool,
}

fn env_bool(key: &str, default_v: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default_v,
    }
}

impl<'a> Linearizer<'a> {
    pub fn new(
        fn_ir: &'a mut FnIR,
        vec_info: &'a mut VecInfo,
        masks: &'a mut MaskAnalysis,
        dom: &'a mut DomTree,
        forest: LoopForest,
    ) -> Self {
        Self {
            fn_ir,
            vec_info,
            masks,
            dom,
            forest,
            block_index: FxHashMap::default(),
            index_to_block: Vec::new(),
            relays: FxHashMap::default(),
            edge_masks: FxHashMap::default(),
            reduction_name: "rv_any".to_string(),
            trace: env_bool("LANEC_TRACE_LIN", false),
        }
    }

    // Name of the any-lane reduction the latch exit branches on. The default
    // matches the usual platform intrinsic.
    pub fn with_reduction_name(mut self, name: impl Into<String>) -> Self {
        self.reduction_name = name.into();
        self
    }

    pub fn run(mut self) {
        self.build_block_index();
        self.verify_block_index();

        if self.num_blocks() <= 1 {
            return;
        }

        self.linearize_control();
        self.cleanup();

        if env_bool("LANEC_VERIFY", false) {
            self.verify();
        }
    }

    pub(crate) fn trace(&self, msg: impl FnOnce() -> String) {
        if self.trace {
            eprintln!("[lin] {}", msg());
        }
    }

    // ---- block index ---------------------------------------------------

    pub(crate) fn num_blocks(&self) -> usize {
        self.index_to_block.len()
    }

    pub(crate) fn block_at(&self, idx: usize) -> BlockId {
        self.index_to_block[idx]
    }

    pub(crate) fn index_of(&self, bid: BlockId) -> usize {
        match self.block_index.get(&bid) {
            Some(&idx) => idx,
            None => panic!("block {} was never scheduled", self.fn_ir.block_name(bid)),
        }
    }

    fn add_to_block_index(&mut self, bid: BlockId) {
        let id = self.index_to_block.len();
        self.block_index.insert(bid, id);
        self.index_to_block.push(bid);
    }

    // Total topological enumeration of the region that keeps every loop a
    // contiguous index range [header, latch].
    fn build_block_index(&mut self) {
        let region = self.vec_info.region().clone();
        let mut stack: Vec<BlockId> = Vec::new();
        let mut pushed_loops: Vec<bool> = vec![false; self.forest.loops().len()];

        let block_count = self.fn_ir.blocks.len();
        for seed in 0..block_count {
            if !region.contains(seed) || self.block_index.contains_key(&seed) {
                continue;
            }
            stack.push(seed);

            while let Some(&block) = stack.last() {
                if self.block_index.contains_key(&block) {
                    stack.pop();
                    continue;
                }

                let loop_id = self.forest.loop_for(block);

                // First sight of this loop: drop the entry block, queue the
                // latch below every outside header dependency.
                if let Some(lid) = loop_id {
                    if !pushed_loops[lid] {
                        pushed_loops[lid] = true;
                        stack.pop();

                        let header = self.forest.get(lid).header;
                        let latch = self.forest.get(lid).latch;
                        stack.push(latch);

                        for pred in self.fn_ir.preds(header) {
                            if !region.contains(pred) || self.forest.get(lid).contains(pred) {
                                continue;
                            }
                            if !self.block_index.contains_key(&pred) {
                                stack.push(pred);
                            }
                        }
                        continue;
                    }
                }

                // Loop-carried dependencies do not gate the header.
                let filter_loop = loop_id.filter(|&lid| self.forest.get(lid).header == block);

                let mut all_done = true;
                for pred in self.fn_ir.preds(block) {
                    if !region.contains(pred) {
                        continue;
                    }
                    if let Some(flid) = filter_loop {
                        if self.forest.get(flid).contains(pred) {
                            continue;
                        }
                    }
                    if !self.block_index.contains_key(&pred) {
                        stack.push(pred);
                        all_done = false;
                    }
                }

                if all_done {
                    stack.pop();
                    self.add_to_block_index(block);

                    // The header is in; schedule the loop interior before
                    // anything outside.
                    if let Some(flid) = filter_loop {
                        let latch = self.forest.get(flid).latch;
                        if !self.block_index.contains_key(&latch) {
                            stack.push(latch);
                        }
                    }
                }
            }
        }
    }

    fn verify_block_index(&self) {
        for lp in self.forest.loops() {
            let mut start_id = self.num_blocks();
            let mut end_id = 0usize;
            for &b in &lp.body {
                let idx = self.index_of(b);
                start_id = start_id.min(idx);
                end_id = end_id.max(idx);
            }

            for i in start_id..=end_id {
                assert!(
                    lp.contains(self.block_at(i)),
                    "non-loop block {} in topo range of loop {}",
                    self.fn_ir.block_name(self.block_at(i)),
                    self.fn_ir.block_name(lp.header)
                );
            }
            assert_eq!(
                start_id,
                self.index_of(lp.header),
                "loop {} does not start at its header",
                self.fn_ir.block_name(lp.header)
            );
            assert_eq!(
                end_id,
                self.index_of(lp.latch),
                "loop {} does not end at its latch",
                self.fn_ir.block_name(lp.header)
            );
        }
    }

    pub(crate) fn loop_snapshot(&self, lid: LoopId) -> LoopInfo {
        self.forest.get(lid).clone()
    }

    // ---- divergence queries --------------------------------------------

    fn needs_folding(&self, bid: BlockId) -> bool {
        match &self.fn_ir.blocks[bid].term {
            Terminator::If { cond, .. } => {
                // Undef reads as non-uniform on purpose.
                !self
                    .vec_info
                    .observed_shape(self.fn_ir, &self.forest, bid, *cond)
                    .is_uniform()
            }
            _ => false,
        }
    }

    // ---- relay chain ---------------------------------------------------

    pub(crate) fn get_relay(&self, id: usize) -> Option<&RelayNode> {
        self.relays.get(&id)
    }

    fn ensure_relay(&mut self, id: usize) {
        if self.relays.contains_key(&id) {
            return;
        }
        let block = self.fn_ir.add_block();
        self.trace(|| format!("new relay block bb{} for target {}", block, id));
        self.relays.insert(id, RelayNode { block, next: None });
    }

    // Schedule @id after @anchor and return the head of the merged chain.
    // Branches are redirected to the head's relay block, so control always
    // passes through every pending target in ascending order.
    pub(crate) fn add_target_to_relay(&mut self, anchor: Option<usize>, id: usize) -> usize {
        self.ensure_relay(id);
        self.merge_chains(anchor, Some(id))
            .expect("relay chain merge lost its head")
    }

    fn merge_chains(&mut self, a: Option<usize>, b: Option<usize>) -> Option<usize> {
        match (a, b) {
            (None, x) | (x, None) => x,
            (Some(x), Some(y)) => {
                if x == y {
                    return Some(x);
                }
                let (lo, hi) = if x < y { (x, y) } else { (y, x) };
                let lo_next = self.relays[&lo].next;
                let merged = self.merge_chains(lo_next, Some(hi));
                self.relays.get_mut(&lo).unwrap().next = merged;
                Some(lo)
            }
        }
    }

    // Forget the relay standing in for @id; returns the remaining chain and
    // the stand-in block whose uses the caller must rewire.
    fn advance_schedule_head(&mut self, id: usize) -> (Option<usize>, Option<BlockId>) {
        match self.relays.remove(&id) {
            Some(node) => (node.next, Some(node.block)),
            None => (None, None),
        }
    }

    fn dump_relay_chain(&self, head: Option<usize>) -> String {
        let mut out = String::from("relay chain:");
        let mut cur = head;
        while let Some(id) = cur {
            out.push_str(&format!(" {}", id));
            cur = self.relays.get(&id).and_then(|n| n.next);
        }
        out
    }

    // ---- edge masks ----------------------------------------------------

    fn record_edge_mask(&mut self, head: BlockId, succ: BlockId, succ_idx: usize) {
        let mask = match self.masks.exit_mask(head, succ_idx) {
            Some(m) => m,
            None => panic!(
                "missing exit mask for {} successor {}",
                self.fn_ir.block_name(head),
                succ_idx
            ),
        };
        self.edge_masks.insert((head, succ), mask);
    }

    pub(crate) fn edge_mask(&self, pred: BlockId, succ: BlockId) -> ValueId {
        match self.edge_masks.get(&(pred, succ)) {
            Some(&m) => m,
            None => panic!(
                "missing edge mask for {} -> {}",
                self.fn_ir.block_name(pred),
                self.fn_ir.block_name(succ)
            ),
        }
    }

    // ---- emission ------------------------------------------------------

    // Forward every branch aimed at @target_id's relay block to the real
    // block, move parked instructions over, recompute the immediate
    // dominator, and free the relay block.
    fn emit_block(&mut self, target_id: usize) -> Option<usize> {
        let target = self.block_at(target_id);
        self.trace(|| format!("emit {}", self.fn_ir.block_name(target)));

        let (advanced, relay_block) = self.advance_schedule_head(target_id);
        let relay_block = match relay_block {
            Some(b) => b,
            None => return None,
        };

        self.fn_ir.retarget_branches(relay_block, target);

        // New idom: nearest common dominator of the surviving predecessors.
        let mut common: Option<BlockId> = None;
        for pred in self.fn_ir.preds(target) {
            common = Some(match common {
                None => pred,
                Some(c) => self.dom.ncd(c, pred),
            });
        }
        if target != self.vec_info.entry() {
            if let Some(c) = common {
                self.trace(|| {
                    format!(
                        "idom of {} is {} by common pred dom",
                        self.fn_ir.block_name(target),
                        self.fn_ir.block_name(c)
                    )
                });
                self.dom.set_idom(target, c);
            }
        }

        if !self.fn_ir.blocks[relay_block].instrs.is_empty() {
            self.fn_ir.move_instrs_to_front(relay_block, target);
        }

        debug_assert!(
            self.fn_ir.preds(relay_block).is_empty(),
            "relay block bb{} still has users",
            relay_block
        );
        self.fn_ir.tombstone_block(relay_block);

        advanced
    }

    // ---- phi folding ---------------------------------------------------

    // A phi has to be folded once the predecessor set of its block drifted
    // from the incoming list: an edge that survives relaying still implies
    // its old lane predicate, one that disappeared does not.
    fn needs_phi_folding(&self, block: BlockId, phi: ValueId) -> bool {
        let preds = self.fn_ir.preds(block);
        let args = match &self.fn_ir.values[phi].kind {
            ValueKind::Phi { args } => args,
            _ => return false,
        };

        for p in &preds {
            if !args.iter().any(|(_, b)| b == p) {
                return true;
            }
        }
        for (_, b) in args {
            if !preds.contains(b) {
                return true;
            }
        }
        false
    }

    fn fold_phis(&mut self, block: BlockId) {
        let phis = self.fn_ir.block_phis(block);
        let first = match phis.first() {
            Some(&p) => p,
            None => return,
        };
        if !self.needs_phi_folding(block, first) {
            return;
        }
        self.trace(|| format!("folding phis in {}", self.fn_ir.block_name(block)));

        let mut insert_at = self.fn_ir.first_insertion_idx(block);
        let mut replacements: Vec<(ValueId, ValueId)> = Vec::with_capacity(phis.len());

        for &phi in &phis {
            let args = match &self.fn_ir.values[phi].kind {
                ValueKind::Phi { args } => args.clone(),
                _ => continue,
            };
            let phi_shape = self.vec_info.get_shape(phi);

            let mut def = args[0].0;
            for &(in_val, in_block) in &args[1..] {
                let mask = self.edge_mask(in_block, block);
                def = self.fn_ir.insert_instr(
                    block,
                    insert_at,
                    ValueKind::Select {
                        cond: mask,
                        on_true: in_val,
                        on_false: def,
                    },
                    "fold",
                );
                insert_at += 1;
                self.vec_info.set_shape(self.fn_ir, def, phi_shape);
            }
            replacements.push((phi, def));
        }

        for (phi, def) in replacements {
            self.fn_ir.replace_all_uses(phi, def);
            self.fn_ir.erase_instr(phi);
        }
    }

    // Patch relay-introduced predecessors into the phis of @block.
    pub(crate) fn add_undef_inputs(&mut self, block: BlockId) {
        let preds = self.fn_ir.preds(block);
        for phi in self.fn_ir.block_phis(block) {
            for &pred in &preds {
                let known = match &self.fn_ir.values[phi].kind {
                    ValueKind::Phi { args } => args.iter().any(|(_, b)| *b == pred),
                    _ => true,
                };
                if known {
                    continue;
                }
                let undef = self.fn_ir.add_undef();
                if let ValueKind::Phi { args } = &mut self.fn_ir.values[phi].kind {
                    args.push((undef, pred));
                }
            }
        }
    }

    // ---- definition promotion ------------------------------------------

    // Build a dominating definition of @inst at the block indexed @dest_idx
    // by threading phi nodes along the topological order. Predecessors ahead
    // of the definition contribute undef, back-edges are skipped.
    pub(crate) fn promote_definition(
        &mut self,
        inst: ValueId,
        def_idx: usize,
        dest_idx: usize,
    ) -> ValueId {
        assert!(
            def_idx <= dest_idx,
            "promoting {} across a non-contiguous range",
            self.fn_ir.value_name(inst)
        );
        if def_idx == dest_idx {
            return inst;
        }

        let span = dest_idx - def_idx;
        let shape = self.vec_info.get_shape(inst);
        // A single undef stands in for every out-of-span edge so that equal
        // incomings stay recognizable.
        let undef = self.fn_ir.add_undef();

        let mut defs: Vec<Option<ValueId>> = vec![None; span + 1];
        defs[0] = Some(inst);

        for i in 1..=span {
            let block_id = def_idx + i;
            let block = self.block_at(block_id);

            let mut incomings: Vec<(ValueId, BlockId)> = Vec::new();
            for pred in self.fn_ir.preds(block) {
                if !self.vec_info.in_region(pred) {
                    incomings.push((undef, pred));
                    continue;
                }
                let pred_idx = self.index_of(pred);
                if pred_idx >= block_id {
                    continue; // reaching back-edge
                }
                let in_val = if pred_idx < def_idx {
                    undef
                } else {
                    defs[pred_idx - def_idx].unwrap_or(undef)
                };
                incomings.push((in_val, pred));
            }

            defs[i] = if incomings.is_empty() {
                None
            } else {
                let first_val = incomings[0].0;
                if incomings.iter().all(|&(v, _)| v == first_val) {
                    Some(first_val)
                } else {
                    let phi = self.fn_ir.add_phi(block, incomings, "promote");
                    self.vec_info.set_shape(self.fn_ir, phi, shape);
                    Some(phi)
                }
            };
        }

        match defs[span] {
            Some(v) => v,
            None => panic!(
                "promoted definition of {} did not reach {}",
                self.fn_ir.value_name(inst),
                self.fn_ir.block_name(self.block_at(dest_idx))
            ),
        }
    }

    // ---- branch processing ---------------------------------------------

    fn process_branch(
        &mut self,
        head: BlockId,
        exit_relay: Option<usize>,
        _parent_loop: Option<LoopId>,
    ) {
        let term = self.fn_ir.blocks[head].term.clone();

        match term {
            Terminator::Return(_) | Terminator::Unreachable => {
                self.trace(|| format!("control sink at {}", self.fn_ir.block_name(head)));
            }

            Terminator::Goto(next) => {
                let next_id = self.index_of(next);
                let head_relay = self.add_target_to_relay(exit_relay, next_id);
                self.record_edge_mask(head, next, 0);
                self.trace(|| {
                    format!(
                        "unconditional {} -> {}; {}",
                        self.fn_ir.block_name(head),
                        self.fn_ir.block_name(next),
                        self.dump_relay_chain(Some(head_relay))
                    )
                });

                let relay_block = self.relays[&head_relay].block;
                self.fn_ir.blocks[head].term = Terminator::Goto(relay_block);
            }

            Terminator::If {
                cond: _,
                then_bb,
                else_bb,
            } => {
                let must_fold = self.needs_folding(head);

                // Normalize successor order by scheduled index.
                let then_id = self.index_of(then_bb);
                let else_id = self.index_of(else_bb);
                assert!(
                    then_id != else_id || then_bb == else_bb,
                    "successor indices collide at {}",
                    self.fn_ir.block_name(head)
                );
                let (first_succ, first_id, second_succ, second_id) = if then_id <= else_id {
                    (then_bb, then_id, else_bb, else_id)
                } else {
                    (else_bb, else_id, then_bb, then_id)
                };

                self.record_edge_mask(head, then_bb, 0);
                self.record_edge_mask(head, else_bb, 1);

                if must_fold {
                    self.trace(|| {
                        format!(
                            "fold branch of {}: first {} at {}, second {} at {}",
                            self.fn_ir.block_name(head),
                            self.fn_ir.block_name(first_succ),
                            first_id,
                            self.fn_ir.block_name(second_succ),
                            second_id
                        )
                    });
                }

                // The first successor; a folded branch nests the second as a
                // mandatory follow-up of the first.
                let mut first_head = self.add_target_to_relay(exit_relay, first_id);
                if must_fold {
                    first_head = self.add_target_to_relay(Some(first_head), second_id);
                    let relay_block = self.relays[&first_head].block;
                    self.set_successor(head, second_succ, relay_block);
                }
                let first_relay_block = self.relays[&first_head].block;
                self.set_successor(head, first_succ, first_relay_block);

                // With no pending relay every path to the second successor
                // now leads through the first.
                if self.dom.dominates(head, second_succ) && self.get_relay(second_id).is_none() {
                    self.trace(|| {
                        format!(
                            "idom of {} is {} by dominance",
                            self.fn_ir.block_name(second_succ),
                            self.fn_ir.block_name(first_succ)
                        )
                    });
                    self.dom.set_idom(second_succ, first_succ);
                }

                let second_head = self.add_target_to_relay(exit_relay, second_id);
                if !must_fold {
                    let relay_block = self.relays[&second_head].block;
                    self.set_successor(head, second_succ, relay_block);
                }
            }
        }
    }

    // Replace the branch operand currently aimed at @old_succ with @new_succ.
    fn set_successor(&mut self, head: BlockId, old_succ: BlockId, new_succ: BlockId) {
        match &mut self.fn_ir.blocks[head].term {
            Terminator::Goto(t) => {
                if *t == old_succ {
                    *t = new_succ;
                }
            }
            Terminator::If {
                then_bb, else_bb, ..
            } => {
                if *then_bb == old_succ {
                    *then_bb = new_succ;
                } else if *else_bb == old_succ {
                    *else_bb = new_succ;
                }
            }
            _ => {}
        }
    }

    // ---- driver --------------------------------------------------------

    fn process_block(&mut self, head_id: usize, parent_loop: Option<LoopId>) -> usize {
        let head = self.block_at(head_id);

        // Descend into a loop, if any.
        let loop_id = self.forest.loop_for(head);
        if loop_id != parent_loop {
            let lid = loop_id.expect("left a loop without passing its latch");
            return self.process_loop(head_id, lid);
        }

        let advanced_exit_relay = self.emit_block(head_id);
        self.fold_phis(head);
        self.process_branch(head, advanced_exit_relay, parent_loop);

        head_id + 1
    }

    fn process_range(&mut self, start_id: usize, end_id: usize, parent_loop: Option<LoopId>) -> usize {
        let mut i = start_id;
        while i < end_id {
            if let Some(lid) = parent_loop {
                assert!(
                    self.forest.get(lid).contains(self.block_at(i)),
                    "{} escaped loop {}",
                    self.fn_ir.block_name(self.block_at(i)),
                    self.fn_ir.block_name(self.forest.get(lid).header)
                );
            }
            i = self.process_block(i, parent_loop);
        }
        end_id
    }

    fn process_loop(&mut self, head_id: usize, lid: LoopId) -> usize {
        let lp = self.loop_snapshot(lid);
        assert_eq!(
            self.index_of(lp.header),
            head_id,
            "loop processing must start at the header"
        );
        let latch_index = self.index_of(lp.latch);
        self.trace(|| {
            format!(
                "processLoop: header {} [{}..{}]",
                self.fn_ir.block_name(lp.header),
                head_id,
                latch_index
            )
        });

        if self.vec_info.is_divergent_loop(lp.header) {
            // Inherited targets from the pre-header edge: everything
            // scheduled after the loop header itself.
            let exit_relay = self.get_relay(head_id).and_then(|n| n.next);
            self.convert_to_latch_exit_loop(lid, exit_relay);
        }

        // Emit the loop interior, then the latch (without descending into
        // its successors), then revisit the header to rewire the back-edge.
        let latch_node_id = self.process_range(head_id, latch_index, Some(lid));
        self.emit_block(latch_index);
        self.fold_phis(lp.latch);
        self.emit_block(head_id);
        self.add_undef_inputs(lp.header);

        latch_node_id + 1
    }

    fn linearize_control(&mut self) {
        self.trace(|| "-- linearization --".to_string());
        let last_id = self.process_range(0, self.num_blocks(), None);
        assert_eq!(last_id, self.num_blocks());
    }

    // Linearization leaves terminators of the form "if c, bbA, bbA" behind.
    fn cleanup(&mut self) {
        for bid in 0..self.fn_ir.blocks.len() {
            if let Terminator::If {
                then_bb, else_bb, ..
            } = self.fn_ir.blocks[bid].term
            {
                if then_bb == else_bb {
                    self.fn_ir.blocks[bid].term = Terminator::Goto(then_bb);
                }
            }
        }
    }

    // Post-conditions: no divergent terminators, no divergent loops, and a
    // dominator tree consistent with the final CFG.
    pub fn verify(&self) {
        for i in 0..self.num_blocks() {
            let block = self.block_at(i);
            match self.forest.loop_for(block) {
                None => {
                    assert!(
                        !self.needs_folding(block),
                        "divergent terminator survived at {}",
                        self.fn_ir.block_name(block)
                    );
                }
                Some(lid) => {
                    if self.forest.get(lid).header == block {
                        assert!(
                            !self.vec_info.is_divergent_loop(block),
                            "loop {} is still divergent",
                            self.fn_ir.block_name(block)
                        );
                    }
                }
            }
        }

        if let Err(msg) = self.dom.verify(self.fn_ir, self.vec_info.region()) {
            panic!("dominator tree broken after linearization: {}", msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::loops::LoopForest;
    use crate::ir::Region;
    use crate::vectorize::ctx::{VecInfo, VectorMapping};
    use crate::vectorize::shape::VectorShape;

    // A straight-line diamond: bb0 -> {bb1, bb2} -> bb3.
    fn diamond() -> (FnIR, Region) {
        let mut f = FnIR::new("diamond".to_string(), 1);
        let b0 = f.add_block();
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();
        f.entry = b0;

        let x = f.add_param(0, "x");
        let zero = f.add_const(0);
        let cond = f.append_instr(
            b0,
            ValueKind::Binary {
                op: BinOp::Lt,
                lhs: x,
                rhs: zero,
            },
            "cond",
        );
        f.blocks[b0].term = Terminator::If {
            cond,
            then_bb: b1,
            else_bb: b2,
        };
        f.blocks[b1].term = Terminator::Goto(b3);
        f.blocks[b2].term = Terminator::Goto(b3);
        f.blocks[b3].term = Terminator::Return(None);

        let region = Region::whole_function(&f);
        (f, region)
    }

    #[test]
    fn promote_definition_threads_phis() {
        let (mut f, region) = diamond();
        let mut dom = DomTree::compute(&f, &region);
        let forest = LoopForest::analyze(&f, &region, &dom).unwrap();
        let mut vec_info = VecInfo::new(region, VectorMapping::new("diamond", 4));
        let mut masks = MaskAnalysis::new();

        let v = f.append_instr(
            1,
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: 0,
                rhs: 1,
            },
            "v",
        );
        vec_info.set_shape(&f, v, VectorShape::varying());

        let mut lin = Linearizer::new(&mut f, &mut vec_info, &mut masks, &mut dom, forest);
        lin.build_block_index();
        lin.verify_block_index();

        let def_idx = lin.index_of(1);
        let dest_idx = lin.index_of(3);
        assert!(dest_idx - def_idx >= 2);
        let promoted = lin.promote_definition(v, def_idx, dest_idx);

        // The merge block needs a phi: one leg carries v, the other undef.
        assert!(f.is_phi(promoted));
        assert_eq!(f.values[promoted].def_block, Some(3));
        match &f.values[promoted].kind {
            ValueKind::Phi { args } => {
                assert_eq!(args.len(), 2);
                assert!(args.iter().any(|&(iv, _)| iv == v));
                assert!(
                    args.iter()
                        .any(|&(iv, _)| matches!(f.values[iv].kind, ValueKind::Undef))
                );
            }
            _ => unreachable!(),
        }
        assert_eq!(vec_info.get_shape(promoted), VectorShape::varying());
    }

    #[test]
    fn relay_chain_merges_sorted() {
        let (mut f, region) = diamond();
        let mut dom = DomTree::compute(&f, &region);
        let forest = LoopForest::analyze(&f, &region, &dom).unwrap();
        let mut vec_info = VecInfo::new(region, VectorMapping::new("diamond", 4));
        let mut masks = MaskAnalysis::new();

        let mut lin = Linearizer::new(&mut f, &mut vec_info, &mut masks, &mut dom, forest);
        lin.build_block_index();

        let head = lin.add_target_to_relay(None, 3);
        assert_eq!(head, 3);
        // Inserting an earlier target returns the new head.
        let head = lin.add_target_to_relay(Some(head), 1);
        assert_eq!(head, 1);
        let head = lin.add_target_to_relay(Some(head), 2);
        assert_eq!(head, 1);
        assert_eq!(lin.get_relay(1).unwrap().next, Some(2));
        assert_eq!(lin.get_relay(2).unwrap().next, Some(3));
        assert_eq!(lin.get_relay(3).unwrap().next, None);
    }
}
