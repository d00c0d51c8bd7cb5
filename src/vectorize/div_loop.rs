use crate::analyze::loops::{LoopId, LoopInfo};
use crate::ir::def::*;
use crate::vectorize::linearize::Linearizer;
use crate::vectorize::shape::VectorShape;
use rustc_hash::FxHashMap;

// Tracker phis for the live-outs of one divergent loop. A tracker carries
// the value each lane had when it left the loop; the latch blends in the
// current value for lanes whose exit is taken this iteration.
pub(crate) struct LiveValueTracker {
    trackers: FxHashMap<ValueId, ValueId>,
}

impl LiveValueTracker {
    fn new() -> Self {
        Self {
            trackers: FxHashMap::default(),
        }
    }

    // Insert a tracker phi into the loop header for @inst. The phi starts
    // undef on the pre-header edge and carries itself around the back-edge
    // until an update is chained in.
    fn request_tracker(&mut self, lin: &mut Linearizer, lp: &LoopInfo, inst: ValueId) -> ValueId {
        if let Some(&phi) = self.trackers.get(&inst) {
            return phi;
        }

        let undef = lin.fn_ir.add_undef();
        let base = lin.fn_ir.values[inst].name.clone();
        let name = if base.is_empty() {
            format!("track_v{}", inst)
        } else {
            format!("track_{}", base)
        };
        let phi = lin.fn_ir.add_phi(lp.header, vec![(undef, lp.preheader)], name);
        if let ValueKind::Phi { args } = &mut lin.fn_ir.values[phi].kind {
            args.push((phi, lp.latch));
        }
        lin.vec_info.set_shape(lin.fn_ir, phi, VectorShape::varying());

        self.trackers.insert(inst, phi);
        phi
    }

    // Blend @val into @tracker at the latch whenever a lane takes any exit
    // this iteration. Values that do not dominate the latch are promoted
    // along the loop's topological order first.
    fn add_tracker_update(
        &mut self,
        lin: &mut Linearizer,
        lp: &LoopInfo,
        tracker: ValueId,
        val: ValueId,
    ) {
        let latch = lp.latch;
        let last = Self::last_tracker_state(lin, lp, tracker);
        let combined = match lin.masks.combined_loop_exit_mask(lp.header) {
            Some(m) => m,
            None => panic!(
                "missing combined exit mask for loop {}",
                lin.fn_ir.block_name(lp.header)
            ),
        };

        let mut use_val = val;
        if let Some(def_block) = lin.fn_ir.values[val].def_block {
            if !lin.dom.dominates(def_block, latch) {
                let def_idx = lin.index_of(def_block);
                let latch_idx = lin.index_of(latch);
                assert!(
                    lin.index_of(lp.header) <= def_idx && def_idx <= latch_idx,
                    "non-dominating live-out {} defined outside loop {}",
                    lin.fn_ir.value_name(val),
                    lin.fn_ir.block_name(lp.header)
                );
                use_val = lin.promote_definition(val, def_idx, latch_idx);
            }
        }

        let base = lin.fn_ir.values[val].name.clone();
        let name = if base.is_empty() {
            format!("update_v{}", val)
        } else {
            format!("update_{}", base)
        };
        let update = lin.fn_ir.append_instr(
            latch,
            ValueKind::Select {
                cond: combined,
                on_true: use_val,
                on_false: last,
            },
            name,
        );
        lin.vec_info.set_shape(lin.fn_ir, update, VectorShape::varying());

        if let ValueKind::Phi { args } = &mut lin.fn_ir.values[tracker].kind {
            for (v, b) in args.iter_mut() {
                if *b == latch {
                    *v = update;
                }
            }
        }
    }

    // The most recent update chained into @tracker at the latch.
    fn last_tracker_state(lin: &Linearizer, lp: &LoopInfo, tracker: ValueId) -> ValueId {
        match &lin.fn_ir.values[tracker].kind {
            ValueKind::Phi { args } => args
                .iter()
                .find(|(_, b)| *b == lp.latch)
                .map(|(v, _)| *v)
                .expect("tracker phi lost its latch input"),
            _ => unreachable!("tracker is not a phi"),
        }
    }

    fn tracker_state_for_live_out(
        &self,
        lin: &Linearizer,
        lp: &LoopInfo,
        inst: ValueId,
    ) -> ValueId {
        let tracker = match self.trackers.get(&inst) {
            Some(&t) => t,
            None => panic!("{} is not a tracked value", lin.fn_ir.value_name(inst)),
        };
        Self::last_tracker_state(lin, lp, tracker)
    }
}

impl<'a> Linearizer<'a> {
    // Rewrite a divergent loop into latch-exit form: one uniform exit branch
    // at the latch that fires once every lane has left, with all original
    // exits scheduled after the loop and their live-outs carried in
    // trackers. Returns the head of the loop's exit relay chain.
    pub(crate) fn convert_to_latch_exit_loop(
        &mut self,
        lid: LoopId,
        exit_relay: Option<usize>,
    ) -> Option<usize> {
        let lp = self.loop_snapshot(lid);
        let header_idx = self.index_of(lp.header);
        let latch_idx = self.index_of(lp.latch);
        self.trace(|| {
            format!(
                "convert loop {} [{}..{}] to latch-exit form",
                self.fn_ir.block_name(lp.header),
                header_idx,
                latch_idx
            )
        });

        let mut tracker = LiveValueTracker::new();

        // Schedule every exit after the loop, in topological order, and
        // track the values that live across divergent exits.
        let mut exits: Vec<BlockId> = lp.exits.iter().copied().collect();
        exits.sort_by_key(|&e| self.index_of(e));

        let mut loop_exit_relay = exit_relay;
        for &exit in &exits {
            let exit_id = self.index_of(exit);
            loop_exit_relay = Some(self.add_target_to_relay(loop_exit_relay, exit_id));

            // Exits whose exiting block sits in an inner loop belong to that
            // loop's own conversion.
            let exiting = self.exiting_block_of(&lp, exit);
            if self.forest.loop_for(exiting) == Some(lid) {
                self.track_live_outs(&lp, &mut tracker, exit);
            }
        }

        // Loop-closed phis are eliminated rather than repointed; exterior
        // uses continue through the tracker state (or the promoted def).
        for &exit in &exits {
            self.migrate_exit_phis(&lp, exit, header_idx, latch_idx);
        }

        for &exiting in &lp.exiting {
            self.drop_loop_exit(&lp, exiting);
        }

        // The live mask of the back-edge, read before the latch terminator
        // is replaced.
        let live_cond = match self.masks.exit_mask_to(self.fn_ir, lp.latch, lp.header) {
            Some(m) => m,
            None => panic!(
                "missing live mask on the latch of loop {}",
                self.fn_ir.block_name(lp.header)
            ),
        };

        match self.fn_ir.blocks[lp.latch].term {
            Terminator::Goto(t) => {
                assert_eq!(
                    t, lp.header,
                    "latch {} does not branch back to its header",
                    self.fn_ir.block_name(lp.latch)
                );
            }
            _ => panic!(
                "latch {} must end in a single unconditional branch",
                self.fn_ir.block_name(lp.latch)
            ),
        }

        // Iterate while any lane is live: cond = rv_any(<live mask>).
        let any_live = self.create_reduction(live_cond, lp.latch);
        let exit_head = match loop_exit_relay {
            Some(h) => h,
            None => panic!(
                "divergent loop {} has no exit to relay",
                self.fn_ir.block_name(lp.header)
            ),
        };
        let exit_block = self.relays[&exit_head].block;
        self.fn_ir.blocks[lp.latch].term = Terminator::If {
            cond: any_live,
            then_bb: lp.header,
            else_bb: exit_block,
        };

        // The loop is non-divergent from here on.
        self.vec_info.remove_divergent_loop(lp.header);

        let combined = match self.masks.combined_loop_exit_mask(lp.header) {
            Some(m) => m,
            None => panic!(
                "missing combined exit mask for loop {}",
                self.fn_ir.block_name(lp.header)
            ),
        };
        self.masks.update_exit_masks(lp.latch, any_live, combined);

        loop_exit_relay
    }

    // Create trackers and latch updates for every loop-carried live-out that
    // flows through @exit. Kill exits finish the loop for all live lanes at
    // once, so their loop-closed phis stay untouched.
    fn track_live_outs(&mut self, lp: &LoopInfo, tracker: &mut LiveValueTracker, exit: BlockId) {
        if self.vec_info.is_kill_exit(exit) {
            self.trace(|| format!("kill exit {}, skipping", self.fn_ir.block_name(exit)));
            return;
        }

        for phi in self.fn_ir.block_phis(exit) {
            let args = match &self.fn_ir.values[phi].kind {
                ValueKind::Phi { args } => args.clone(),
                _ => continue,
            };
            assert_eq!(
                args.len(),
                1,
                "{} in {} is not a loop-closed phi",
                self.fn_ir.value_name(phi),
                self.fn_ir.block_name(exit)
            );
            let (in_val, in_block) = args[0];
            assert!(
                lp.contains(in_block),
                "{} is not fed from inside loop {}",
                self.fn_ir.value_name(phi),
                self.fn_ir.block_name(lp.header)
            );

            // Values defined outside the loop are available everywhere.
            let def_block = match self.fn_ir.values[in_val].def_block {
                Some(b) => b,
                None => continue,
            };
            if !lp.contains(def_block) {
                continue;
            }

            let tr = tracker.request_tracker(self, lp, in_val);
            tracker.add_tracker_update(self, lp, tr, in_val);

            let live_out = tracker.tracker_state_for_live_out(self, lp, in_val);
            if let ValueKind::Phi { args } = &mut self.fn_ir.values[phi].kind {
                args[0].0 = live_out;
            }
        }
    }

    // Eliminate the loop-closed phis of @exit. Incoming defs that no longer
    // dominate the latch are promoted first; every use is redirected to the
    // single incoming value.
    fn migrate_exit_phis(&mut self, lp: &LoopInfo, exit: BlockId, header_idx: usize, latch_idx: usize) {
        for phi in self.fn_ir.block_phis(exit) {
            let args = match &self.fn_ir.values[phi].kind {
                ValueKind::Phi { args } => args.clone(),
                _ => continue,
            };

            let mut replacement: Option<ValueId> = None;
            for &(in_val, in_block) in &args {
                assert!(
                    lp.contains(in_block),
                    "{} in {} is not a loop-closed phi",
                    self.fn_ir.value_name(phi),
                    self.fn_ir.block_name(exit)
                );

                let mut new_val = in_val;
                if let Some(def_block) = self.fn_ir.values[in_val].def_block {
                    if !self.dom.dominates(def_block, lp.latch) {
                        let def_idx = self.index_of(def_block);
                        assert!(
                            header_idx <= def_idx && def_idx <= latch_idx,
                            "non-dominating def {} not in loop {}",
                            self.fn_ir.value_name(in_val),
                            self.fn_ir.block_name(lp.header)
                        );
                        new_val = self.promote_definition(in_val, def_idx, latch_idx);
                    }
                }
                if replacement.is_none() {
                    replacement = Some(new_val);
                }
            }

            let rep = match replacement {
                Some(r) => r,
                None => panic!(
                    "loop-closed phi {} has no incoming value",
                    self.fn_ir.value_name(phi)
                ),
            };
            self.trace(|| {
                format!(
                    "migrating {} in {} to {}",
                    self.fn_ir.value_name(phi),
                    self.fn_ir.block_name(exit),
                    self.fn_ir.value_name(rep)
                )
            });
            self.fn_ir.replace_all_uses(phi, rep);
            self.fn_ir.erase_instr(phi);
        }
    }

    // Replace the exiting branch of @block with an unconditional branch to
    // its in-loop successor; the surviving edge keeps its mask.
    fn drop_loop_exit(&mut self, lp: &LoopInfo, block: BlockId) {
        assert!(
            lp.contains(block),
            "cannot drop a loop-exit edge from {} outside loop {}",
            self.fn_ir.block_name(block),
            self.fn_ir.block_name(lp.header)
        );

        match self.fn_ir.blocks[block].term.clone() {
            Terminator::If {
                then_bb, else_bb, ..
            } => {
                let (in_succ, surviving_idx) = if lp.contains(then_bb) {
                    (then_bb, 0)
                } else if lp.contains(else_bb) {
                    (else_bb, 1)
                } else {
                    panic!(
                        "no successor of {} stays inside loop {}",
                        self.fn_ir.block_name(block),
                        self.fn_ir.block_name(lp.header)
                    );
                };
                self.trace(|| {
                    format!(
                        "drop loop exit of {} -> {}",
                        self.fn_ir.block_name(block),
                        self.fn_ir.block_name(in_succ)
                    )
                });
                self.fn_ir.blocks[block].term = Terminator::Goto(in_succ);
                self.masks.retarget_uncond(block, surviving_idx);
            }
            _ => panic!(
                "{} has no loop-exit edge to drop",
                self.fn_ir.block_name(block)
            ),
        }
    }

    // Get-or-declare the reduction intrinsic and call it on @pred at the end
    // of @block. The call is uniform by contract.
    fn create_reduction(&mut self, pred: ValueId, block: BlockId) -> ValueId {
        let name = self.reduction_name.clone();
        self.fn_ir.request_external(&name);
        let call = self.fn_ir.append_instr(
            block,
            ValueKind::Call {
                callee: name,
                args: vec![pred],
            },
            "reduce",
        );
        self.vec_info.set_shape(self.fn_ir, call, VectorShape::uni());
        call
    }

    fn exiting_block_of(&self, lp: &LoopInfo, exit: BlockId) -> BlockId {
        for pred in self.fn_ir.preds(exit) {
            if lp.contains(pred) {
                return pred;
            }
        }
        panic!(
            "exit {} has no predecessor inside loop {}",
            self.fn_ir.block_name(exit),
            self.fn_ir.block_name(lp.header)
        );
    }
}
