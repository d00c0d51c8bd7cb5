use crate::analyze::dom::DomTree;
use crate::error::{Lc, LcCode, Stage};
use crate::ir::def::*;
use crate::ir::Region;
use crate::{bail, ensure};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

pub type LoopId = usize;

#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub id: LoopId,
    pub header: BlockId,
    pub latch: BlockId, // The block that jumps back to the header
    pub preheader: BlockId,
    pub body: FxHashSet<BlockId>,
    pub exiting: SmallVec<[BlockId; 3]>, // In-loop blocks with an outside successor
    pub exits: SmallVec<[BlockId; 3]>,   // Outside blocks targeted by loop blocks
    pub parent: Option<LoopId>,
    pub depth: usize,
}

impl LoopInfo {
    pub fn contains(&self, bid: BlockId) -> bool {
        self.body.contains(&bid)
    }
}

// Natural-loop forest of a region. Construction checks the canonical form
// the transforms rely on: one latch per header, a unique in-region
// pre-header. Non-canonical input is rejected before anything is mutated.
#[derive(Debug, Clone)]
pub struct LoopForest {
    loops: Vec<LoopInfo>,
    innermost: FxHashMap<BlockId, LoopId>,
}

impl LoopForest {
    pub fn analyze(fn_ir: &FnIR, region: &Region, dom: &DomTree) -> Lc<Self> {
        // 1. Back-edges: src -> dst with dst dominating src.
        //    dst is the header, src the latch.
        let mut latches: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for bid in region.iter() {
            for succ in fn_ir.successors(bid) {
                if region.contains(succ) && dom.dominates(succ, bid) {
                    latches.entry(succ).or_default().push(bid);
                }
            }
        }

        let mut headers: Vec<BlockId> = latches.keys().copied().collect();
        headers.sort_unstable();

        let mut loops = Vec::new();
        for header in headers {
            let found = &latches[&header];
            ensure!(
                found.len() == 1,
                "lanec.Loops",
                LcCode::E0201,
                Stage::Analysis,
                "loop header {} has {} latches, expected exactly one",
                fn_ir.block_name(header),
                found.len()
            );
            let latch = found[0];
            loops.push(Self::natural_loop(fn_ir, region, header, latch)?);
        }

        // 2. Nesting by body inclusion; the innermost loop of a block is the
        //    smallest body containing it.
        let mut order: Vec<usize> = (0..loops.len()).collect();
        order.sort_by_key(|&i| loops[i].body.len());

        let mut innermost: FxHashMap<BlockId, LoopId> = FxHashMap::default();
        for (id, lp) in loops.iter_mut().enumerate() {
            lp.id = id;
        }
        for &i in order.iter().rev() {
            for &b in &loops[i].body {
                innermost.insert(b, i);
            }
        }

        for i in 0..loops.len() {
            let mut parent: Option<LoopId> = None;
            for j in 0..loops.len() {
                if i == j || !loops[j].body.contains(&loops[i].header) {
                    continue;
                }
                match parent {
                    None => parent = Some(j),
                    Some(p) => {
                        if loops[j].body.len() < loops[p].body.len() {
                            parent = Some(j);
                        }
                    }
                }
            }
            loops[i].parent = parent;
        }
        for i in 0..loops.len() {
            let mut depth = 1usize;
            let mut cur = loops[i].parent;
            while let Some(p) = cur {
                depth += 1;
                cur = loops[p].parent;
            }
            loops[i].depth = depth;
        }

        Ok(Self { loops, innermost })
    }

    fn natural_loop(
        fn_ir: &FnIR,
        region: &Region,
        header: BlockId,
        latch: BlockId,
    ) -> Lc<LoopInfo> {
        // Collect the body by reaching backwards from the latch.
        let mut body = FxHashSet::default();
        body.insert(header);
        body.insert(latch);
        let mut stack = vec![latch];
        while let Some(node) = stack.pop() {
            for pred in fn_ir.preds(node) {
                if region.contains(pred) && !body.contains(&pred) {
                    body.insert(pred);
                    stack.push(pred);
                }
            }
        }

        let mut exiting: SmallVec<[BlockId; 3]> = SmallVec::new();
        let mut exits: SmallVec<[BlockId; 3]> = SmallVec::new();
        let mut body_sorted: Vec<BlockId> = body.iter().copied().collect();
        body_sorted.sort_unstable();
        for &b in &body_sorted {
            for succ in fn_ir.successors(b) {
                if !body.contains(&succ) {
                    if !exiting.contains(&b) {
                        exiting.push(b);
                    }
                    if !exits.contains(&succ) {
                        exits.push(succ);
                    }
                }
            }
        }

        // The unique in-region predecessor of the header outside the loop.
        let mut preheader = None;
        for pred in fn_ir.preds(header) {
            if !region.contains(pred) || body.contains(&pred) {
                continue;
            }
            if preheader.is_some() {
                bail!(
                    "lanec.Loops",
                    LcCode::E0201,
                    Stage::Analysis,
                    "loop header {} has multiple pre-headers",
                    fn_ir.block_name(header)
                );
            }
            preheader = Some(pred);
        }
        let preheader = match preheader {
            Some(p) => p,
            None => {
                bail!(
                    "lanec.Loops",
                    LcCode::E0201,
                    Stage::Analysis,
                    "loop header {} has no in-region pre-header",
                    fn_ir.block_name(header)
                );
            }
        };

        Ok(LoopInfo {
            id: 0,
            header,
            latch,
            preheader,
            body,
            exiting,
            exits,
            parent: None,
            depth: 0,
        })
    }

    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    pub fn get(&self, id: LoopId) -> &LoopInfo {
        &self.loops[id]
    }

    // Innermost loop containing @bid.
    pub fn loop_for(&self, bid: BlockId) -> Option<LoopId> {
        self.innermost.get(&bid).copied()
    }

    pub fn is_header(&self, bid: BlockId) -> bool {
        self.loop_for(bid)
            .map(|id| self.loops[id].header == bid)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}
