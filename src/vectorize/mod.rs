#![allow(dead_code)]

pub mod ctx;
pub mod div_loop;
pub mod linearize;
pub mod shape;

pub use ctx::{VecInfo, VectorMapping};
pub use linearize::Linearizer;
pub use shape::VectorShape;

use crate::analyze::dom::DomTree;
use crate::analyze::loops::LoopForest;
use crate::analyze::mask::MaskAnalysis;
use crate::error::Lc;
use crate::ir::def::FnIR;

// Run divergence-driven linearization over the region held by @vec_info:
// divergent loops become latch-exit loops, divergent branches fold away, and
// the returned dominator tree matches the final CFG.
pub fn linearize(fn_ir: &mut FnIR, vec_info: &mut VecInfo, masks: &mut MaskAnalysis) -> Lc<DomTree> {
    let region = vec_info.region().clone();
    let mut dom = DomTree::compute(fn_ir, &region);
    let forest = LoopForest::analyze(fn_ir, &region, &dom)?;

    Linearizer::new(fn_ir, vec_info, masks, &mut dom, forest).run();
    Ok(dom)
}
