use crate::ir::def::*;
use rustc_hash::FxHashSet;
use std::fmt;

#[derive(Debug)]
pub enum VerifyError {
    BadValue(ValueId),
    BadBlock(BlockId),
    BadOperand(ValueId),
    BadTerminator(BlockId),
    WrongDefBlock {
        value: ValueId,
        block: BlockId,
    },
    PhiNotLeading {
        block: BlockId,
        value: ValueId,
    },
    DuplicateIncoming {
        phi_val: ValueId,
        block: BlockId,
    },
    PhiPredMismatch {
        phi_val: ValueId,
        block: BlockId,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::BadValue(v) => write!(f, "Invalid ValueId: {}", v),
            VerifyError::BadBlock(b) => write!(f, "Invalid BlockId: {}", b),
            VerifyError::BadOperand(v) => write!(f, "Invalid operand ValueId: {}", v),
            VerifyError::BadTerminator(b) => write!(f, "Invalid terminator in block: bb{}", b),
            VerifyError::WrongDefBlock { value, block } => {
                write!(f, "Value {} anchored in bb{} disagrees with def_block", value, block)
            }
            VerifyError::PhiNotLeading { block, value } => {
                write!(f, "Phi {} is not in the leading phi prefix of bb{}", value, block)
            }
            VerifyError::DuplicateIncoming { phi_val, block } => write!(
                f,
                "Phi {} has duplicate incoming for predecessor bb{}",
                phi_val, block
            ),
            VerifyError::PhiPredMismatch { phi_val, block } => write!(
                f,
                "Phi {} incoming blocks disagree with predecessors of bb{}",
                phi_val, block
            ),
        }
    }
}

pub fn verify(fn_ir: &FnIR) -> Result<(), VerifyError> {
    verify_ir(fn_ir)
}

pub fn verify_ir(fn_ir: &FnIR) -> Result<(), VerifyError> {
    check_blk(fn_ir, fn_ir.entry)?;

    // 1. Validate all value definitions and operands
    for (vid, val) in fn_ir.values.iter().enumerate() {
        if val.id != vid {
            return Err(VerifyError::BadValue(vid));
        }

        match &val.kind {
            ValueKind::Phi { args } => {
                let mut seen = FxHashSet::default();
                for (v, b) in args {
                    check_val(fn_ir, *v)?;
                    check_blk(fn_ir, *b)?;
                    if !seen.insert(*b) {
                        return Err(VerifyError::DuplicateIncoming {
                            phi_val: vid,
                            block: *b,
                        });
                    }
                }
            }
            ValueKind::Binary { lhs, rhs, .. } => {
                check_val(fn_ir, *lhs)?;
                check_val(fn_ir, *rhs)?;
            }
            ValueKind::Unary { rhs, .. } => check_val(fn_ir, *rhs)?,
            ValueKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                check_val(fn_ir, *cond)?;
                check_val(fn_ir, *on_true)?;
                check_val(fn_ir, *on_false)?;
            }
            ValueKind::Load { base, idx } => {
                check_val(fn_ir, *base)?;
                check_val(fn_ir, *idx)?;
            }
            ValueKind::Store { base, idx, val } => {
                check_val(fn_ir, *base)?;
                check_val(fn_ir, *idx)?;
                check_val(fn_ir, *val)?;
            }
            ValueKind::Call { args, .. } => {
                for a in args {
                    check_val(fn_ir, *a)?;
                }
            }
            _ => {}
        }
    }

    // 2. Build predecessor lists and validate block structure
    let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); fn_ir.blocks.len()];
    for (bid, blk) in fn_ir.blocks.iter().enumerate() {
        if blk.id != bid {
            return Err(VerifyError::BadBlock(bid));
        }

        match &blk.term {
            Terminator::Goto(target) => {
                check_blk(fn_ir, *target)?;
                preds[*target].push(bid);
            }
            Terminator::If {
                cond,
                then_bb,
                else_bb,
            } => {
                check_val(fn_ir, *cond)?;
                check_blk(fn_ir, *then_bb)?;
                check_blk(fn_ir, *else_bb)?;
                preds[*then_bb].push(bid);
                preds[*else_bb].push(bid);
            }
            Terminator::Return(Some(v)) => check_val(fn_ir, *v)?,
            Terminator::Return(None) => {}
            Terminator::Unreachable => {}
        }
    }

    // 3. Anchoring: instruction lists agree with def_block, phis lead
    for (bid, blk) in fn_ir.blocks.iter().enumerate() {
        let mut seen_non_phi = false;
        for &v in &blk.instrs {
            check_val(fn_ir, v)?;
            if fn_ir.values[v].def_block != Some(bid) {
                return Err(VerifyError::WrongDefBlock { value: v, block: bid });
            }
            if fn_ir.is_phi(v) {
                if seen_non_phi {
                    return Err(VerifyError::PhiNotLeading { block: bid, value: v });
                }
            } else {
                seen_non_phi = true;
            }
        }

        // Tombstoned blocks must be fully dead.
        if matches!(blk.term, Terminator::Unreachable)
            && (!blk.instrs.is_empty() || !preds[bid].is_empty())
            && bid != fn_ir.entry
        {
            return Err(VerifyError::BadTerminator(bid));
        }
    }

    // 4. Phi incoming blocks must be exactly the block's predecessors
    for (bid, _) in fn_ir.blocks.iter().enumerate() {
        let pred_set: FxHashSet<BlockId> = preds[bid].iter().copied().collect();
        for v in fn_ir.block_phis(bid) {
            if let ValueKind::Phi { args } = &fn_ir.values[v].kind {
                let incoming: FxHashSet<BlockId> = args.iter().map(|(_, b)| *b).collect();
                if incoming != pred_set {
                    return Err(VerifyError::PhiPredMismatch {
                        phi_val: v,
                        block: bid,
                    });
                }
            }
        }
    }

    Ok(())
}

fn check_val(fn_ir: &FnIR, vid: ValueId) -> Result<(), VerifyError> {
    if vid >= fn_ir.values.len() {
        Err(VerifyError::BadValue(vid))
    } else {
        Ok(())
    }
}

fn check_blk(fn_ir: &FnIR, bid: BlockId) -> Result<(), VerifyError> {
    if bid >= fn_ir.blocks.len() {
        Err(VerifyError::BadBlock(bid))
    } else {
        Ok(())
    }
}
