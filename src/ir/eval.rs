use crate::error::{Lc, LcCode, Stage};
use crate::ir::def::*;
use crate::{bail, ensure};
use rustc_hash::FxHashMap;

// Lockstep interpreter: every value is a vector of W lanes, control flow is
// shared. A conditional branch demands a uniform condition, which dynamically
// enforces the post-linearization terminator invariant. With W = 1 this is
// exact scalar reference semantics (rv_any degenerates to the identity).

const DEFAULT_FUEL: usize = 1 << 20;

pub struct Machine<'a> {
    fn_ir: &'a FnIR,
    width: usize,
    vals: FxHashMap<ValueId, Vec<i64>>,
    lane_args: Vec<Vec<i64>>,
    pub mem: Vec<i64>,
}

// Run the function once per lane with independent scalar control flow.
pub fn run_scalar(fn_ir: &FnIR, args: &[i64], mem: Vec<i64>) -> Lc<(Option<i64>, Vec<i64>)> {
    let lane_args: Vec<Vec<i64>> = args.iter().map(|&a| vec![a]).collect();
    let mut machine = Machine::new(fn_ir, 1, lane_args, mem)?;
    let ret = machine.run(DEFAULT_FUEL)?;
    Ok((ret.map(|r| r[0]), machine.mem))
}

// Run the function once in lockstep over W lanes.
pub fn run_lockstep(
    fn_ir: &FnIR,
    lane_args: &[Vec<i64>],
    mem: Vec<i64>,
) -> Lc<(Option<Vec<i64>>, Vec<i64>)> {
    ensure!(
        !lane_args.is_empty() || fn_ir.num_params == 0,
        "lanec.Eval",
        LcCode::E0302,
        Stage::Eval,
        "lockstep run of {} needs one lane vector per parameter",
        fn_ir.name
    );
    let width = lane_args.first().map(|v| v.len()).unwrap_or(1);
    let mut machine = Machine::new(fn_ir, width, lane_args.to_vec(), mem)?;
    let ret = machine.run(DEFAULT_FUEL)?;
    Ok((ret, machine.mem))
}

impl<'a> Machine<'a> {
    pub fn new(
        fn_ir: &'a FnIR,
        width: usize,
        lane_args: Vec<Vec<i64>>,
        mem: Vec<i64>,
    ) -> Lc<Self> {
        ensure!(
            lane_args.len() == fn_ir.num_params,
            "lanec.Eval",
            LcCode::E0302,
            Stage::Eval,
            "{} expects {} arguments, got {}",
            fn_ir.name,
            fn_ir.num_params,
            lane_args.len()
        );
        for arg in &lane_args {
            ensure!(
                arg.len() == width,
                "lanec.Eval",
                LcCode::E0302,
                Stage::Eval,
                "argument lane count {} does not match width {}",
                arg.len(),
                width
            );
        }
        Ok(Self {
            fn_ir,
            width,
            vals: FxHashMap::default(),
            lane_args,
            mem,
        })
    }

    pub fn run(&mut self, fuel: usize) -> Lc<Option<Vec<i64>>> {
        let mut cur = self.fn_ir.entry;
        let mut prev: Option<BlockId> = None;
        let mut steps = 0usize;

        loop {
            steps += 1;
            ensure!(
                steps <= fuel,
                "lanec.Eval",
                LcCode::E0303,
                Stage::Eval,
                "step budget exhausted in {} at {}",
                self.fn_ir.name,
                self.fn_ir.block_name(cur)
            );

            self.exec_block(cur, prev)?;

            match &self.fn_ir.blocks[cur].term {
                Terminator::Goto(t) => {
                    prev = Some(cur);
                    cur = *t;
                }
                Terminator::If {
                    cond,
                    then_bb,
                    else_bb,
                } => {
                    let c = self.value_of(*cond)?;
                    let first = c[0] != 0;
                    ensure!(
                        c.iter().all(|&l| (l != 0) == first),
                        "lanec.Eval",
                        LcCode::E0301,
                        Stage::Eval,
                        "divergent branch condition {} at {}",
                        self.fn_ir.value_name(*cond),
                        self.fn_ir.block_name(cur)
                    );
                    prev = Some(cur);
                    cur = if first { *then_bb } else { *else_bb };
                }
                Terminator::Return(v) => {
                    return match v {
                        Some(v) => Ok(Some(self.value_of(*v)?)),
                        None => Ok(None),
                    };
                }
                Terminator::Unreachable => {
                    bail!(
                        "lanec.Eval",
                        LcCode::E0301,
                        Stage::Eval,
                        "control reached unreachable {}",
                        self.fn_ir.block_name(cur)
                    );
                }
            }
        }
    }

    fn exec_block(&mut self, bid: BlockId, prev: Option<BlockId>) -> Lc<()> {
        // Phis evaluate simultaneously against the pre-entry state.
        let phis = self.fn_ir.block_phis(bid);
        let mut staged: Vec<(ValueId, Vec<i64>)> = Vec::with_capacity(phis.len());
        for v in &phis {
            let args = match &self.fn_ir.values[*v].kind {
                ValueKind::Phi { args } => args,
                _ => unreachable!(),
            };
            let incoming = match prev {
                Some(p) => args.iter().find(|(_, b)| *b == p).map(|(iv, _)| *iv),
                None => None,
            };
            let lanes = match incoming {
                Some(iv) => self.value_of(iv)?,
                None => {
                    bail!(
                        "lanec.Eval",
                        LcCode::E0301,
                        Stage::Eval,
                        "phi {} has no incoming for edge into {}",
                        self.fn_ir.value_name(*v),
                        self.fn_ir.block_name(bid)
                    );
                }
            };
            staged.push((*v, lanes));
        }
        for (v, lanes) in staged {
            self.vals.insert(v, lanes);
        }

        let instrs: Vec<ValueId> = self.fn_ir.blocks[bid].instrs.clone();
        for v in instrs {
            if self.fn_ir.is_phi(v) {
                continue;
            }
            let lanes = self.exec_value(v)?;
            self.vals.insert(v, lanes);
        }
        Ok(())
    }

    fn exec_value(&mut self, v: ValueId) -> Lc<Vec<i64>> {
        let kind = self.fn_ir.values[v].kind.clone();
        match kind {
            ValueKind::Binary { op, lhs, rhs } => {
                let a = self.value_of(lhs)?;
                let b = self.value_of(rhs)?;
                let mut out = Vec::with_capacity(self.width);
                for i in 0..self.width {
                    out.push(Self::binop(op, a[i], b[i], self.fn_ir, v)?);
                }
                Ok(out)
            }
            ValueKind::Unary { op, rhs } => {
                let a = self.value_of(rhs)?;
                Ok(a.iter()
                    .map(|&l| match op {
                        UnaryOp::Neg => l.wrapping_neg(),
                        UnaryOp::Not => (l == 0) as i64,
                    })
                    .collect())
            }
            ValueKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                let c = self.value_of(cond)?;
                let t = self.value_of(on_true)?;
                let f = self.value_of(on_false)?;
                Ok((0..self.width)
                    .map(|i| if c[i] != 0 { t[i] } else { f[i] })
                    .collect())
            }
            ValueKind::Load { base, idx } => {
                let b = self.value_of(base)?;
                let i = self.value_of(idx)?;
                let mut out = Vec::with_capacity(self.width);
                for lane in 0..self.width {
                    out.push(self.mem_read(b[lane], i[lane], v)?);
                }
                Ok(out)
            }
            ValueKind::Store { base, idx, val } => {
                let b = self.value_of(base)?;
                let i = self.value_of(idx)?;
                let x = self.value_of(val)?;
                // Lanes commit in ascending order; the last writer wins.
                for lane in 0..self.width {
                    self.mem_write(b[lane], i[lane], x[lane], v)?;
                }
                Ok(vec![0; self.width])
            }
            ValueKind::Call { callee, args } => {
                if callee == "rv_any" && args.len() == 1 {
                    let a = self.value_of(args[0])?;
                    let any = a.iter().any(|&l| l != 0) as i64;
                    return Ok(vec![any; self.width]);
                }
                bail!(
                    "lanec.Eval",
                    LcCode::E0302,
                    Stage::Eval,
                    "unknown callee '{}' in {}",
                    callee,
                    self.fn_ir.name
                );
            }
            // Floating kinds are handled by value_of.
            _ => self.value_of(v),
        }
    }

    fn binop(op: BinOp, a: i64, b: i64, fn_ir: &FnIR, v: ValueId) -> Lc<i64> {
        Ok(match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => {
                ensure!(
                    b != 0,
                    "lanec.Eval",
                    LcCode::E0302,
                    Stage::Eval,
                    "division by zero at {}",
                    fn_ir.value_name(v)
                );
                a.wrapping_div(b)
            }
            BinOp::Eq => (a == b) as i64,
            BinOp::Ne => (a != b) as i64,
            BinOp::Lt => (a < b) as i64,
            BinOp::Le => (a <= b) as i64,
            BinOp::Gt => (a > b) as i64,
            BinOp::Ge => (a >= b) as i64,
            BinOp::And => (a != 0 && b != 0) as i64,
            BinOp::Or => (a != 0 || b != 0) as i64,
        })
    }

    fn value_of(&self, v: ValueId) -> Lc<Vec<i64>> {
        if let Some(lanes) = self.vals.get(&v) {
            return Ok(lanes.clone());
        }
        match &self.fn_ir.values[v].kind {
            ValueKind::Const(c) => Ok(vec![*c; self.width]),
            ValueKind::Undef => Ok(vec![0; self.width]),
            ValueKind::Param { index } => Ok(self.lane_args[*index].clone()),
            _ => {
                bail!(
                    "lanec.Eval",
                    LcCode::E0302,
                    Stage::Eval,
                    "use of {} before its definition executed",
                    self.fn_ir.value_name(v)
                );
            }
        }
    }

    fn mem_read(&self, base: i64, idx: i64, v: ValueId) -> Lc<i64> {
        let addr = base.wrapping_add(idx);
        if addr < 0 || addr as usize >= self.mem.len() {
            bail!(
                "lanec.Eval",
                LcCode::E0302,
                Stage::Eval,
                "load {} out of bounds at address {}",
                self.fn_ir.value_name(v),
                addr
            );
        }
        Ok(self.mem[addr as usize])
    }

    fn mem_write(&mut self, base: i64, idx: i64, val: i64, v: ValueId) -> Lc<()> {
        let addr = base.wrapping_add(idx);
        if addr < 0 || addr as usize >= self.mem.len() {
            bail!(
                "lanec.Eval",
                LcCode::E0302,
                Stage::Eval,
                "store {} out of bounds at address {}",
                self.fn_ir.value_name(v),
                addr
            );
        }
        self.mem[addr as usize] = val;
        Ok(())
    }
}
