use smallvec::SmallVec;
use std::fmt::Write as _;

pub type BlockId = usize;
pub type ValueId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Terminator {
    Goto(BlockId),
    If {
        cond: ValueId,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Return(Option<ValueId>),
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    // Block-anchored definitions in order. Phi nodes form a leading prefix.
    pub instrs: Vec<ValueId>,
    pub term: Terminator,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Const(i64),
    Undef,
    Param {
        index: usize,
    },

    // SSA Phi node. Merges values from predecessor blocks.
    Phi {
        args: Vec<(ValueId, BlockId)>,
    },

    Binary {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Unary {
        op: UnaryOp,
        rhs: ValueId,
    },
    // Per-lane blend. The workhorse of linearized control flow.
    Select {
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    },

    Load {
        base: ValueId,
        idx: ValueId,
    },
    // Void-typed; shape queries on stores are ignored.
    Store {
        base: ValueId,
        idx: ValueId,
        val: ValueId,
    },

    Call {
        callee: String,
        args: Vec<ValueId>,
    },
}

#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub kind: ValueKind,
    pub name: String, // Diagnostic name, may be empty
    // Defining block. None for globally available values (constants,
    // parameters, undef), which dominate everything.
    pub def_block: Option<BlockId>,
}

// External function declaration carrying the attribute set required of
// reduction intrinsics: they touch no memory, cannot unwind, must stay
// cross-lane-converged and never recurse.
#[derive(Debug, Clone)]
pub struct ExternFn {
    pub name: String,
    pub no_memory_access: bool,
    pub no_throw: bool,
    pub convergent: bool,
    pub no_recurse: bool,
}

#[derive(Debug, Clone)]
pub struct FnIR {
    pub name: String,
    pub num_params: usize,
    pub blocks: Vec<Block>, // indices are BlockIds
    pub values: Vec<Value>, // indices are ValueIds
    pub entry: BlockId,
    pub externals: Vec<ExternFn>,
}

impl FnIR {
    pub fn new(name: String, num_params: usize) -> Self {
        Self {
            name,
            num_params,
            blocks: Vec::new(),
            values: Vec::new(),
            entry: 0,
            externals: Vec::new(),
        }
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(Block {
            id,
            instrs: Vec::new(),
            // Set to a real terminator when the block is finalized.
            term: Terminator::Unreachable,
        });
        id
    }

    // A floating value: no defining block, available everywhere.
    pub fn add_value(&mut self, kind: ValueKind, name: impl Into<String>) -> ValueId {
        let id = self.values.len();
        self.values.push(Value {
            id,
            kind,
            name: name.into(),
            def_block: None,
        });
        id
    }

    pub fn add_const(&mut self, c: i64) -> ValueId {
        self.add_value(ValueKind::Const(c), "")
    }

    pub fn add_undef(&mut self) -> ValueId {
        self.add_value(ValueKind::Undef, "")
    }

    pub fn add_param(&mut self, index: usize, name: impl Into<String>) -> ValueId {
        debug_assert!(index < self.num_params);
        self.add_value(ValueKind::Param { index }, name)
    }

    // Append an instruction at the end of @block (after any phis and any
    // previously appended instructions).
    pub fn append_instr(
        &mut self,
        block: BlockId,
        kind: ValueKind,
        name: impl Into<String>,
    ) -> ValueId {
        let v = self.add_value(kind, name);
        self.values[v].def_block = Some(block);
        self.blocks[block].instrs.push(v);
        v
    }

    // Insert an instruction at position @pos of @block's instruction list.
    pub fn insert_instr(
        &mut self,
        block: BlockId,
        pos: usize,
        kind: ValueKind,
        name: impl Into<String>,
    ) -> ValueId {
        let v = self.add_value(kind, name);
        self.values[v].def_block = Some(block);
        self.blocks[block].instrs.insert(pos, v);
        v
    }

    // Insert a phi at the end of @block's phi prefix.
    pub fn add_phi(
        &mut self,
        block: BlockId,
        args: Vec<(ValueId, BlockId)>,
        name: impl Into<String>,
    ) -> ValueId {
        let pos = self.first_insertion_idx(block);
        self.insert_instr(block, pos, ValueKind::Phi { args }, name)
    }

    pub fn is_phi(&self, v: ValueId) -> bool {
        matches!(self.values[v].kind, ValueKind::Phi { .. })
    }

    pub fn is_void(&self, v: ValueId) -> bool {
        matches!(self.values[v].kind, ValueKind::Store { .. })
    }

    // Index of the first non-phi slot in @block's instruction list.
    pub fn first_insertion_idx(&self, block: BlockId) -> usize {
        self.blocks[block]
            .instrs
            .iter()
            .position(|&v| !self.is_phi(v))
            .unwrap_or(self.blocks[block].instrs.len())
    }

    pub fn block_phis(&self, block: BlockId) -> Vec<ValueId> {
        self.blocks[block]
            .instrs
            .iter()
            .copied()
            .take_while(|&v| self.is_phi(v))
            .collect()
    }

    pub fn successors(&self, bid: BlockId) -> SmallVec<[BlockId; 2]> {
        match &self.blocks[bid].term {
            Terminator::Goto(t) => SmallVec::from_slice(&[*t]),
            Terminator::If {
                then_bb, else_bb, ..
            } => SmallVec::from_slice(&[*then_bb, *else_bb]),
            _ => SmallVec::new(),
        }
    }

    pub fn preds(&self, bid: BlockId) -> Vec<BlockId> {
        let mut preds = Vec::new();
        for blk in &self.blocks {
            if self.successors(blk.id).contains(&bid) {
                preds.push(blk.id);
            }
        }
        preds
    }

    // Rewrite every branch operand that targets @from to target @to instead.
    pub fn retarget_branches(&mut self, from: BlockId, to: BlockId) {
        for blk in &mut self.blocks {
            match &mut blk.term {
                Terminator::Goto(t) => {
                    if *t == from {
                        *t = to;
                    }
                }
                Terminator::If {
                    then_bb, else_bb, ..
                } => {
                    if *then_bb == from {
                        *then_bb = to;
                    }
                    if *else_bb == from {
                        *else_bb = to;
                    }
                }
                _ => {}
            }
        }
    }

    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for val in &mut self.values {
            if val.id == new {
                continue;
            }
            match &mut val.kind {
                ValueKind::Phi { args } => {
                    for (v, _) in args.iter_mut() {
                        if *v == old {
                            *v = new;
                        }
                    }
                }
                ValueKind::Binary { lhs, rhs, .. } => {
                    if *lhs == old {
                        *lhs = new;
                    }
                    if *rhs == old {
                        *rhs = new;
                    }
                }
                ValueKind::Unary { rhs, .. } => {
                    if *rhs == old {
                        *rhs = new;
                    }
                }
                ValueKind::Select {
                    cond,
                    on_true,
                    on_false,
                } => {
                    if *cond == old {
                        *cond = new;
                    }
                    if *on_true == old {
                        *on_true = new;
                    }
                    if *on_false == old {
                        *on_false = new;
                    }
                }
                ValueKind::Load { base, idx } => {
                    if *base == old {
                        *base = new;
                    }
                    if *idx == old {
                        *idx = new;
                    }
                }
                ValueKind::Store { base, idx, val } => {
                    if *base == old {
                        *base = new;
                    }
                    if *idx == old {
                        *idx = new;
                    }
                    if *val == old {
                        *val = new;
                    }
                }
                ValueKind::Call { args, .. } => {
                    for a in args.iter_mut() {
                        if *a == old {
                            *a = new;
                        }
                    }
                }
                _ => {}
            }
        }

        for blk in &mut self.blocks {
            match &mut blk.term {
                Terminator::If { cond, .. } => {
                    if *cond == old {
                        *cond = new;
                    }
                }
                Terminator::Return(Some(v)) => {
                    if *v == old {
                        *v = new;
                    }
                }
                _ => {}
            }
        }
    }

    // Detach @v from its block and turn it into a dead undef. Arena ids are
    // stable, so deletion is a tombstone.
    pub fn erase_instr(&mut self, v: ValueId) {
        if let Some(b) = self.values[v].def_block {
            self.blocks[b].instrs.retain(|&i| i != v);
        }
        self.values[v].def_block = None;
        self.values[v].kind = ValueKind::Undef;
    }

    // Move every instruction of @from to the front of @to, preserving order.
    pub fn move_instrs_to_front(&mut self, from: BlockId, to: BlockId) {
        let moved = std::mem::take(&mut self.blocks[from].instrs);
        for &v in &moved {
            self.values[v].def_block = Some(to);
        }
        let mut rest = std::mem::take(&mut self.blocks[to].instrs);
        let mut instrs = moved;
        instrs.append(&mut rest);
        self.blocks[to].instrs = instrs;
    }

    pub fn tombstone_block(&mut self, bid: BlockId) {
        debug_assert!(self.blocks[bid].instrs.is_empty());
        self.blocks[bid].term = Terminator::Unreachable;
    }

    // Get-or-declare an external function with the reduction attribute set.
    pub fn request_external(&mut self, name: &str) -> usize {
        if let Some(pos) = self.externals.iter().position(|e| e.name == name) {
            return pos;
        }
        self.externals.push(ExternFn {
            name: name.to_string(),
            no_memory_access: true,
            no_throw: true,
            convergent: true,
            no_recurse: true,
        });
        self.externals.len() - 1
    }

    pub fn value_name(&self, v: ValueId) -> String {
        let val = &self.values[v];
        if val.name.is_empty() {
            format!("v{}", v)
        } else {
            format!("{}:{}", val.name, v)
        }
    }

    pub fn block_name(&self, bid: BlockId) -> String {
        format!("bb{}", bid)
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "fn {} ({} params)", self.name, self.num_params);
        for blk in &self.blocks {
            let _ = writeln!(out, "{}:", self.block_name(blk.id));
            for &v in &blk.instrs {
                let _ = writeln!(out, "  {} = {:?}", self.value_name(v), self.values[v].kind);
            }
            let _ = writeln!(out, "  {:?}", blk.term);
        }
        out
    }
}
