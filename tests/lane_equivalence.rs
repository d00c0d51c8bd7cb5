use lanec::analyze::MaskAnalysis;
use lanec::ir::def::*;
use lanec::ir::{Region, eval};
use lanec::vectorize::{self, VecInfo, VectorMapping, VectorShape};

fn seed_missing_masks(f: &FnIR, masks: &mut MaskAnalysis, all_true: ValueId) {
    for bid in 0..f.blocks.len() {
        for idx in 0..f.successors(bid).len() {
            if masks.exit_mask(bid, idx).is_none() {
                masks.set_exit_mask(bid, idx, all_true);
            }
        }
    }
}

// W independent scalar runs of the original against one lockstep run of the
// linearized function, over the same memory image.
fn assert_lanes_match(
    original: &FnIR,
    transformed: &FnIR,
    lane_args: &[Vec<i64>],
    mem: Vec<i64>,
) -> Vec<i64> {
    let width = lane_args[0].len();

    let mut scalar_mem = mem.clone();
    let mut scalar_rets = Vec::with_capacity(width);
    for lane in 0..width {
        let args: Vec<i64> = lane_args.iter().map(|v| v[lane]).collect();
        let (ret, out_mem) = eval::run_scalar(original, &args, scalar_mem).expect("scalar run");
        scalar_mem = out_mem;
        scalar_rets.push(ret.expect("kernel returns a value"));
    }

    let (ret, vec_mem) = eval::run_lockstep(transformed, lane_args, mem).expect("lockstep run");
    let ret = ret.expect("kernel returns a value");

    assert_eq!(ret, scalar_rets, "per-lane results diverge from scalar runs");
    assert_eq!(vec_mem, scalar_mem, "memory effects diverge from scalar runs");
    ret
}

// Scenario: if-then-else on a varying condition, both arms reaching one
// store through the folded merge.
#[test]
fn varying_if_else_matches_scalar_lanes() {
    let mut f = FnIR::new("blend".to_string(), 3);
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    f.entry = b0;

    let x = f.add_param(0, "x");
    let out_base = f.add_param(1, "out");
    let lid = f.add_param(2, "lid");
    let zero = f.add_const(0);
    let two = f.add_const(2);
    let ten = f.add_const(10);

    let cond = f.append_instr(
        b0,
        ValueKind::Binary {
            op: BinOp::Lt,
            lhs: x,
            rhs: zero,
        },
        "cond",
    );
    let not_cond = f.append_instr(
        b0,
        ValueKind::Unary {
            op: UnaryOp::Not,
            rhs: cond,
        },
        "not_cond",
    );
    f.blocks[b0].term = Terminator::If {
        cond,
        then_bb: b1,
        else_bb: b2,
    };

    let v_then = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::Mul,
            lhs: x,
            rhs: two,
        },
        "v_then",
    );
    f.blocks[b1].term = Terminator::Goto(b3);

    let v_else = f.append_instr(
        b2,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: x,
            rhs: ten,
        },
        "v_else",
    );
    f.blocks[b2].term = Terminator::Goto(b3);

    let m = f.add_phi(b3, vec![(v_then, b1), (v_else, b2)], "m");
    f.append_instr(
        b3,
        ValueKind::Store {
            base: out_base,
            idx: lid,
            val: m,
        },
        "st",
    );
    f.blocks[b3].term = Terminator::Return(Some(m));

    let mut masks = MaskAnalysis::new();
    masks.set_exit_mask(b0, 0, cond);
    masks.set_exit_mask(b0, 1, not_cond);
    masks.set_exit_mask(b1, 0, cond);
    masks.set_exit_mask(b2, 0, not_cond);
    let all_true = f.add_const(1);
    seed_missing_masks(&f, &mut masks, all_true);

    let region = Region::whole_function(&f);
    let mut vec_info = VecInfo::new(region, VectorMapping::new("blend", 4));
    for v in [x, lid, cond, m] {
        vec_info.set_shape(&f, v, VectorShape::varying());
    }
    vec_info.set_shape(&f, out_base, VectorShape::uni());

    let original = f.clone();
    vectorize::linearize(&mut f, &mut vec_info, &mut masks).expect("linearize");

    let lane_args = vec![
        vec![-1, 2, -3, 4],
        vec![0, 0, 0, 0],
        vec![0, 1, 2, 3],
    ];
    let mem = vec![0i64; 8];
    let ret = assert_lanes_match(&original, &f, &lane_args, mem);
    assert_eq!(ret, vec![-2, 12, -6, 14]);
}

// Scenario: while-loop with a per-lane exit iteration; the loop runs until
// every lane found its zero, and the tracked index matches the scalar scan.
#[test]
fn varying_while_exit_matches_scalar_lanes() {
    let mut f = FnIR::new("scan".to_string(), 2);
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    f.entry = b0;

    let a_base = f.add_param(0, "a");
    let lid = f.add_param(1, "lid");
    let one = f.add_const(1);
    let zero = f.add_const(0);

    f.blocks[b0].term = Terminator::Goto(b1);

    let i_phi = f.add_phi(b1, vec![(lid, b0)], "i");
    let live = f.add_phi(b1, vec![(one, b0)], "live");
    let av = f.append_instr(
        b1,
        ValueKind::Load {
            base: a_base,
            idx: i_phi,
        },
        "av",
    );
    let c = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::Ne,
            lhs: av,
            rhs: zero,
        },
        "c",
    );
    let not_c = f.append_instr(
        b1,
        ValueKind::Unary {
            op: UnaryOp::Not,
            rhs: c,
        },
        "not_c",
    );
    let exiting = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: live,
            rhs: not_c,
        },
        "exiting",
    );
    let live1 = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: live,
            rhs: c,
        },
        "live1",
    );
    f.blocks[b1].term = Terminator::If {
        cond: c,
        then_bb: b2,
        else_bb: b3,
    };

    let i1 = f.append_instr(
        b2,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: i_phi,
            rhs: one,
        },
        "i1",
    );
    f.blocks[b2].term = Terminator::Goto(b1);

    if let ValueKind::Phi { args } = &mut f.values[i_phi].kind {
        args.push((i1, b2));
    }
    if let ValueKind::Phi { args } = &mut f.values[live].kind {
        args.push((live1, b2));
    }

    let lc = f.add_phi(b3, vec![(i_phi, b1)], "lc");
    f.blocks[b3].term = Terminator::Return(Some(lc));

    let mut masks = MaskAnalysis::new();
    masks.set_exit_mask(b1, 0, live1);
    masks.set_exit_mask(b1, 1, exiting);
    masks.set_exit_mask(b2, 0, live1);
    masks.set_combined_loop_exit_mask(b1, exiting);
    let all_true = f.add_const(1);
    seed_missing_masks(&f, &mut masks, all_true);

    let region = Region::whole_function(&f);
    let mut vec_info = VecInfo::new(region, VectorMapping::new("scan", 4));
    for v in [lid, i_phi, live, av, c, not_c, exiting, live1, lc] {
        vec_info.set_shape(&f, v, VectorShape::varying());
    }
    vec_info.set_shape(&f, a_base, VectorShape::uni());
    vec_info.add_divergent_loop(b1);
    vec_info.add_divergent_loop_exit(b3);

    let original = f.clone();
    vectorize::linearize(&mut f, &mut vec_info, &mut masks).expect("linearize");

    // Dead lanes keep walking until the last lane finds its zero; the pad
    // keeps those speculative reads in bounds.
    let mut mem = vec![0i64; 16];
    mem[..4].copy_from_slice(&[0, 1, 1, 0]);
    let lane_args = vec![vec![0, 0, 0, 0], vec![0, 1, 2, 3]];
    assert_lanes_match(&original, &f, &lane_args, mem);
}

// Scenario: uniform outer loop, divergent inner loop, accumulator live-out.
// With three outer rounds and inner bounds [1, 2, 3, 4] the accumulator
// lands on [3, 6, 9, 12].
#[test]
fn nested_divergent_loop_accumulates_per_lane() {
    let mut f = FnIR::new("nested_acc".to_string(), 3);
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    let b4 = f.add_block();
    let b5 = f.add_block();
    let b6 = f.add_block();
    let b7 = f.add_block();
    f.entry = b0;

    let bound_base = f.add_param(0, "bounds");
    let n = f.add_param(1, "n");
    let lid = f.add_param(2, "lid");
    let zero = f.add_const(0);
    let one = f.add_const(1);

    f.blocks[b0].term = Terminator::Goto(b1);

    // Outer header: uniform trip count.
    let j_phi = f.add_phi(b1, vec![(zero, b0)], "j");
    let s_phi = f.add_phi(b1, vec![(zero, b0)], "s");
    let cj = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::Lt,
            lhs: j_phi,
            rhs: n,
        },
        "cj",
    );
    f.blocks[b1].term = Terminator::If {
        cond: cj,
        then_bb: b2,
        else_bb: b7,
    };

    // Inner pre-header.
    let bl = f.append_instr(
        b2,
        ValueKind::Load {
            base: bound_base,
            idx: lid,
        },
        "bl",
    );
    f.blocks[b2].term = Terminator::Goto(b3);

    // Inner header: per-lane trip count.
    let k_phi = f.add_phi(b3, vec![(zero, b2)], "k");
    let si_phi = f.add_phi(b3, vec![(s_phi, b2)], "si");
    let lm_phi = f.add_phi(b3, vec![(one, b2)], "lm");
    let ck = f.append_instr(
        b3,
        ValueKind::Binary {
            op: BinOp::Lt,
            lhs: k_phi,
            rhs: bl,
        },
        "ck",
    );
    let nck = f.append_instr(
        b3,
        ValueKind::Unary {
            op: UnaryOp::Not,
            rhs: ck,
        },
        "nck",
    );
    let e_m = f.append_instr(
        b3,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: lm_phi,
            rhs: nck,
        },
        "e_m",
    );
    let ln = f.append_instr(
        b3,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: lm_phi,
            rhs: ck,
        },
        "ln",
    );
    f.blocks[b3].term = Terminator::If {
        cond: ck,
        then_bb: b4,
        else_bb: b5,
    };

    // Inner latch.
    let k1 = f.append_instr(
        b4,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: k_phi,
            rhs: one,
        },
        "k1",
    );
    let si1 = f.append_instr(
        b4,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: si_phi,
            rhs: one,
        },
        "si1",
    );
    f.blocks[b4].term = Terminator::Goto(b3);

    if let ValueKind::Phi { args } = &mut f.values[k_phi].kind {
        args.push((k1, b4));
    }
    if let ValueKind::Phi { args } = &mut f.values[si_phi].kind {
        args.push((si1, b4));
    }
    if let ValueKind::Phi { args } = &mut f.values[lm_phi].kind {
        args.push((ln, b4));
    }

    // Inner exit, closed accumulator.
    let s_lc = f.add_phi(b5, vec![(si_phi, b3)], "s_lc");
    f.blocks[b5].term = Terminator::Goto(b6);

    // Outer latch.
    let j1 = f.append_instr(
        b6,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: j_phi,
            rhs: one,
        },
        "j1",
    );
    f.blocks[b6].term = Terminator::Goto(b1);

    if let ValueKind::Phi { args } = &mut f.values[j_phi].kind {
        args.push((j1, b6));
    }
    if let ValueKind::Phi { args } = &mut f.values[s_phi].kind {
        args.push((s_lc, b6));
    }

    // Outer exit.
    let s_out = f.add_phi(b7, vec![(s_phi, b1)], "s_out");
    f.blocks[b7].term = Terminator::Return(Some(s_out));

    let mut masks = MaskAnalysis::new();
    masks.set_exit_mask(b3, 0, ln);
    masks.set_exit_mask(b3, 1, e_m);
    masks.set_exit_mask(b4, 0, ln);
    masks.set_combined_loop_exit_mask(b3, e_m);
    let all_true = f.add_const(1);
    seed_missing_masks(&f, &mut masks, all_true);

    let region = Region::whole_function(&f);
    let mut vec_info = VecInfo::new(region, VectorMapping::new("nested_acc", 4));
    for v in [lid, bl, k_phi, si_phi, lm_phi, ck, nck, e_m, ln, s_lc] {
        vec_info.set_shape(&f, v, VectorShape::varying());
    }
    for v in [n, j_phi, cj] {
        vec_info.set_shape(&f, v, VectorShape::uni());
    }
    vec_info.set_shape(&f, s_phi, VectorShape::varying());
    vec_info.set_shape(&f, s_out, VectorShape::varying());
    vec_info.add_divergent_loop(b3);
    vec_info.add_divergent_loop_exit(b5);

    let original = f.clone();
    vectorize::linearize(&mut f, &mut vec_info, &mut masks).expect("linearize");

    let mut mem = vec![0i64; 8];
    mem[..4].copy_from_slice(&[1, 2, 3, 4]);
    let lane_args = vec![
        vec![0, 0, 0, 0],
        vec![3, 3, 3, 3],
        vec![0, 1, 2, 3],
    ];
    let ret = assert_lanes_match(&original, &f, &lane_args, mem);
    assert_eq!(ret, vec![3, 6, 9, 12]);
}

// Scenario: strided reduction with a pinned accumulator shape. The loop is
// uniform, so linearization keeps the CFG; the lanes accumulate interleaved
// partial sums.
#[test]
fn pinned_reduction_keeps_lane_local_partial_sums() {
    let mut f = FnIR::new("reduce".to_string(), 3);
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    f.entry = b0;

    let a_base = f.add_param(0, "a");
    let n = f.add_param(1, "n");
    let lid = f.add_param(2, "lid");
    let zero = f.add_const(0);
    let one = f.add_const(1);
    let width = f.add_const(4);

    f.blocks[b0].term = Terminator::Goto(b1);

    let k_phi = f.add_phi(b1, vec![(zero, b0)], "k");
    let s_phi = f.add_phi(b1, vec![(zero, b0)], "sum");
    let ck = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::Lt,
            lhs: k_phi,
            rhs: n,
        },
        "ck",
    );
    f.blocks[b1].term = Terminator::If {
        cond: ck,
        then_bb: b2,
        else_bb: b3,
    };

    let kw = f.append_instr(
        b2,
        ValueKind::Binary {
            op: BinOp::Mul,
            lhs: k_phi,
            rhs: width,
        },
        "kw",
    );
    let ix = f.append_instr(
        b2,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: kw,
            rhs: lid,
        },
        "ix",
    );
    let av = f.append_instr(
        b2,
        ValueKind::Load {
            base: a_base,
            idx: ix,
        },
        "av",
    );
    let s1 = f.append_instr(
        b2,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: s_phi,
            rhs: av,
        },
        "s1",
    );
    let k1 = f.append_instr(
        b2,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: k_phi,
            rhs: one,
        },
        "k1",
    );
    f.blocks[b2].term = Terminator::Goto(b1);

    if let ValueKind::Phi { args } = &mut f.values[k_phi].kind {
        args.push((k1, b2));
    }
    if let ValueKind::Phi { args } = &mut f.values[s_phi].kind {
        args.push((s1, b2));
    }

    let s_lc = f.add_phi(b3, vec![(s_phi, b1)], "s_lc");
    f.blocks[b3].term = Terminator::Return(Some(s_lc));

    let mut masks = MaskAnalysis::new();
    let all_true = f.add_const(1);
    seed_missing_masks(&f, &mut masks, all_true);

    let region = Region::whole_function(&f);
    let mut vec_info = VecInfo::new(region, VectorMapping::new("reduce", 4));
    vec_info.set_shape(&f, ck, VectorShape::uni());
    vec_info.set_shape(&f, k_phi, VectorShape::uni());
    vec_info.set_shape(&f, ix, VectorShape::cont());
    vec_info.pin_with_shape(&f, s_phi, VectorShape::varying());

    // Pinned shapes shrug off later updates.
    vec_info.set_shape(&f, s_phi, VectorShape::uni());
    assert_eq!(vec_info.get_shape(s_phi), VectorShape::varying());

    let original = f.clone();
    vectorize::linearize(&mut f, &mut vec_info, &mut masks).expect("linearize");

    // Uniform loop: the CFG survives linearization unchanged.
    assert_eq!(
        f.blocks[b1].term,
        Terminator::If {
            cond: ck,
            then_bb: b2,
            else_bb: b3
        }
    );

    let mem: Vec<i64> = (1..=12).collect();
    let lane_args = vec![
        vec![0, 0, 0, 0],
        vec![3, 3, 3, 3],
        vec![0, 1, 2, 3],
    ];
    let ret = assert_lanes_match(&original, &f, &lane_args, mem);
    // Lane j accumulates a[j] + a[4 + j] + a[8 + j].
    assert_eq!(ret, vec![1 + 5 + 9, 2 + 6 + 10, 3 + 7 + 11, 4 + 8 + 12]);
}

// Scenario: the live-out is defined in one arm of a varying branch inside
// the loop; promotion threads it to the latch before tracking.
#[test]
fn promoted_live_out_matches_scalar_lanes() {
    let mut f = FnIR::new("armed_exit".to_string(), 2);
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    let b4 = f.add_block();
    let b5 = f.add_block();
    f.entry = b0;

    let a_base = f.add_param(0, "a");
    let lid = f.add_param(1, "lid");
    let zero = f.add_const(0);
    let one = f.add_const(1);
    let three = f.add_const(3);
    let five = f.add_const(5);

    f.blocks[b0].term = Terminator::Goto(b1);

    let i_phi = f.add_phi(b1, vec![(lid, b0)], "i");
    let live = f.add_phi(b1, vec![(one, b0)], "live");
    let av = f.append_instr(
        b1,
        ValueKind::Load {
            base: a_base,
            idx: i_phi,
        },
        "av",
    );
    let c1 = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::Gt,
            lhs: av,
            rhs: zero,
        },
        "c1",
    );
    let c2 = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::Gt,
            lhs: av,
            rhs: five,
        },
        "c2",
    );
    let p2 = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: live,
            rhs: c1,
        },
        "p2",
    );
    let not_c1 = f.append_instr(
        b1,
        ValueKind::Unary {
            op: UnaryOp::Not,
            rhs: c1,
        },
        "not_c1",
    );
    let p3 = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: live,
            rhs: not_c1,
        },
        "p3",
    );
    let exiting = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: p2,
            rhs: c2,
        },
        "exiting",
    );
    let not_exiting = f.append_instr(
        b1,
        ValueKind::Unary {
            op: UnaryOp::Not,
            rhs: exiting,
        },
        "not_exiting",
    );
    let live1 = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: live,
            rhs: not_exiting,
        },
        "live1",
    );
    let cont2 = f.append_instr(
        b1,
        ValueKind::Binary {
            op: BinOp::And,
            lhs: p2,
            rhs: not_exiting,
        },
        "cont2",
    );
    f.blocks[b1].term = Terminator::If {
        cond: c1,
        then_bb: b2,
        else_bb: b3,
    };

    let v = f.append_instr(
        b2,
        ValueKind::Binary {
            op: BinOp::Mul,
            lhs: i_phi,
            rhs: three,
        },
        "v",
    );
    f.blocks[b2].term = Terminator::If {
        cond: c2,
        then_bb: b5,
        else_bb: b4,
    };

    f.blocks[b3].term = Terminator::Goto(b4);

    let i1 = f.append_instr(
        b4,
        ValueKind::Binary {
            op: BinOp::Add,
            lhs: i_phi,
            rhs: one,
        },
        "i1",
    );
    f.blocks[b4].term = Terminator::Goto(b1);

    if let ValueKind::Phi { args } = &mut f.values[i_phi].kind {
        args.push((i1, b4));
    }
    if let ValueKind::Phi { args } = &mut f.values[live].kind {
        args.push((live1, b4));
    }

    let d_phi = f.add_phi(b5, vec![(v, b2)], "d");
    f.blocks[b5].term = Terminator::Return(Some(d_phi));

    let mut masks = MaskAnalysis::new();
    masks.set_exit_mask(b1, 0, p2);
    masks.set_exit_mask(b1, 1, p3);
    masks.set_exit_mask(b2, 0, exiting);
    masks.set_exit_mask(b2, 1, cont2);
    masks.set_exit_mask(b3, 0, p3);
    masks.set_exit_mask(b4, 0, live1);
    masks.set_combined_loop_exit_mask(b1, exiting);
    let all_true = f.add_const(1);
    seed_missing_masks(&f, &mut masks, all_true);

    let region = Region::whole_function(&f);
    let mut vec_info = VecInfo::new(region, VectorMapping::new("armed_exit", 4));
    for val in [
        lid, i_phi, live, av, c1, c2, p2, p3, exiting, not_exiting, live1, cont2, v, d_phi,
    ] {
        vec_info.set_shape(&f, val, VectorShape::varying());
    }
    vec_info.set_shape(&f, a_base, VectorShape::uni());
    vec_info.add_divergent_loop(b1);
    vec_info.add_divergent_loop_exit(b5);

    let original = f.clone();
    vectorize::linearize(&mut f, &mut vec_info, &mut masks).expect("linearize");

    // Every lane eventually reads a value above five; the tail padding keeps
    // dead-lane reads in bounds while slower lanes finish.
    let mut mem = vec![12i64; 16];
    mem[..8].copy_from_slice(&[0, 6, 1, 7, 9, 2, 8, 11]);
    let lane_args = vec![vec![0, 0, 0, 0], vec![0, 1, 2, 3]];
    let ret = assert_lanes_match(&original, &f, &lane_args, mem);
    assert_eq!(ret, vec![3, 3, 9, 9]);
}
