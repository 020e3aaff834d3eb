//! Direct-loop fast path
//!
//! A counted loop whose body is a single integer accumulator update
//! `x = x ⊕ expr`, where `expr` is built from constants, the iteration
//! variable, and the accumulator, bypasses the general lowering: the
//! counter, end, and accumulator are each pinned to a dedicated register
//! for the whole loop, with three guarded loads before the loop and three
//! boxed stores after it. Recognition happens on the normalized IR, never
//! on raw bytecode; any shape outside this grammar falls back to the
//! general path.
//!
//! A fast trace completes cleanly (sentinel return) and resumes at the
//! loop's exit target. Its only guard exits are the three entry type checks
//! and the never-entered test, all taken before any slot is written, so
//! deoptimization needs no state restore.

use quill_core::Value;

use super::{
    AssembledTrace, Cc, MicroAsm, Patch, CLEAN_RETURN, STATE_FPR_DUMP, STATE_GPR_DUMP,
};
use crate::jit::ir::{Imm, IrInstr, IrOp, VReg};
use crate::jit::recorder::{RecordedTrace, TraceKind};

/// An operand of the accumulator expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FastVal {
    /// The loop counter (also the iteration variable).
    Counter,
    /// The accumulator.
    Acc,
    /// An integer constant.
    Const(i32),
    /// An intermediate result.
    Tmp(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FastBin {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy)]
struct FastOp {
    op: FastBin,
    a: FastVal,
    b: FastVal,
    dst: u8,
}

/// A recognized direct loop, ready for shaped emission.
pub struct FastLoopPlan {
    counter_slot: u16,
    end_slot: u16,
    iter_slot: u16,
    acc_slot: u16,
    ops: Vec<FastOp>,
    result: FastVal,
}

/// Most temporaries the expression may need (tmps are pinned too).
const MAX_TMPS: u8 = 4;

/// Pinned register assignment: counter, end, accumulator, then temporaries.
const R_COUNTER: u8 = 0;
const R_END: u8 = 1;
const R_ACC: u8 = 2;
const R_TMP_BASE: u8 = 3;

/// Try to recognize the direct-loop shape on a recorded loop trace.
pub fn recognize(trace: &RecordedTrace) -> Option<FastLoopPlan> {
    if trace.kind != TraceKind::Loop {
        return None;
    }
    let counted = trace.counted?;
    let instrs = trace.buf.instrs();
    // Header (6) + acc load/guard (2) + at least one op + store (2) + tail (4).
    if instrs.len() < 14 {
        return None;
    }
    // Exactly the four guards of the shape: counter, end, condition, acc.
    let exits = trace.buf.exits();
    if exits.len() != 4 || !exits[2].is_loop_exit {
        return None;
    }

    let (c_slot, e_slot, i_slot) = (
        counted.counter_slot as u16,
        counted.end_slot as u16,
        counted.iter_slot as u16,
    );

    // The canonical header emitted for a ForCount loop.
    let c = match (&instrs[0], &instrs[1]) {
        (
            IrInstr { op: IrOp::LoadLocal, aux, dst: raw, .. },
            IrInstr { op: IrOp::GuardInt, a, dst, .. },
        ) if *aux == c_slot && a == raw => *dst,
        _ => return None,
    };
    let e = match (&instrs[2], &instrs[3]) {
        (
            IrInstr { op: IrOp::LoadLocal, aux, dst: raw, .. },
            IrInstr { op: IrOp::GuardInt, a, dst, .. },
        ) if *aux == e_slot && a == raw => *dst,
        _ => return None,
    };
    match (&instrs[4], &instrs[5]) {
        (
            IrInstr { op: IrOp::LtInt, a, b, dst: lt, .. },
            IrInstr { op: IrOp::GuardTrue, a: cond, .. },
        ) if *a == c && *b == e && cond == lt => {}
        _ => return None,
    }
    match &instrs[6] {
        IrInstr { op: IrOp::StoreLocal, aux, a, .. } if *aux == i_slot && *a == c => {}
        _ => return None,
    }

    // Tail: ConstInt 1; AddInt(c, one); StoreLocal counter; Loop.
    let n = instrs.len();
    let one = match &instrs[n - 4] {
        IrInstr { op: IrOp::ConstInt, imm: Imm::Int(1), dst, .. } => *dst,
        _ => return None,
    };
    match (&instrs[n - 3], &instrs[n - 2], &instrs[n - 1]) {
        (
            IrInstr { op: IrOp::AddInt, a, b, dst: next, .. },
            IrInstr { op: IrOp::StoreLocal, aux, a: stored, .. },
            IrInstr { op: IrOp::Loop, .. },
        ) if *a == c && *b == one && *aux == c_slot && stored == next => {}
        _ => return None,
    }

    // Body: load/guard the accumulator, a pure integer expression over
    // {acc, counter, constants}, and a single store back to the same slot.
    let acc_slot = match (&instrs[7], &instrs[8]) {
        (
            IrInstr { op: IrOp::LoadLocal, aux, dst: raw, .. },
            IrInstr { op: IrOp::GuardInt, a, .. },
        ) if a == raw && *aux != c_slot && *aux != e_slot && *aux != i_slot => *aux,
        _ => return None,
    };
    let acc = instrs[8].dst;

    let mut map: Vec<(VReg, FastVal)> = vec![(c, FastVal::Counter), (acc, FastVal::Acc)];
    let lookup = |map: &[(VReg, FastVal)], v: VReg| {
        map.iter().rev().find(|(r, _)| *r == v).map(|&(_, val)| val)
    };

    let mut ops = Vec::new();
    let mut tmps: u8 = 0;
    let body = &instrs[9..n - 4];
    let (store, exprs) = body.split_last()?;
    for instr in exprs {
        match instr.op {
            IrOp::ConstInt => {
                let v = match instr.imm {
                    Imm::Int(v) => v as i32,
                    _ => return None,
                };
                map.push((instr.dst, FastVal::Const(v)));
            }
            IrOp::AddInt | IrOp::SubInt | IrOp::MulInt => {
                let a = lookup(&map, instr.a)?;
                let b = lookup(&map, instr.b)?;
                if tmps >= MAX_TMPS {
                    return None;
                }
                let dst = tmps;
                tmps += 1;
                ops.push(FastOp {
                    op: match instr.op {
                        IrOp::AddInt => FastBin::Add,
                        IrOp::SubInt => FastBin::Sub,
                        _ => FastBin::Mul,
                    },
                    a,
                    b,
                    dst,
                });
                map.push((instr.dst, FastVal::Tmp(dst)));
            }
            _ => return None,
        }
    }
    if ops.is_empty() {
        return None;
    }
    let result = match store {
        IrInstr { op: IrOp::StoreLocal, aux, a, .. } if *aux == acc_slot => lookup(&map, *a)?,
        _ => return None,
    };

    Some(FastLoopPlan {
        counter_slot: c_slot,
        end_slot: e_slot,
        iter_slot: i_slot,
        acc_slot,
        ops,
        result,
    })
}

fn resolve<A: MicroAsm>(asm: &mut A, val: FastVal, scratch: u8) -> u8 {
    match val {
        FastVal::Counter => R_COUNTER,
        FastVal::Acc => R_ACC,
        FastVal::Tmp(i) => R_TMP_BASE + i,
        FastVal::Const(v) => {
            asm.mov_ri(scratch, v as u32 as i64);
            scratch
        }
    }
}

/// Emit the hand-shaped loop for a recognized plan.
pub fn emit<A: MicroAsm>(
    trace: &RecordedTrace,
    plan: &FastLoopPlan,
    exit_state: u64,
) -> AssembledTrace {
    let mut asm = A::new();
    let exits = trace.buf.exits().len();
    let mut exit_patches: Vec<Vec<Patch>> = vec![Vec::new(); exits];

    asm.prologue(exit_state);

    // Guarded loads: counter, end, accumulator — once, before the loop.
    for (slot, reg, exit) in [
        (plan.counter_slot, R_COUNTER, 0usize),
        (plan.end_slot, R_END, 1),
        (plan.acc_slot, R_ACC, 3),
    ] {
        asm.load_local(reg, slot);
        asm.mov_ri(A::S1, Value::INT_BITS as i64);
        asm.xor64(A::S1, A::S1, reg);
        asm.mov_ri(A::S0, Value::INT_CHECK_MASK as i64);
        asm.and64(A::S1, A::S1, A::S0);
        asm.cmp64i(A::S1, 0);
        exit_patches[exit].push(asm.jcc(Cc::Ne));
        asm.shr64i(reg, reg, 3);
        asm.mov32_rr(reg, reg);
    }

    // Never entered: leave through the condition exit before any store.
    asm.cmp32(R_COUNTER, R_END);
    exit_patches[2].push(asm.jcc(Cc::Ge));

    let loop_top = asm.pos();
    for op in &plan.ops {
        let a = resolve(&mut asm, op.a, A::S0);
        let b = resolve(&mut asm, op.b, A::S1);
        let dst = R_TMP_BASE + op.dst;
        match op.op {
            FastBin::Add => asm.add32(dst, a, b),
            FastBin::Sub => asm.sub32(dst, a, b),
            FastBin::Mul => asm.mul32(dst, a, b),
        }
    }
    let result = resolve(&mut asm, plan.result, A::S0);
    if result != R_ACC {
        asm.mov32_rr(R_ACC, result);
    }
    asm.add32i(R_COUNTER, R_COUNTER, 1);
    asm.cmp32(R_COUNTER, R_END);
    let done = asm.jcc(Cc::Ge);
    asm.jmp_back(loop_top);
    asm.bind(done);

    // Live-out stores: accumulator, counter, and iter = counter - 1.
    for (val, slot) in [
        (R_ACC, plan.acc_slot),
        (R_COUNTER, plan.counter_slot),
    ] {
        asm.mov32_rr(A::S1, val);
        asm.shl64i(A::S1, A::S1, 3);
        asm.mov_ri(A::S0, Value::INT_BITS as i64);
        asm.or64(A::S1, A::S1, A::S0);
        asm.store_local(A::S1, slot);
    }
    asm.add32i(R_TMP_BASE, R_COUNTER, -1);
    asm.mov32_rr(A::S1, R_TMP_BASE);
    asm.shl64i(A::S1, A::S1, 3);
    asm.mov_ri(A::S0, Value::INT_BITS as i64);
    asm.or64(A::S1, A::S1, A::S0);
    asm.store_local(A::S1, plan.iter_slot);

    asm.set_return(CLEAN_RETURN as i32);
    asm.epilogue_ret();

    // Side-exit stubs, identical in shape to the general path's.
    let mut stub_offsets = Vec::with_capacity(exits);
    for (k, patches) in exit_patches.into_iter().enumerate() {
        stub_offsets.push(asm.pos() as u32);
        for p in patches {
            asm.bind(p);
        }
        for r in 0..A::NUM_GPR {
            asm.store_state(r, STATE_GPR_DUMP + r as u32 * 8);
        }
        for f in 0..A::NUM_FPR {
            asm.fstore_state(f, STATE_FPR_DUMP + f as u32 * 8);
        }
        asm.set_return(k as i32);
        asm.epilogue_ret();
    }

    AssembledTrace {
        code: asm.into_code(),
        stub_offsets,
        fast_path: true,
    }
}
