//! IR-to-native lowering
//!
//! Walks the trace IR in index order, mapping each typed opcode onto the
//! micro-assembler primitives. Guards lower to a compare plus a conditional
//! branch into a per-exit stub emitted after the body; each stub dumps both
//! register banks into the exit-state area, loads its exit index as the
//! return value, and returns. The `Loop` op closes the trace with an
//! unconditional back-branch to the first body instruction, so entry guards
//! re-run every iteration and loop state is carried through the slots.
//!
//! Operands are staged through the two scratch registers when they live in
//! spill slots; scratch lifetimes are confined to a single IR instruction.

use quill_core::Value;

use super::{
    spill_off, AssembledTrace, Cc, FCc, MicroAsm, Patch, CLEAN_RETURN, STATE_FPR_DUMP,
    STATE_GPR_DUMP,
};
use crate::jit::ir::{Imm, IrOp, IrType, TraceBuffer, VReg};
use crate::jit::recorder::{RecordedTrace, TraceKind};
use crate::jit::regalloc::{Allocation, Loc};

/// Everything-but-the-payload-bit mask for boolean words.
const BOOL_CHECK_MASK: u64 = !(1u64 << 3);

struct Lowerer<'a, A: MicroAsm> {
    asm: A,
    buf: &'a TraceBuffer,
    alloc: &'a Allocation,
    exit_patches: Vec<Vec<Patch>>,
    next_exit: usize,
}

impl<'a, A: MicroAsm> Lowerer<'a, A> {
    /// Register holding `v`'s value, staging from spill through `scratch`.
    fn gpr_src(&mut self, v: VReg, idx: u32, scratch: u8) -> u8 {
        match self.alloc.loc_at(v, idx) {
            Loc::Gpr(r) => r,
            Loc::Spill(s) => {
                self.asm.load_state(scratch, spill_off(s));
                scratch
            }
            Loc::Fpr(_) => unreachable!("gpr operand allocated to the fp bank"),
        }
    }

    fn fpr_src(&mut self, v: VReg, idx: u32, scratch: u8) -> u8 {
        match self.alloc.loc_at(v, idx) {
            Loc::Fpr(r) => r,
            Loc::Spill(s) => {
                self.asm.fload_state(scratch, spill_off(s));
                scratch
            }
            Loc::Gpr(_) => unreachable!("fp operand allocated to the integer bank"),
        }
    }

    /// Register to compute `v` into, plus the spill slot to store afterward.
    fn gpr_dst(&mut self, v: VReg, idx: u32) -> (u8, Option<u16>) {
        match self.alloc.loc_at(v, idx) {
            Loc::Gpr(r) => (r, None),
            Loc::Spill(s) => (A::S0, Some(s)),
            Loc::Fpr(_) => unreachable!(),
        }
    }

    fn fpr_dst(&mut self, v: VReg, idx: u32) -> (u8, Option<u16>) {
        match self.alloc.loc_at(v, idx) {
            Loc::Fpr(r) => (r, None),
            Loc::Spill(s) => (A::FS0, Some(s)),
            Loc::Gpr(_) => unreachable!(),
        }
    }

    fn finish_gpr(&mut self, reg: u8, spill: Option<u16>) {
        if let Some(s) = spill {
            self.asm.store_state(reg, spill_off(s));
        }
    }

    fn finish_fpr(&mut self, reg: u8, spill: Option<u16>) {
        if let Some(s) = spill {
            self.asm.fstore_state(reg, spill_off(s));
        }
    }

    /// Route a guard branch to the next side exit's stub.
    fn to_exit(&mut self, p: Patch) {
        self.exit_patches[self.next_exit].push(p);
    }

    fn end_guard(&mut self) {
        self.next_exit += 1;
    }

    /// Box the value in `src`'s location as `ty` and store it via `store`.
    /// Clobbers both scratch registers.
    fn box_and_store(&mut self, src: VReg, ty: IrType, idx: u32, slot: u16, global: bool) {
        match ty {
            IrType::Int | IrType::Bool => {
                let base = if ty == IrType::Int {
                    Value::INT_BITS
                } else {
                    Value::FALSE_BITS
                };
                let r = self.gpr_src(src, idx, A::S0);
                self.asm.mov32_rr(A::S1, r); // zero-extend; frees the source
                self.asm.shl64i(A::S1, A::S1, 3);
                self.asm.mov_ri(A::S0, base as i64);
                self.asm.or64(A::S1, A::S1, A::S0);
                self.store_slot(A::S1, slot, global);
            }
            IrType::Double => {
                let f = self.fpr_src(src, idx, A::FS0);
                self.asm.fmov_to_gpr(A::S0, f);
                self.store_slot(A::S0, slot, global);
            }
            IrType::Nil => {
                self.asm.mov_ri(A::S0, Value::NIL_BITS as i64);
                self.store_slot(A::S0, slot, global);
            }
            IrType::Raw => {
                let r = self.gpr_src(src, idx, A::S0);
                self.store_slot(r, slot, global);
            }
        }
    }

    fn store_slot(&mut self, reg: u8, slot: u16, global: bool) {
        if global {
            self.asm.store_global(reg, slot);
        } else {
            self.asm.store_local(reg, slot);
        }
    }

    /// The shared boxed-word type check: branches to the next exit when
    /// `((ra ^ expect) & mask) != 0` (or `== 0` when `fail_on_eq`).
    fn check_tagged(&mut self, ra: u8, expect: u64, mask: Option<u64>, fail_on_eq: bool) {
        self.asm.mov_ri(A::S1, expect as i64);
        self.asm.xor64(A::S1, A::S1, ra);
        if let Some(m) = mask {
            self.asm.mov_ri(A::S0, m as i64);
            self.asm.and64(A::S1, A::S1, A::S0);
        }
        self.asm.cmp64i(A::S1, 0);
        let p = self.asm.jcc(if fail_on_eq { Cc::Eq } else { Cc::Ne });
        self.to_exit(p);
    }

    fn lower_instr(&mut self, idx: u32) {
        let instr = self.buf.instrs()[idx as usize];
        match instr.op {
            IrOp::ConstInt => {
                let v = match instr.imm {
                    Imm::Int(v) => v as i32,
                    _ => 0,
                };
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                self.asm.mov_ri(d, v as u32 as i64);
                self.finish_gpr(d, sp);
            }
            IrOp::ConstBool => {
                let v = match instr.imm {
                    Imm::Int(v) => v,
                    _ => 0,
                };
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                self.asm.mov_ri(d, v);
                self.finish_gpr(d, sp);
            }
            IrOp::ConstNil => {
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                self.asm.mov_ri(d, 0);
                self.finish_gpr(d, sp);
            }
            IrOp::ConstDouble => {
                let bits = match instr.imm {
                    Imm::Double(v) => v.to_bits(),
                    _ => 0,
                };
                let (fd, fsp) = self.fpr_dst(instr.dst, idx);
                self.asm.mov_ri(A::S0, bits as i64);
                self.asm.fmov_from_gpr(fd, A::S0);
                self.finish_fpr(fd, fsp);
            }

            IrOp::LoadLocal | IrOp::LoadGlobal => {
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                if instr.op == IrOp::LoadLocal {
                    self.asm.load_local(d, instr.aux);
                } else {
                    self.asm.load_global(d, instr.aux);
                }
                self.finish_gpr(d, sp);
            }
            IrOp::StoreLocal => {
                self.box_and_store(instr.a, instr.ty, idx, instr.aux, false);
            }
            IrOp::StoreGlobal => {
                self.box_and_store(instr.a, instr.ty, idx, instr.aux, true);
            }

            IrOp::GuardInt => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                // Checked pattern: ((ra ^ INT_BITS) & INT_CHECK_MASK) == 0.
                self.asm.mov_ri(A::S1, Value::INT_BITS as i64);
                self.asm.xor64(A::S1, A::S1, ra);
                // Unbox before the mask constant so S0 can be reused.
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                let stage = if sp.is_some() { A::S0 } else { d };
                self.asm.shr64i(stage, ra, 3);
                self.asm.mov32_rr(stage, stage);
                self.finish_gpr(stage, sp);
                self.asm.mov_ri(A::S0, Value::INT_CHECK_MASK as i64);
                self.asm.and64(A::S1, A::S1, A::S0);
                self.asm.cmp64i(A::S1, 0);
                let p = self.asm.jcc(Cc::Ne);
                self.to_exit(p);
                self.end_guard();
            }
            IrOp::GuardDouble => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                let (fd, fsp) = self.fpr_dst(instr.dst, idx);
                self.asm.fmov_from_gpr(fd, ra);
                self.finish_fpr(fd, fsp);
                // A word is boxed (not a double) iff (ra & QNAN) == QNAN.
                self.check_tagged(ra, Value::QNAN, Some(Value::QNAN), true);
                self.end_guard();
            }
            IrOp::GuardBool => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                self.asm.mov_ri(A::S1, Value::FALSE_BITS as i64);
                self.asm.xor64(A::S1, A::S1, ra);
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                let stage = if sp.is_some() { A::S0 } else { d };
                self.asm.shr64i(stage, ra, 3);
                self.asm.and64i(stage, stage, 1);
                self.finish_gpr(stage, sp);
                self.asm.mov_ri(A::S0, BOOL_CHECK_MASK as i64);
                self.asm.and64(A::S1, A::S1, A::S0);
                self.asm.cmp64i(A::S1, 0);
                let p = self.asm.jcc(Cc::Ne);
                self.to_exit(p);
                self.end_guard();
            }
            IrOp::GuardNil => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                self.check_tagged(ra, Value::NIL_BITS, None, false);
                self.end_guard();
            }
            IrOp::GuardTrue => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                self.asm.cmp32i(ra, 0);
                let p = self.asm.jcc(Cc::Eq);
                self.to_exit(p);
                self.end_guard();
            }
            IrOp::GuardFalse => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                self.asm.cmp32i(ra, 0);
                let p = self.asm.jcc(Cc::Ne);
                self.to_exit(p);
                self.end_guard();
            }
            IrOp::GuardDivisor => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                self.asm.cmp32i(ra, 0);
                let p = self.asm.jcc(Cc::Eq);
                self.to_exit(p);
                self.asm.cmp32i(ra, -1);
                let p = self.asm.jcc(Cc::Eq);
                self.to_exit(p);
                self.end_guard();
            }

            IrOp::AddInt | IrOp::SubInt | IrOp::MulInt | IrOp::DivInt | IrOp::ModInt => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                let rb = self.gpr_src(instr.b, idx, A::S1);
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                match instr.op {
                    IrOp::AddInt => self.asm.add32(d, ra, rb),
                    IrOp::SubInt => self.asm.sub32(d, ra, rb),
                    IrOp::MulInt => self.asm.mul32(d, ra, rb),
                    IrOp::DivInt => self.asm.sdiv32(d, ra, rb),
                    _ => self.asm.srem32(d, ra, rb),
                }
                self.finish_gpr(d, sp);
            }
            IrOp::NegInt => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                self.asm.neg32(d, ra);
                self.finish_gpr(d, sp);
            }
            IrOp::NotBool => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                self.asm.xor32i(d, ra, 1);
                self.finish_gpr(d, sp);
            }

            IrOp::AddDouble | IrOp::SubDouble | IrOp::MulDouble | IrOp::DivDouble => {
                let fa = self.fpr_src(instr.a, idx, A::FS0);
                let fb = self.fpr_src(instr.b, idx, A::FS1);
                let (fd, fsp) = self.fpr_dst(instr.dst, idx);
                match instr.op {
                    IrOp::AddDouble => self.asm.fadd(fd, fa, fb),
                    IrOp::SubDouble => self.asm.fsub(fd, fa, fb),
                    IrOp::MulDouble => self.asm.fmul(fd, fa, fb),
                    _ => self.asm.fdiv(fd, fa, fb),
                }
                self.finish_fpr(fd, fsp);
            }
            IrOp::NegDouble => {
                let fa = self.fpr_src(instr.a, idx, A::FS0);
                let (fd, fsp) = self.fpr_dst(instr.dst, idx);
                self.asm.fneg(fd, fa);
                self.finish_fpr(fd, fsp);
            }
            IrOp::IntToDouble => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                let (fd, fsp) = self.fpr_dst(instr.dst, idx);
                self.asm.cvt_i32_f64(fd, ra);
                self.finish_fpr(fd, fsp);
            }

            IrOp::LtInt | IrOp::LeInt | IrOp::GtInt | IrOp::GeInt | IrOp::EqInt | IrOp::NeInt => {
                let ra = self.gpr_src(instr.a, idx, A::S0);
                let rb = self.gpr_src(instr.b, idx, A::S1);
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                self.asm.cmp32(ra, rb);
                let cc = match instr.op {
                    IrOp::LtInt => Cc::Lt,
                    IrOp::LeInt => Cc::Le,
                    IrOp::GtInt => Cc::Gt,
                    IrOp::GeInt => Cc::Ge,
                    IrOp::EqInt => Cc::Eq,
                    _ => Cc::Ne,
                };
                self.asm.setcc(d, cc);
                self.finish_gpr(d, sp);
            }
            IrOp::LtDouble
            | IrOp::LeDouble
            | IrOp::GtDouble
            | IrOp::GeDouble
            | IrOp::EqDouble
            | IrOp::NeDouble => {
                let fa = self.fpr_src(instr.a, idx, A::FS0);
                let fb = self.fpr_src(instr.b, idx, A::FS1);
                let (d, sp) = self.gpr_dst(instr.dst, idx);
                let cc = match instr.op {
                    IrOp::LtDouble => FCc::Lt,
                    IrOp::LeDouble => FCc::Le,
                    IrOp::GtDouble => FCc::Gt,
                    IrOp::GeDouble => FCc::Ge,
                    IrOp::EqDouble => FCc::Eq,
                    _ => FCc::Ne,
                };
                self.asm.fcmp_set(d, fa, fb, cc);
                self.finish_gpr(d, sp);
            }

            IrOp::Loop => {
                // Handled by the caller, which knows the loop-top offset.
                unreachable!("Loop is lowered by compile()");
            }
        }
    }
}

/// Lower a recorded trace through the general path.
pub fn compile<A: MicroAsm>(
    trace: &RecordedTrace,
    alloc: &Allocation,
    exit_state: u64,
) -> AssembledTrace {
    let buf = &trace.buf;
    let mut lw = Lowerer::<A> {
        asm: A::new(),
        buf,
        alloc,
        exit_patches: vec![Vec::new(); buf.exits().len()],
        next_exit: 0,
    };

    lw.asm.prologue(exit_state);
    let loop_top = lw.asm.pos();

    let mut evictions = alloc.evictions.iter().peekable();
    for idx in 0..buf.instrs().len() as u32 {
        while let Some(ev) = evictions.peek() {
            if ev.at != idx {
                break;
            }
            match ev.loc {
                Loc::Gpr(r) => lw.asm.store_state(r, spill_off(ev.slot)),
                Loc::Fpr(f) => lw.asm.fstore_state(f, spill_off(ev.slot)),
                Loc::Spill(_) => {}
            }
            evictions.next();
        }

        if buf.instrs()[idx as usize].op == IrOp::Loop {
            lw.asm.jmp_back(loop_top);
        } else {
            lw.lower_instr(idx);
        }
    }

    if matches!(trace.kind, TraceKind::Bridge { .. }) {
        // Bridges fall through the back edge and resume at the header.
        lw.asm.set_return(CLEAN_RETURN as i32);
        lw.asm.epilogue_ret();
    }

    // Side-exit stubs: dump both banks, report the exit index, return.
    let mut stub_offsets = Vec::with_capacity(buf.exits().len());
    let Lowerer {
        mut asm,
        exit_patches,
        ..
    } = lw;
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
        fast_path: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::backend::x86_64::X64Asm;
    use crate::jit::ir::{Imm, IrInstr, Snapshot};
    use crate::jit::recorder::{CountedLoop, RecordedTrace, TraceKind};
    use crate::jit::regalloc::allocate;

    /// Build the canonical counted-increment trace by hand:
    /// load/guard counter and end, test, store iter, add 1 to a local,
    /// increment the counter, loop.
    fn counted_trace() -> RecordedTrace {
        let mut buf = TraceBuffer::new();
        let snap = |pc: u32| Snapshot { pc, slots: vec![] };

        let craw = buf.new_vreg(IrType::Raw).unwrap();
        buf.emit(IrInstr {
            op: IrOp::LoadLocal,
            ty: IrType::Raw,
            dst: craw,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::None,
        })
        .unwrap();
        let c = buf.new_vreg(IrType::Int).unwrap();
        buf.emit_guard(IrOp::GuardInt, IrType::Int, c, craw, snap(0), false)
            .unwrap();

        let eraw = buf.new_vreg(IrType::Raw).unwrap();
        buf.emit(IrInstr {
            op: IrOp::LoadLocal,
            ty: IrType::Raw,
            dst: eraw,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: 1,
            imm: Imm::None,
        })
        .unwrap();
        let e = buf.new_vreg(IrType::Int).unwrap();
        buf.emit_guard(IrOp::GuardInt, IrType::Int, e, eraw, snap(0), false)
            .unwrap();

        let lt = buf.new_vreg(IrType::Bool).unwrap();
        buf.emit(IrInstr {
            op: IrOp::LtInt,
            ty: IrType::Bool,
            dst: lt,
            a: c,
            b: e,
            aux: 0,
            imm: Imm::None,
        })
        .unwrap();
        buf.emit_guard(IrOp::GuardTrue, IrType::Bool, VReg::NONE, lt, snap(0), true)
            .unwrap();

        // iter = counter
        buf.emit(IrInstr {
            op: IrOp::StoreLocal,
            ty: IrType::Int,
            dst: VReg::NONE,
            a: c,
            b: VReg::NONE,
            aux: 2,
            imm: Imm::None,
        })
        .unwrap();

        // counter += 1, written through
        let one = buf.new_vreg(IrType::Int).unwrap();
        buf.emit(IrInstr {
            op: IrOp::ConstInt,
            ty: IrType::Int,
            dst: one,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::Int(1),
        })
        .unwrap();
        let next = buf.new_vreg(IrType::Int).unwrap();
        buf.emit(IrInstr {
            op: IrOp::AddInt,
            ty: IrType::Int,
            dst: next,
            a: c,
            b: one,
            aux: 0,
            imm: Imm::None,
        })
        .unwrap();
        buf.emit(IrInstr {
            op: IrOp::StoreLocal,
            ty: IrType::Int,
            dst: VReg::NONE,
            a: next,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::None,
        })
        .unwrap();
        buf.emit(IrInstr {
            op: IrOp::Loop,
            ty: IrType::Nil,
            dst: VReg::NONE,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::None,
        })
        .unwrap();

        RecordedTrace {
            buf,
            kind: TraceKind::Loop,
            header: 0,
            start_pc: 0,
            entry_types: vec![(0, IrType::Int), (1, IrType::Int)],
            clean_exit_pc: Some(99),
            counted: Some(CountedLoop {
                counter_slot: 0,
                end_slot: 1,
                iter_slot: 2,
            }),
        }
    }

    #[test]
    fn test_lowering_produces_stub_per_exit() {
        let trace = counted_trace();
        let alloc = allocate(&trace.buf, X64Asm::NUM_GPR).unwrap();
        let assembled = compile::<X64Asm>(&trace, &alloc, 0x1000);
        assert_eq!(assembled.stub_offsets.len(), trace.buf.exits().len());
        assert!(!assembled.fast_path);
        assert!(!assembled.code.is_empty());
        // Stubs come after the body, in exit order.
        for w in assembled.stub_offsets.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!((assembled.stub_offsets[0] as usize) < assembled.code.len());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_counted_trace_runs_to_loop_exit() {
        use crate::jit::backend::{CodeBuffer, TraceEntryFn, STATE_WORDS};

        let trace = counted_trace();
        let alloc = allocate(&trace.buf, X64Asm::NUM_GPR).unwrap();
        let mut state = vec![0u64; STATE_WORDS].into_boxed_slice();
        let assembled = compile::<X64Asm>(&trace, &alloc, state.as_mut_ptr() as u64);

        let mut cb = CodeBuffer::with_capacity(assembled.code.len()).unwrap();
        cb.write(&assembled.code).unwrap();
        let exec = cb.finalize().unwrap();
        let entry: TraceEntryFn = unsafe { std::mem::transmute(exec.ptr()) };

        let mut locals = [
            Value::int(3).raw(),
            Value::int(10).raw(),
            Value::nil().raw(),
        ];
        let r = unsafe { entry(locals.as_mut_ptr(), std::ptr::null_mut(), std::ptr::null()) };

        // The loop ran natively until counter == end, then left through the
        // loop-condition guard (exit 2: the two type guards come first).
        assert_eq!(r, 2);
        let counter = unsafe { Value::from_raw(locals[0]) };
        let iter = unsafe { Value::from_raw(locals[2]) };
        assert_eq!(counter.as_int(), Some(10));
        assert_eq!(iter.as_int(), Some(9));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_type_guard_exits_without_touching_locals() {
        use crate::jit::backend::{CodeBuffer, TraceEntryFn, STATE_WORDS};

        let trace = counted_trace();
        let alloc = allocate(&trace.buf, X64Asm::NUM_GPR).unwrap();
        let mut state = vec![0u64; STATE_WORDS].into_boxed_slice();
        let assembled = compile::<X64Asm>(&trace, &alloc, state.as_mut_ptr() as u64);

        let mut cb = CodeBuffer::with_capacity(assembled.code.len()).unwrap();
        cb.write(&assembled.code).unwrap();
        let exec = cb.finalize().unwrap();
        let entry: TraceEntryFn = unsafe { std::mem::transmute(exec.ptr()) };

        // A double where the counter's int guard expects an int.
        let mut locals = [
            Value::double(1.5).raw(),
            Value::int(10).raw(),
            Value::nil().raw(),
        ];
        let r = unsafe { entry(locals.as_mut_ptr(), std::ptr::null_mut(), std::ptr::null()) };
        assert_eq!(r, 0, "the first type guard must fire");
        assert_eq!(unsafe { Value::from_raw(locals[0]) }.as_double(), Some(1.5));
        assert!(unsafe { Value::from_raw(locals[2]) }.is_nil());
    }
}
