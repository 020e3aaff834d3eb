//! Trace recorder
//!
//! A single-shot automaton that shadows the interpreter for one recording
//! attempt. Each bytecode the dispatcher is about to execute is translated
//! into typed IR over virtual registers: the operand stack is simulated with
//! vregs, local slots are mapped to the vreg that currently produces them,
//! and every speculative point gets a guard with a snapshot capturing how to
//! rebuild interpreter state.
//!
//! Snapshots resume at the current *sync point*: the last PC at which the
//! simulated operand stack was empty. Statements never store to locals
//! mid-expression, so re-executing from the sync point is exact; stores are
//! written through to the slots as they happen, which keeps interpreter
//! memory correct at every guard.

use quill_core::Value;
use rustc_hash::FxHashMap;

use crate::bytecode::{Chunk, Opcode};
use crate::jit::ir::{
    Imm, IrInstr, IrOp, IrType, Snapshot, TraceBuffer, TraceLimitError, VReg,
};
use crate::jit::TraceId;
use crate::vm::interpreter::Globals;

/// Hard step bound: a recording that wanders this far without closing its
/// loop is never going to.
const MAX_RECORD_STEPS: u32 = 4096;

/// Simulated operand stack bound.
const SIM_STACK_MAX: usize = 64;

/// Why a recording attempt was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
    /// Opcode outside the JIT-supported set.
    #[error("unsupported opcode {0:?}")]
    UnsupportedOpcode(Opcode),
    /// A live value had a heap type the JIT does not trace.
    #[error("heap-typed value in trace")]
    HeapType,
    /// Operand types outside the supported numeric/bool set.
    #[error("unsupported operand types")]
    UnsupportedType,
    /// A back edge belonging to a different loop.
    #[error("inner back edge")]
    InnerBackEdge,
    /// A nested counted-loop header inside the trace.
    #[error("nested counted loop")]
    NestedLoop,
    /// The loop finished underneath the recorder (transient; retry later).
    #[error("loop exited while recording")]
    LoopExited,
    /// A guard was required after an intra-statement store.
    #[error("stack discipline violation")]
    StackDiscipline,
    /// Simulated operand stack overflow or underflow.
    #[error("simulated stack out of bounds")]
    SimStack,
    /// Read of an undefined global.
    #[error("undefined global")]
    UndefinedGlobal,
    /// An undecodable byte where an opcode was expected.
    #[error("bad bytecode")]
    BadBytecode,
    /// Recording ran too long without closing the loop.
    #[error("recording step limit")]
    TooManySteps,
    /// A trace capacity was exceeded.
    #[error(transparent)]
    Limit(#[from] TraceLimitError),
}

impl AbortReason {
    /// Hard aborts mark the header permanently uncompilable; transient ones
    /// reset its counter so it can be retried.
    pub fn is_hard(&self) -> bool {
        !matches!(self, AbortReason::LoopExited)
    }
}

/// What kind of trace is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// A loop trace entered at the loop header.
    Loop,
    /// A bridge recorded from a hot side exit of `parent`.
    Bridge {
        /// The trace whose exit this bridge extends.
        parent: TraceId,
        /// The exit index within the parent.
        exit: u16,
    },
}

/// Shape of the counted loop, when the trace began at a `ForCount` header.
#[derive(Debug, Clone, Copy)]
pub struct CountedLoop {
    /// Counter local slot.
    pub counter_slot: u8,
    /// End local slot.
    pub end_slot: u8,
    /// Iteration-variable local slot.
    pub iter_slot: u8,
}

/// A completed recording, ready for allocation and code generation.
#[derive(Debug)]
pub struct RecordedTrace {
    /// The IR, snapshots, and side exits.
    pub buf: TraceBuffer,
    /// Loop or bridge.
    pub kind: TraceKind,
    /// The loop header PC this trace belongs to.
    pub header: u32,
    /// PC at which recording started (header for loops, snapshot PC for bridges).
    pub start_pc: u32,
    /// Local types guarded on entry, re-checked every iteration.
    pub entry_types: Vec<(u8, IrType)>,
    /// Where the interpreter resumes after a clean (sentinel) return.
    pub clean_exit_pc: Option<u32>,
    /// Counted-loop shape, if recognized at the header.
    pub counted: Option<CountedLoop>,
}

/// Everything the recorder may inspect at one step. The dispatcher calls
/// [`TraceRecorder::step`] with this immediately before executing the opcode
/// at `pc`.
pub struct StepCtx<'a> {
    /// PC of the opcode about to execute.
    pub pc: usize,
    /// The chunk being executed.
    pub chunk: &'a Chunk,
    /// The current frame's stack: locals in the low slots, operand
    /// temporaries above them.
    pub frame: &'a [Value],
    /// Global bindings (read-only during recording).
    pub globals: &'a Globals,
}

/// Outcome of one recording step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep recording.
    Continue,
    /// The trace closed; take it with [`TraceRecorder::into_trace`].
    Finished,
}

/// The single-shot trace recorder.
pub struct TraceRecorder {
    buf: TraceBuffer,
    kind: TraceKind,
    header: u32,
    start_pc: u32,
    sim: Vec<VReg>,
    slots: FxHashMap<u8, (VReg, IrType)>,
    gslots: FxHashMap<u16, (VReg, IrType)>,
    sync_pc: u32,
    stores_since_sync: bool,
    entry_types: Vec<(u8, IrType)>,
    counted: Option<CountedLoop>,
    clean_exit_pc: Option<u32>,
    steps: u32,
    finished: bool,
}

impl TraceRecorder {
    /// Begin recording a loop trace at `header`.
    pub fn start_loop(header: u32) -> Self {
        Self::start(TraceKind::Loop, header, header)
    }

    /// Begin recording a bridge from a side exit, resuming at `start_pc`.
    pub fn start_bridge(parent: TraceId, exit: u16, header: u32, start_pc: u32) -> Self {
        Self::start(TraceKind::Bridge { parent, exit }, header, start_pc)
    }

    fn start(kind: TraceKind, header: u32, start_pc: u32) -> Self {
        TraceRecorder {
            buf: TraceBuffer::new(),
            kind,
            header,
            start_pc,
            sim: Vec::with_capacity(SIM_STACK_MAX),
            slots: FxHashMap::default(),
            gslots: FxHashMap::default(),
            sync_pc: start_pc,
            stores_since_sync: false,
            entry_types: Vec::new(),
            counted: None,
            clean_exit_pc: None,
            steps: 0,
            finished: false,
        }
    }

    /// The kind of trace being recorded.
    pub fn kind(&self) -> TraceKind {
        self.kind
    }

    /// The loop header this recording belongs to.
    pub fn header(&self) -> u32 {
        self.header
    }

    /// Consume the recorder after [`Step::Finished`].
    pub fn into_trace(self) -> RecordedTrace {
        debug_assert!(self.finished);
        RecordedTrace {
            buf: self.buf,
            kind: self.kind,
            header: self.header,
            start_pc: self.start_pc,
            entry_types: self.entry_types,
            clean_exit_pc: self.clean_exit_pc,
            counted: self.counted,
        }
    }

    // ===== simulated stack =====

    fn push(&mut self, v: VReg) -> Result<(), AbortReason> {
        if self.sim.len() >= SIM_STACK_MAX {
            return Err(AbortReason::SimStack);
        }
        self.sim.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<VReg, AbortReason> {
        self.sim.pop().ok_or(AbortReason::SimStack)
    }

    // ===== emission helpers =====

    fn emit(&mut self, instr: IrInstr) -> Result<(), AbortReason> {
        self.buf.emit(instr)?;
        Ok(())
    }

    fn emit_simple(&mut self, op: IrOp, ty: IrType, dst: VReg, a: VReg, b: VReg) -> Result<(), AbortReason> {
        self.emit(IrInstr { op, ty, dst, a, b, aux: 0, imm: Imm::None })
    }

    fn snapshot(&self) -> Snapshot {
        let mut slots: Vec<(u8, VReg, IrType)> = self
            .slots
            .iter()
            .map(|(&slot, &(reg, ty))| (slot, reg, ty))
            .collect();
        slots.sort_by_key(|&(slot, _, _)| slot);
        Snapshot { pc: self.sync_pc, slots }
    }

    fn guard(
        &mut self,
        op: IrOp,
        ty: IrType,
        dst: VReg,
        a: VReg,
        is_loop_exit: bool,
    ) -> Result<(), AbortReason> {
        if self.stores_since_sync {
            return Err(AbortReason::StackDiscipline);
        }
        let snap = self.snapshot();
        self.buf.emit_guard(op, ty, dst, a, snap, is_loop_exit)?;
        Ok(())
    }

    fn const_int(&mut self, n: i32) -> Result<VReg, AbortReason> {
        let dst = self.buf.new_vreg(IrType::Int)?;
        self.emit(IrInstr {
            op: IrOp::ConstInt,
            ty: IrType::Int,
            dst,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::Int(n as i64),
        })?;
        Ok(dst)
    }

    /// Load a local through the slot map, guarding its type on first touch.
    fn load_local(&mut self, ctx: &StepCtx<'_>, slot: u8) -> Result<(VReg, IrType), AbortReason> {
        if let Some(&entry) = self.slots.get(&slot) {
            return Ok(entry);
        }
        let live = *ctx.frame.get(slot as usize).ok_or(AbortReason::SimStack)?;
        let ty = IrType::from_kind(live.kind()).ok_or(AbortReason::HeapType)?;

        let raw = self.buf.new_vreg(IrType::Raw)?;
        self.emit(IrInstr {
            op: IrOp::LoadLocal,
            ty: IrType::Raw,
            dst: raw,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: slot as u16,
            imm: Imm::None,
        })?;

        let bound = match ty {
            IrType::Int => {
                let dst = self.buf.new_vreg(IrType::Int)?;
                self.guard(IrOp::GuardInt, IrType::Int, dst, raw, false)?;
                dst
            }
            IrType::Double => {
                let dst = self.buf.new_vreg(IrType::Double)?;
                self.guard(IrOp::GuardDouble, IrType::Double, dst, raw, false)?;
                dst
            }
            IrType::Bool => {
                let dst = self.buf.new_vreg(IrType::Bool)?;
                self.guard(IrOp::GuardBool, IrType::Bool, dst, raw, false)?;
                dst
            }
            IrType::Nil => {
                self.guard(IrOp::GuardNil, IrType::Nil, VReg::NONE, raw, false)?;
                let dst = self.buf.new_vreg(IrType::Nil)?;
                self.emit_simple(IrOp::ConstNil, IrType::Nil, dst, VReg::NONE, VReg::NONE)?;
                dst
            }
            IrType::Raw => return Err(AbortReason::UnsupportedType),
        };
        self.slots.insert(slot, (bound, ty));
        self.entry_types.push((slot, ty));
        Ok((bound, ty))
    }

    /// Bind a slot to a vreg and write the boxed value through to memory.
    fn store_local(&mut self, slot: u8, v: VReg) -> Result<(), AbortReason> {
        let ty = self.buf.vreg_type(v);
        if ty == IrType::Raw {
            return Err(AbortReason::UnsupportedType);
        }
        self.emit(IrInstr {
            op: IrOp::StoreLocal,
            ty,
            dst: VReg::NONE,
            a: v,
            b: VReg::NONE,
            aux: slot as u16,
            imm: Imm::None,
        })?;
        self.slots.insert(slot, (v, ty));
        self.stores_since_sync = true;
        Ok(())
    }

    fn load_global(&mut self, ctx: &StepCtx<'_>, name_idx: u8) -> Result<VReg, AbortReason> {
        let name = constant_name(ctx.chunk, name_idx).ok_or(AbortReason::UnsupportedType)?;
        let gslot = ctx.globals.resolve(name).ok_or(AbortReason::UndefinedGlobal)?;
        if let Some(&(reg, _)) = self.gslots.get(&gslot) {
            return Ok(reg);
        }
        let live = ctx.globals.values[gslot as usize];
        let ty = IrType::from_kind(live.kind()).ok_or(AbortReason::HeapType)?;

        let raw = self.buf.new_vreg(IrType::Raw)?;
        self.emit(IrInstr {
            op: IrOp::LoadGlobal,
            ty: IrType::Raw,
            dst: raw,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: gslot,
            imm: Imm::None,
        })?;
        let bound = match ty {
            IrType::Int => {
                let dst = self.buf.new_vreg(IrType::Int)?;
                self.guard(IrOp::GuardInt, IrType::Int, dst, raw, false)?;
                dst
            }
            IrType::Double => {
                let dst = self.buf.new_vreg(IrType::Double)?;
                self.guard(IrOp::GuardDouble, IrType::Double, dst, raw, false)?;
                dst
            }
            IrType::Bool => {
                let dst = self.buf.new_vreg(IrType::Bool)?;
                self.guard(IrOp::GuardBool, IrType::Bool, dst, raw, false)?;
                dst
            }
            _ => return Err(AbortReason::UnsupportedType),
        };
        self.gslots.insert(gslot, (bound, ty));
        Ok(bound)
    }

    fn store_global(&mut self, ctx: &StepCtx<'_>, name_idx: u8, v: VReg) -> Result<(), AbortReason> {
        let name = constant_name(ctx.chunk, name_idx).ok_or(AbortReason::UnsupportedType)?;
        let gslot = ctx.globals.resolve(name).ok_or(AbortReason::UndefinedGlobal)?;
        let ty = self.buf.vreg_type(v);
        if ty == IrType::Raw {
            return Err(AbortReason::UnsupportedType);
        }
        self.emit(IrInstr {
            op: IrOp::StoreGlobal,
            ty,
            dst: VReg::NONE,
            a: v,
            b: VReg::NONE,
            aux: gslot,
            imm: Imm::None,
        })?;
        self.gslots.insert(gslot, (v, ty));
        self.stores_since_sync = true;
        Ok(())
    }

    fn promote(&mut self, v: VReg) -> Result<VReg, AbortReason> {
        match self.buf.vreg_type(v) {
            IrType::Double => Ok(v),
            IrType::Int => {
                let dst = self.buf.new_vreg(IrType::Double)?;
                self.emit_simple(IrOp::IntToDouble, IrType::Double, dst, v, VReg::NONE)?;
                Ok(dst)
            }
            _ => Err(AbortReason::UnsupportedType),
        }
    }

    /// Typed binary arithmetic: both int stays int, any double widens.
    /// `dbl_op` is `None` for operations with no traced double form (modulo).
    fn binary_arith(&mut self, int_op: IrOp, dbl_op: Option<IrOp>) -> Result<(), AbortReason> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (ta, tb) = (self.buf.vreg_type(a), self.buf.vreg_type(b));
        let dst = match (ta, tb) {
            (IrType::Int, IrType::Int) => {
                if int_op == IrOp::DivInt || int_op == IrOp::ModInt {
                    self.guard(IrOp::GuardDivisor, IrType::Int, VReg::NONE, b, false)?;
                }
                let dst = self.buf.new_vreg(IrType::Int)?;
                self.emit_simple(int_op, IrType::Int, dst, a, b)?;
                dst
            }
            (IrType::Int | IrType::Double, IrType::Int | IrType::Double) => {
                let Some(dbl_op) = dbl_op else {
                    return Err(AbortReason::UnsupportedType);
                };
                let fa = self.promote(a)?;
                let fb = self.promote(b)?;
                let dst = self.buf.new_vreg(IrType::Double)?;
                self.emit_simple(dbl_op, IrType::Double, dst, fa, fb)?;
                dst
            }
            _ => return Err(AbortReason::UnsupportedType),
        };
        self.push(dst)
    }

    /// Typed comparison producing a bool vreg; result is pushed.
    fn compare(&mut self, int_op: IrOp, dbl_op: IrOp) -> Result<VReg, AbortReason> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (ta, tb) = (self.buf.vreg_type(a), self.buf.vreg_type(b));
        let dst = match (ta, tb) {
            (IrType::Int, IrType::Int) => {
                let dst = self.buf.new_vreg(IrType::Bool)?;
                self.emit_simple(int_op, IrType::Bool, dst, a, b)?;
                dst
            }
            (IrType::Bool, IrType::Bool)
                if matches!(int_op, IrOp::EqInt | IrOp::NeInt) =>
            {
                let dst = self.buf.new_vreg(IrType::Bool)?;
                self.emit_simple(int_op, IrType::Bool, dst, a, b)?;
                dst
            }
            (IrType::Int | IrType::Double, IrType::Int | IrType::Double) => {
                let fa = self.promote(a)?;
                let fb = self.promote(b)?;
                let dst = self.buf.new_vreg(IrType::Bool)?;
                self.emit_simple(dbl_op, IrType::Bool, dst, fa, fb)?;
                dst
            }
            _ => return Err(AbortReason::UnsupportedType),
        };
        self.push(dst)?;
        Ok(dst)
    }

    /// Guard a branch direction the interpreter is about to take. The
    /// condition vreg must already be popped from the simulated stack.
    fn guard_branch(&mut self, cond: VReg, taken: bool) -> Result<(), AbortReason> {
        let at_header = self.sync_pc == self.header;
        // A taken header-condition jump in a while-shaped loop means the
        // loop finished right as recording began; retry later.
        if at_header && taken && matches!(self.kind, TraceKind::Loop) && self.counted.is_none() {
            return Err(AbortReason::LoopExited);
        }
        let op = if taken { IrOp::GuardFalse } else { IrOp::GuardTrue };
        self.guard(op, IrType::Bool, VReg::NONE, cond, at_header)
    }

    // ===== the automaton =====

    /// Translate the opcode the dispatcher is about to execute.
    pub fn step(&mut self, ctx: &StepCtx<'_>) -> Result<Step, AbortReason> {
        debug_assert!(!self.finished);
        self.steps += 1;
        if self.steps > MAX_RECORD_STEPS {
            return Err(AbortReason::TooManySteps);
        }
        if self.sim.is_empty() {
            self.sync_pc = ctx.pc as u32;
            self.stores_since_sync = false;
        }

        let op = ctx.chunk.op_at(ctx.pc).ok_or(AbortReason::BadBytecode)?;
        match op {
            Opcode::Nop => {}
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = *self.sim.last().ok_or(AbortReason::SimStack)?;
                self.push(top)?;
            }

            Opcode::Nil => {
                let dst = self.buf.new_vreg(IrType::Nil)?;
                self.emit_simple(IrOp::ConstNil, IrType::Nil, dst, VReg::NONE, VReg::NONE)?;
                self.push(dst)?;
            }
            Opcode::True | Opcode::False => {
                let dst = self.buf.new_vreg(IrType::Bool)?;
                self.emit(IrInstr {
                    op: IrOp::ConstBool,
                    ty: IrType::Bool,
                    dst,
                    a: VReg::NONE,
                    b: VReg::NONE,
                    aux: 0,
                    imm: Imm::Int((op == Opcode::True) as i64),
                })?;
                self.push(dst)?;
            }
            Opcode::Constant => {
                let idx = ctx.chunk.read_u8(ctx.pc + 1) as usize;
                let value = *ctx
                    .chunk
                    .constants
                    .get(idx)
                    .ok_or(AbortReason::BadBytecode)?;
                let dst = match value.kind() {
                    quill_core::ValueKind::Int => self.const_int(value.as_int().unwrap())?,
                    quill_core::ValueKind::Double => {
                        let dst = self.buf.new_vreg(IrType::Double)?;
                        self.emit(IrInstr {
                            op: IrOp::ConstDouble,
                            ty: IrType::Double,
                            dst,
                            a: VReg::NONE,
                            b: VReg::NONE,
                            aux: idx as u16,
                            imm: Imm::Double(value.as_double().unwrap()),
                        })?;
                        dst
                    }
                    quill_core::ValueKind::Bool => {
                        let dst = self.buf.new_vreg(IrType::Bool)?;
                        self.emit(IrInstr {
                            op: IrOp::ConstBool,
                            ty: IrType::Bool,
                            dst,
                            a: VReg::NONE,
                            b: VReg::NONE,
                            aux: 0,
                            imm: Imm::Int(value.as_bool().unwrap() as i64),
                        })?;
                        dst
                    }
                    quill_core::ValueKind::Nil => {
                        let dst = self.buf.new_vreg(IrType::Nil)?;
                        self.emit_simple(IrOp::ConstNil, IrType::Nil, dst, VReg::NONE, VReg::NONE)?;
                        dst
                    }
                    quill_core::ValueKind::Obj => return Err(AbortReason::HeapType),
                };
                self.push(dst)?;
            }

            Opcode::GetLocal => {
                let slot = ctx.chunk.read_u8(ctx.pc + 1);
                let (v, _) = self.load_local(ctx, slot)?;
                self.push(v)?;
            }
            Opcode::SetLocal => {
                let slot = ctx.chunk.read_u8(ctx.pc + 1);
                let v = self.pop()?;
                self.store_local(slot, v)?;
            }
            Opcode::GetGlobal => {
                let idx = ctx.chunk.read_u8(ctx.pc + 1);
                let v = self.load_global(ctx, idx)?;
                self.push(v)?;
            }
            Opcode::SetGlobal => {
                let idx = ctx.chunk.read_u8(ctx.pc + 1);
                let v = self.pop()?;
                self.store_global(ctx, idx, v)?;
            }

            Opcode::Add => self.binary_arith(IrOp::AddInt, Some(IrOp::AddDouble))?,
            Opcode::Sub => self.binary_arith(IrOp::SubInt, Some(IrOp::SubDouble))?,
            Opcode::Mul => self.binary_arith(IrOp::MulInt, Some(IrOp::MulDouble))?,
            Opcode::Div => self.binary_arith(IrOp::DivInt, Some(IrOp::DivDouble))?,
            Opcode::Mod => self.binary_arith(IrOp::ModInt, None)?,
            Opcode::AddInt => self.int_specialized(IrOp::AddInt)?,
            Opcode::SubInt => self.int_specialized(IrOp::SubInt)?,
            Opcode::MulInt => self.int_specialized(IrOp::MulInt)?,
            Opcode::Negate => {
                let a = self.pop()?;
                match self.buf.vreg_type(a) {
                    IrType::Int => {
                        let dst = self.buf.new_vreg(IrType::Int)?;
                        self.emit_simple(IrOp::NegInt, IrType::Int, dst, a, VReg::NONE)?;
                        self.push(dst)?;
                    }
                    IrType::Double => {
                        let dst = self.buf.new_vreg(IrType::Double)?;
                        self.emit_simple(IrOp::NegDouble, IrType::Double, dst, a, VReg::NONE)?;
                        self.push(dst)?;
                    }
                    _ => return Err(AbortReason::UnsupportedType),
                }
            }
            Opcode::Not => {
                let a = self.pop()?;
                if self.buf.vreg_type(a) != IrType::Bool {
                    return Err(AbortReason::UnsupportedType);
                }
                let dst = self.buf.new_vreg(IrType::Bool)?;
                self.emit_simple(IrOp::NotBool, IrType::Bool, dst, a, VReg::NONE)?;
                self.push(dst)?;
            }

            Opcode::Equal => {
                self.compare(IrOp::EqInt, IrOp::EqDouble)?;
            }
            Opcode::NotEqual => {
                self.compare(IrOp::NeInt, IrOp::NeDouble)?;
            }
            Opcode::Less => {
                self.compare(IrOp::LtInt, IrOp::LtDouble)?;
            }
            Opcode::LessEqual => {
                self.compare(IrOp::LeInt, IrOp::LeDouble)?;
            }
            Opcode::Greater => {
                self.compare(IrOp::GtInt, IrOp::GtDouble)?;
            }
            Opcode::GreaterEqual => {
                self.compare(IrOp::GeInt, IrOp::GeDouble)?;
            }

            Opcode::Jmp => {}
            Opcode::JmpFalse => {
                let cond = self.pop()?;
                if self.buf.vreg_type(cond) != IrType::Bool {
                    return Err(AbortReason::UnsupportedType);
                }
                let live = *ctx.frame.last().ok_or(AbortReason::SimStack)?;
                let taken = !live.is_truthy();
                self.guard_branch(cond, taken)?;
            }
            Opcode::JmpIfGe => {
                let n = ctx.frame.len();
                if n < 2 {
                    return Err(AbortReason::SimStack);
                }
                let (av, bv) = (ctx.frame[n - 2], ctx.frame[n - 1]);
                let lt = self.compare(IrOp::LtInt, IrOp::LtDouble)?;
                self.pop()?; // the comparison result is consumed by the jump
                let taken = !live_less_than(av, bv)?;
                self.guard_branch(lt, taken)?;
            }
            Opcode::JmpIfNe => {
                let n = ctx.frame.len();
                if n < 2 {
                    return Err(AbortReason::SimStack);
                }
                let (av, bv) = (ctx.frame[n - 2], ctx.frame[n - 1]);
                let eq = self.compare(IrOp::EqInt, IrOp::EqDouble)?;
                self.pop()?;
                let taken = !live_equal(av, bv)?;
                self.guard_branch(eq, taken)?;
            }

            Opcode::ForCount => self.record_for_count(ctx)?,
            Opcode::Loop => return self.record_back_edge(ctx),

            Opcode::ForIter
            | Opcode::Call
            | Opcode::TailCall
            | Opcode::Invoke
            | Opcode::Ret
            | Opcode::Intrinsic
            | Opcode::Print
            | Opcode::Halt => return Err(AbortReason::UnsupportedOpcode(op)),
        }
        Ok(Step::Continue)
    }

    fn int_specialized(&mut self, op: IrOp) -> Result<(), AbortReason> {
        let b = self.pop()?;
        let a = self.pop()?;
        if self.buf.vreg_type(a) != IrType::Int || self.buf.vreg_type(b) != IrType::Int {
            return Err(AbortReason::UnsupportedType);
        }
        let dst = self.buf.new_vreg(IrType::Int)?;
        self.emit_simple(op, IrType::Int, dst, a, b)?;
        self.push(dst)
    }

    /// The counted-for header: load counter and end (with guards), test
    /// counter < end with the loop-exit guard, and copy the counter into the
    /// iteration variable.
    fn record_for_count(&mut self, ctx: &StepCtx<'_>) -> Result<(), AbortReason> {
        if ctx.pc as u32 != self.header || !matches!(self.kind, TraceKind::Loop) {
            return Err(AbortReason::NestedLoop);
        }
        let counter_slot = ctx.chunk.read_u8(ctx.pc + 1);
        let end_slot = ctx.chunk.read_u8(ctx.pc + 2);
        let iter_slot = ctx.chunk.read_u8(ctx.pc + 3);
        let exit_off = ctx.chunk.read_u16(ctx.pc + 4);

        let live_c = *ctx
            .frame
            .get(counter_slot as usize)
            .ok_or(AbortReason::SimStack)?;
        let live_e = *ctx
            .frame
            .get(end_slot as usize)
            .ok_or(AbortReason::SimStack)?;
        let (Some(c), Some(e)) = (live_c.as_int(), live_e.as_int()) else {
            return Err(AbortReason::UnsupportedType);
        };
        if c >= e {
            // Final iteration reached just as recording began.
            return Err(AbortReason::LoopExited);
        }

        let (cv, ct) = self.load_local(ctx, counter_slot)?;
        let (ev, et) = self.load_local(ctx, end_slot)?;
        if ct != IrType::Int || et != IrType::Int {
            return Err(AbortReason::UnsupportedType);
        }
        let lt = self.buf.new_vreg(IrType::Bool)?;
        self.emit_simple(IrOp::LtInt, IrType::Bool, lt, cv, ev)?;
        self.guard(IrOp::GuardTrue, IrType::Bool, VReg::NONE, lt, true)?;
        self.store_local(iter_slot, cv)?;
        // The iteration-variable store is part of the header, not a
        // statement; the next statement still syncs here.
        self.stores_since_sync = false;

        self.counted = Some(CountedLoop {
            counter_slot,
            end_slot,
            iter_slot,
        });
        self.clean_exit_pc = Some((ctx.pc + 6 + exit_off as usize) as u32);
        Ok(())
    }

    /// The back edge: increment the counter (counted loops), then close the
    /// trace — with a `Loop` back-branch for loop traces, or cleanly for
    /// bridges rejoining the header.
    fn record_back_edge(&mut self, ctx: &StepCtx<'_>) -> Result<Step, AbortReason> {
        let off = ctx.chunk.read_u16(ctx.pc + 1) as usize;
        let target = (ctx.pc + 3).wrapping_sub(off);
        if target as u32 != self.header {
            return Err(AbortReason::InnerBackEdge);
        }

        if ctx.chunk.op_at(target) == Some(Opcode::ForCount) {
            let counter_slot = ctx.chunk.read_u8(target + 1);
            let (cv, ct) = self.load_local(ctx, counter_slot)?;
            if ct != IrType::Int {
                return Err(AbortReason::UnsupportedType);
            }
            let one = self.const_int(1)?;
            let next = self.buf.new_vreg(IrType::Int)?;
            self.emit_simple(IrOp::AddInt, IrType::Int, next, cv, one)?;
            self.store_local(counter_slot, next)?;
        }

        match self.kind {
            TraceKind::Loop => {
                self.emit(IrInstr {
                    op: IrOp::Loop,
                    ty: IrType::Nil,
                    dst: VReg::NONE,
                    a: VReg::NONE,
                    b: VReg::NONE,
                    aux: 0,
                    imm: Imm::None,
                })?;
            }
            TraceKind::Bridge { .. } => {
                // A bridge completes through the back edge and resumes the
                // interpreter at the header.
                self.clean_exit_pc = Some(self.header);
            }
        }
        self.finished = true;
        Ok(Step::Finished)
    }
}

fn constant_name<'a>(chunk: &'a Chunk, idx: u8) -> Option<&'a str> {
    let v = *chunk.constants.get(idx as usize)?;
    let obj = unsafe { v.as_obj::<crate::vm::object::Obj>() }?;
    unsafe { obj.as_ref() }.as_str()
}

fn live_less_than(a: Value, b: Value) -> Result<bool, AbortReason> {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok(x < y),
        _ => Err(AbortReason::UnsupportedType),
    }
}

fn live_equal(a: Value, b: Value) -> Result<bool, AbortReason> {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok(x == y),
        _ => Ok(a == b),
    }
}
