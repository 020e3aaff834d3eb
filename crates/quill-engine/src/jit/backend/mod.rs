//! Native code generation
//!
//! The backend lowers trace IR to machine code through a per-architecture
//! micro-assembler (x86-64 and AArch64). Both assemblers implement the
//! [`MicroAsm`] primitive set over *bank indices* — the abstract register
//! numbers the allocator hands out — so the shared lowering walk in
//! [`lower`] and the direct-loop fast path in [`fastloop`] stay
//! architecture-neutral. Emitted bytes go through a
//! [`codebuf::CodeBuffer`] that starts read-write and is finalized
//! read-execute.

pub mod aarch64;
pub mod codebuf;
pub mod fastloop;
pub mod lower;
pub mod x86_64;

use crate::jit::recorder::RecordedTrace;
use crate::jit::regalloc::{self, Allocation, RegAllocError};

pub use codebuf::{CodeBuffer, ExecBuf};

/// Errors during code generation.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The host architecture has no assembler.
    #[error("unsupported host architecture")]
    UnsupportedHost,
    /// The trace assembled past the per-trace code limit.
    #[error("code buffer exhausted")]
    CodeTooLarge,
    /// Register allocation failed.
    #[error(transparent)]
    RegAlloc(#[from] RegAllocError),
    /// The platform refused executable memory.
    #[error("executable memory: {0}")]
    Memory(String),
}

/// Entry signature of a compiled trace:
/// `(locals base, globals values base, constants base) -> sentinel`.
/// The return value is −1 for a clean completion or the index of the side
/// exit that fired; exit state travels through the exit-state area whose
/// address is baked into the prologue.
pub type TraceEntryFn = unsafe extern "C" fn(*mut u64, *mut u64, *const u64) -> i64;

/// Sentinel returned by traces that ran to their clean completion.
pub const CLEAN_RETURN: i64 = -1;

// ===== Exit-state area layout (byte offsets) =====

/// General-register dump, indexed by bank number (16 slots).
pub const STATE_GPR_DUMP: u32 = 0;
/// Floating-point dump, indexed by bank number (8 slots).
pub const STATE_FPR_DUMP: u32 = 128;
/// Spill slots (64).
pub const STATE_SPILL: u32 = 192;
/// Division staging (divisor, then result).
pub const STATE_DIV0: u32 = 704;
/// Second division staging slot.
pub const STATE_DIV1: u32 = 712;
/// Baked f64 sign-bit mask, for float negation.
pub const STATE_NEG_MASK: u32 = 720;
/// Total size of the exit-state area in u64 words.
pub const STATE_WORDS: usize = 96;

/// Byte offset of spill slot `s`.
#[inline]
pub fn spill_off(s: u16) -> u32 {
    STATE_SPILL + (s as u32) * 8
}

/// Integer condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cc {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Signed less-than
    Lt,
    /// Signed less-or-equal
    Le,
    /// Signed greater-than
    Gt,
    /// Signed greater-or-equal
    Ge,
}

/// Floating-point comparison kinds (ordered: any NaN operand yields false,
/// except `Ne`, which yields true).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCc {
    /// a < b
    Lt,
    /// a <= b
    Le,
    /// a > b
    Gt,
    /// a >= b
    Ge,
    /// a == b
    Eq,
    /// a != b
    Ne,
}

/// A forward-branch patch site returned by `jcc`/`jmp`.
#[derive(Debug, Clone, Copy)]
pub struct Patch(pub usize);

/// The per-architecture micro-assembler.
///
/// Register operands are *bank indices*: `0..NUM_GPR` are the allocatable
/// general registers, `S0`/`S1` are the two caller-side scratch registers,
/// and the same scheme applies to the floating-point bank with `FS0`/`FS1`.
/// The pinned base registers (locals, globals, constants, exit state) are
/// not addressable by index; they are reached through the dedicated
/// load/store methods. 32-bit operations zero-extend their results on both
/// architectures.
pub trait MicroAsm {
    /// Allocatable general registers.
    const NUM_GPR: u8;
    /// Allocatable floating-point registers.
    const NUM_FPR: u8 = regalloc::NUM_FPR;
    /// First general scratch index.
    const S0: u8;
    /// Second general scratch index.
    const S1: u8;
    /// First floating-point scratch index.
    const FS0: u8;
    /// Second floating-point scratch index.
    const FS1: u8;

    /// Fresh assembler with an empty code vector.
    fn new() -> Self;
    /// Current emission offset.
    fn pos(&self) -> usize;
    /// Finish and take the code bytes.
    fn into_code(self) -> Vec<u8>;

    /// Function prologue: save callee-saved registers, pin the three
    /// argument bases, and load the exit-state base address.
    fn prologue(&mut self, exit_state: u64);
    /// Restore callee-saved registers and return.
    fn epilogue_ret(&mut self);
    /// Set the return register to a small immediate.
    fn set_return(&mut self, v: i32);

    /// 64-bit register move.
    fn mov_rr(&mut self, dst: u8, src: u8);
    /// 32-bit register move (zero-extends).
    fn mov32_rr(&mut self, dst: u8, src: u8);
    /// Load a 64-bit immediate.
    fn mov_ri(&mut self, dst: u8, imm: i64);

    /// dst = locals[slot]
    fn load_local(&mut self, dst: u8, slot: u16);
    /// locals[slot] = src
    fn store_local(&mut self, src: u8, slot: u16);
    /// dst = globals[slot]
    fn load_global(&mut self, dst: u8, slot: u16);
    /// globals[slot] = src
    fn store_global(&mut self, src: u8, slot: u16);
    /// dst = exit_state[off]
    fn load_state(&mut self, dst: u8, off: u32);
    /// exit_state[off] = src
    fn store_state(&mut self, src: u8, off: u32);
    /// FP load from the exit-state area.
    fn fload_state(&mut self, dst: u8, off: u32);
    /// FP store to the exit-state area.
    fn fstore_state(&mut self, src: u8, off: u32);

    /// dst = a + b (32-bit)
    fn add32(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a - b (32-bit)
    fn sub32(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a * b (32-bit)
    fn mul32(&mut self, dst: u8, a: u8, b: u8);
    /// dst = -a (32-bit)
    fn neg32(&mut self, dst: u8, a: u8);
    /// dst = a + imm (32-bit)
    fn add32i(&mut self, dst: u8, a: u8, imm: i32);
    /// dst = a / b, signed 32-bit, truncated. The implementation saves and
    /// restores any registers its ISA uses implicitly.
    fn sdiv32(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a % b, signed 32-bit, sign follows the dividend.
    fn srem32(&mut self, dst: u8, a: u8, b: u8);

    /// dst = a & b (64-bit)
    fn and64(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a | b (64-bit)
    fn or64(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a ^ b (64-bit)
    fn xor64(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a ^ imm (32-bit)
    fn xor32i(&mut self, dst: u8, a: u8, imm: i32);
    /// dst = a & imm (64-bit, sign-extended immediate)
    fn and64i(&mut self, dst: u8, a: u8, imm: i32);
    /// dst = a << sh (64-bit)
    fn shl64i(&mut self, dst: u8, a: u8, sh: u8);
    /// dst = a >> sh (64-bit, logical)
    fn shr64i(&mut self, dst: u8, a: u8, sh: u8);

    /// Compare two 32-bit registers (sets flags).
    fn cmp32(&mut self, a: u8, b: u8);
    /// Compare a 32-bit register with an immediate.
    fn cmp32i(&mut self, a: u8, imm: i32);
    /// Compare two 64-bit registers.
    fn cmp64(&mut self, a: u8, b: u8);
    /// Compare a 64-bit register with a sign-extended immediate.
    fn cmp64i(&mut self, a: u8, imm: i32);
    /// dst = flags satisfy cc (0 or 1, zero-extended).
    fn setcc(&mut self, dst: u8, cc: Cc);

    /// Forward conditional branch; patch later with [`MicroAsm::bind`].
    fn jcc(&mut self, cc: Cc) -> Patch;
    /// Forward unconditional branch.
    fn jmp(&mut self) -> Patch;
    /// Backward unconditional branch to a known offset.
    fn jmp_back(&mut self, target: usize);
    /// Resolve a forward branch to the current position.
    fn bind(&mut self, p: Patch);

    /// FP move from a general register (raw bits).
    fn fmov_from_gpr(&mut self, dst: u8, src: u8);
    /// General register from FP (raw bits).
    fn fmov_to_gpr(&mut self, dst: u8, src: u8);
    /// FP register move.
    fn fmov(&mut self, dst: u8, src: u8);
    /// dst = a + b
    fn fadd(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a - b
    fn fsub(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a * b
    fn fmul(&mut self, dst: u8, a: u8, b: u8);
    /// dst = a / b
    fn fdiv(&mut self, dst: u8, a: u8, b: u8);
    /// dst = -a (reads the baked sign mask from the exit-state area where
    /// the ISA has no direct negate)
    fn fneg(&mut self, dst: u8, a: u8);
    /// dst(gpr) = compare a and b per `cc` (may clobber `S1`; its register
    /// arguments are always floating-point, so no caller value is at risk).
    fn fcmp_set(&mut self, dst: u8, a: u8, b: u8, cc: FCc);
    /// dst(fp) = (double) src(gpr, signed 32-bit)
    fn cvt_i32_f64(&mut self, dst: u8, src: u8);
}

/// Output of assembling one trace.
pub struct AssembledTrace {
    /// Raw machine code.
    pub code: Vec<u8>,
    /// Stub offset per side exit, in exit order.
    pub stub_offsets: Vec<u32>,
    /// Whether the direct-loop fast path produced this code.
    pub fast_path: bool,
}

/// A compiled, executable trace body.
pub struct TraceCode {
    /// Owning executable mapping.
    pub buf: ExecBuf,
    /// Entry function pointer into the mapping.
    pub entry: TraceEntryFn,
    /// Stub offset per side exit.
    pub stub_offsets: Vec<u32>,
    /// Whether the fast path was used.
    pub fast_path: bool,
}

/// Assemble and publish one trace for the host architecture.
///
/// Tries the direct-loop fast path first; anything outside its grammar goes
/// through register allocation and the general lowering walk.
pub fn compile_trace(
    trace: &RecordedTrace,
    exit_state: *mut u64,
) -> Result<(TraceCode, Option<Allocation>), CodegenError> {
    let (assembled, alloc) = assemble_host(trace, exit_state as u64)?;
    if assembled.code.len() > crate::jit::ir::MAX_CODE_BYTES {
        return Err(CodegenError::CodeTooLarge);
    }

    let mut cb = CodeBuffer::with_capacity(assembled.code.len())?;
    cb.write(&assembled.code)?;
    let buf = cb.finalize()?;
    // Safety: the buffer was just published read-execute and the prologue
    // begins at offset zero with the TraceEntryFn ABI.
    let entry: TraceEntryFn = unsafe { std::mem::transmute(buf.ptr()) };
    Ok((
        TraceCode {
            buf,
            entry,
            stub_offsets: assembled.stub_offsets,
            fast_path: assembled.fast_path,
        },
        alloc,
    ))
}

#[cfg(target_arch = "x86_64")]
fn assemble_host(
    trace: &RecordedTrace,
    exit_state: u64,
) -> Result<(AssembledTrace, Option<Allocation>), CodegenError> {
    assemble::<x86_64::X64Asm>(trace, exit_state)
}

#[cfg(target_arch = "aarch64")]
fn assemble_host(
    trace: &RecordedTrace,
    exit_state: u64,
) -> Result<(AssembledTrace, Option<Allocation>), CodegenError> {
    assemble::<aarch64::A64Asm>(trace, exit_state)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn assemble_host(
    _trace: &RecordedTrace,
    _exit_state: u64,
) -> Result<(AssembledTrace, Option<Allocation>), CodegenError> {
    Err(CodegenError::UnsupportedHost)
}

#[allow(dead_code)] // unreferenced on hosts without an assembler
fn assemble<A: MicroAsm>(
    trace: &RecordedTrace,
    exit_state: u64,
) -> Result<(AssembledTrace, Option<Allocation>), CodegenError> {
    if let Some(plan) = fastloop::recognize(trace) {
        let assembled = fastloop::emit::<A>(trace, &plan, exit_state);
        return Ok((assembled, None));
    }
    let alloc = regalloc::allocate(&trace.buf, A::NUM_GPR)?;
    let assembled = lower::compile::<A>(trace, &alloc, exit_state);
    Ok((assembled, Some(alloc)))
}
