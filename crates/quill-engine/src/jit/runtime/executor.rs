//! Trace execution and deoptimization
//!
//! Invokes a compiled entry point and decodes its sentinel: a clean return
//! resumes after the loop, a side-exit index triggers deoptimization. The
//! deopt handler rebuilds interpreter state from the exit's snapshot,
//! reading each vreg's value out of the register dump (or spill slot) the
//! exit stub wrote into the exit-state area, boxing it by recorded type,
//! and writing it into the local slot.

use quill_core::Value;

use super::trace::CompiledTrace;
use super::ExitState;
use crate::jit::backend::CLEAN_RETURN;
use crate::jit::ir::IrType;
use crate::jit::regalloc::Loc;

/// What a single native invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The trace ran to its clean completion.
    Clean,
    /// The given side exit fired.
    Exit(u16),
}

/// Call the compiled entry once.
///
/// # Safety
///
/// `locals`, `globals`, and `consts` must point at live storage laid out as
/// the trace was recorded against (the current frame's slots, the globals
/// values array, and the chunk constants).
pub unsafe fn run(
    trace: &CompiledTrace,
    locals: *mut Value,
    globals: *mut Value,
    consts: *const Value,
) -> RunOutcome {
    let ret = (trace.code.entry)(locals as *mut u64, globals as *mut u64, consts as *const u64);
    if ret == CLEAN_RETURN {
        RunOutcome::Clean
    } else {
        RunOutcome::Exit(ret as u16)
    }
}

/// Restore interpreter state for a fired exit and return the resume PC.
///
/// Slot stores in trace IR write through as they execute, so memory is
/// already exact at every guard; the restore walks the snapshot anyway,
/// boxing each recorded vreg out of the dump. This is what keeps the
/// direct-register paths (and any future store-sinking) honest.
///
/// # Safety
///
/// `locals` must point at the frame the trace was entered with.
pub unsafe fn restore_snapshot(
    trace: &CompiledTrace,
    exit: u16,
    state: &ExitState,
    locals: *mut Value,
) -> u32 {
    let exit_rt = &trace.exits[exit as usize];
    let snapshot = &trace.ir.snapshots()[exit_rt.snapshot as usize];

    // Direct-loop traces hoist their guards above the loop, before any slot
    // (including the iteration variable) is written; their exits resume at
    // the header, where entry state is still exact.
    let Some(alloc) = &trace.alloc else {
        return trace.entry_pc;
    };

    for &(slot, vreg, ty) in &snapshot.slots {
        let bits = match alloc.loc_at(vreg, exit_rt.guard_ir_idx) {
            Loc::Gpr(r) => state.gpr(r),
            Loc::Fpr(f) => state.fpr(f),
            Loc::Spill(s) => state.spill(s),
        };
        let value = match ty {
            IrType::Int => Value::int(bits as u32 as i32),
            IrType::Double => Value::double(f64::from_bits(bits)),
            IrType::Bool => Value::bool(bits & 1 != 0),
            IrType::Nil => Value::nil(),
            // Raw never appears in snapshots; keep the bits if it does.
            IrType::Raw => Value::from_raw(bits),
        };
        *locals.add(slot as usize) = value;
    }

    snapshot.pc
}
