//! Trace IR (SSA form)
//!
//! The recorder translates the bytecode actually taken through one loop
//! iteration into this linear, typed IR. Instructions are flat records over
//! virtual registers; guards carry snapshot indices so every speculative
//! point can be unwound back into the interpreter.

pub mod buffer;
pub mod display;
pub mod instr;
pub mod types;

pub use buffer::{SideExit, Snapshot, TraceBuffer, TraceLimitError};
pub use instr::{Imm, IrInstr, IrOp, VReg};
pub use types::IrType;

/// Maximum IR instructions per trace.
pub const MAX_TRACE_INSTRS: usize = 512;
/// Maximum virtual registers per trace.
pub const MAX_VREGS: usize = 256;
/// Maximum snapshots per trace.
pub const MAX_SNAPSHOTS: usize = 64;
/// Maximum side exits per trace.
pub const MAX_SIDE_EXITS: usize = 32;
/// Maximum code bytes per compiled trace.
pub const MAX_CODE_BYTES: usize = 16 * 1024;
