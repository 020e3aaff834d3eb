//! Quill language engine: bytecode VM and tracing JIT compiler
//!
//! The engine is organized in three layers:
//! - `bytecode`: the flat instruction encoding and chunk model
//! - `vm`: the object model, heap, and the bytecode dispatcher
//! - `jit`: the tracing just-in-time compiler (hot-loop detection, trace
//!   recording into SSA IR, linear-scan register allocation, native code
//!   generation for x86-64 and AArch64, and the trace executor with
//!   deoptimization back into the dispatcher)

#![warn(rust_2018_idioms)]

pub mod bytecode;
pub mod jit;
pub mod vm;

pub use bytecode::{Chunk, Opcode};
pub use jit::{JitConfig, JitContext};
pub use vm::{Vm, VmError, VmOptions};
