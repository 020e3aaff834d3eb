//! Bytecode model: opcodes and chunks
//!
//! A chunk is a flat byte vector of single-byte opcodes with inline 1/2-byte
//! operands, a parallel line-number vector, and a constant pool. The compiler
//! that produces chunks is an external collaborator; this module defines the
//! encoding the interpreter and the JIT both read.

pub mod chunk;
pub mod opcode;

pub use chunk::Chunk;
pub use opcode::Opcode;
