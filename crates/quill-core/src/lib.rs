//! Quill core value representation
//!
//! This crate provides the 64-bit NaN-boxed `Value` word that the bytecode
//! interpreter, the trace recorder, and the generated native code all agree
//! on. It is deliberately free of dependencies: every other layer of the
//! runtime builds on these bit patterns.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod value;

pub use value::{Value, ValueKind};
