//! basalt: a method-at-a-time AMD64 JIT (and reference interpreter)
//! for a small block-structured SSA bytecode.
//!
//! The loader decodes a binary program into [`vm::Program`]; the
//! interpreter in [`vm`] executes it directly, while [`jit`] lowers each
//! function to a linear IR, runs lifetime analysis and a linear-scan
//! register allocator with splitting, and emits AMD64 machine code into
//! an executable code heap. Functions are compiled on first call
//! through per-slot trampolines.

pub mod config;
pub mod fixtures;
pub mod jit;
pub mod logging;
pub mod vm;

pub use config::Options;
pub use jit::JitEngine;
pub use vm::InterpretEngine;
