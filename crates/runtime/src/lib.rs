//! szl-runtime: the bytecode execution engine of the szl runtime
//!
//! A compiled program (bytecode, function descriptors, literal pool, trap
//! ranges, output tables) is executed one input record at a time by a
//! Process, which owns its heap, value stack and counters. Results flow
//! to the aggregation layer through the Emitter interface.
//!
//! Key design principles:
//! - Program: immutable after link, shared read-only by every Process
//! - Process: owns everything mutable; nothing is shared between them
//! - Traps: recoverable language-level failures, handled at dispatch
//!   boundaries through the statically-registered trap ranges

pub mod code;
pub mod convop;
pub mod engine;
pub mod frame;
pub mod opcode;
pub mod outputter;
pub mod process;
pub mod program;
pub mod proto;
pub mod report;

// Re-export the surface a driver needs.
pub use code::{Code, CodeBuffer, disassemble};
pub use convop::ConversionOp;
pub use engine::execute;
pub use opcode::Opcode;
pub use outputter::{Emitter, GroupKind, RecordingEmitter};
pub use process::{Process, ProcessConfig, Status};
pub use program::{
    FunctionDescr, NativeFn, OutputTable, Program, ProgramBuilder, TableKind, TrapRange,
};
pub use report::{ProcessStats, maybe_report};

// The value system is part of the public surface.
pub use szl_core as core;
