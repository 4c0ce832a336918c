//! VX16 compiler backend.
//!
//! Consumes a type-checked IR [`ir::Module`] and produces VX16 assembly
//! text: signature analysis, liveness, interference-graph register
//! allocation with calling-convention pinning and spilling, stack-frame
//! layout, and instruction lowering. The emitted text goes verbatim to
//! the VX16 assembler; this crate never produces binary.

pub mod backend;
pub mod ir;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{func}: call targets unknown function `{target}`")]
    UnresolvedCall { func: String, target: String },

    #[error("{func}: width class mismatch: {message}")]
    ClassMismatch { func: String, message: String },

    #[error("{func}: frame needs {required} bytes, beyond the indexed addressing range")]
    AllocationExhaustion { func: String, required: usize },

    #[error("{func}: block `{block}` has no terminator")]
    MalformedBlock { func: String, block: String },
}

pub use backend::{compile_module, compile_module_with, EmitOptions};
