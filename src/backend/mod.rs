//! VX16 backend — lowers typed IR to VX16 assembly.
//!
//! Module layout:
//! - `abi`          — register files and calling-convention constants
//! - `instruction`  — typed machine instructions and assembly output items
//! - `signatures`   — module-wide signature and call-site analysis
//! - `liveness`     — dataflow liveness over the CFG
//! - `interference` — interference-graph construction
//! - `regalloc`     — graph-coloring register allocation
//! - `frame`        — stack-frame layout
//! - `codegen`      — instruction lowering and module emission
//! - `optimize`     — assembly-level peephole passes
//!
//! The pipeline is a deterministic batch transformation: the signature
//! table is built first (functions may call functions declared later),
//! then each function independently runs liveness → interference →
//! allocation → frame layout → lowering.

pub mod abi;
mod codegen;
pub mod frame;
pub mod instruction;
pub mod interference;
pub mod liveness;
mod optimize;
pub mod regalloc;
pub mod signatures;

pub use codegen::EmitOptions;

use crate::ir::{Function, Instr, Module};
use crate::BackendError;

/// Compile a module to VX16 assembly text with default options.
pub fn compile_module(module: &Module) -> Result<String, BackendError> {
    compile_module_with(module, &EmitOptions::default())
}

/// Compile a module to VX16 assembly text.
pub fn compile_module_with(
    module: &Module,
    opts: &EmitOptions,
) -> Result<String, BackendError> {
    let sigs = signatures::analyze(module)?;

    let mut cg = codegen::Codegen::new(&sigs, opts);
    cg.emit_preamble(module);
    for func in &module.functions {
        validate(func)?;
        let live = liveness::analyze(func);
        let graph = interference::build(func, &live);
        let alloc = regalloc::allocate(func, &graph);
        let frame = frame::layout(func, &alloc)?;
        cg.emit_function(func, &live, &alloc, &frame)?;
    }

    let mut items = cg.finish();
    optimize::run(&mut items);
    Ok(instruction::flatten(&items, opts.annotate))
}

/// Structural checks on a function's CFG. Malformed input is rejected,
/// never repaired.
fn validate(func: &Function) -> Result<(), BackendError> {
    if func.blocks.is_empty() {
        return Err(BackendError::MalformedBlock {
            func: func.name.clone(),
            block: "<none>".into(),
        });
    }
    for (bi, block) in func.blocks.iter().enumerate() {
        let malformed = || BackendError::MalformedBlock {
            func: func.name.clone(),
            block: block.label.clone(),
        };

        let Some(last) = block.instrs.last() else {
            return Err(malformed());
        };
        if !last.is_terminator() {
            return Err(malformed());
        }
        // Control flow may only appear in terminal position.
        for instr in &block.instrs[..block.instrs.len() - 1] {
            if matches!(
                instr,
                Instr::Branch { .. } | Instr::BranchIf { .. } | Instr::Ret { .. } | Instr::Halt
            ) {
                return Err(malformed());
            }
        }
        // Fallthrough off the end of the function.
        let falls_through = matches!(last, Instr::BranchIf { .. } | Instr::Call { .. });
        if falls_through && bi + 1 == func.blocks.len() {
            return Err(malformed());
        }
        // Branch targets must name blocks of this function.
        for instr in &block.instrs {
            let target = match instr {
                Instr::Branch { target } | Instr::BranchIf { target, .. } => Some(target),
                _ => None,
            };
            if let Some(t) = target {
                if func.block_index(t).is_none() {
                    return Err(malformed());
                }
            }
        }
    }
    Ok(())
}
