//! Code generation driver.
//!
//! `Codegen` accumulates assembly items for a whole module: the fixed
//! preamble (origin directive, interrupt enable, entry dispatch, halt),
//! then one labeled region per function in declaration order. Instruction
//! lowering lives in `lowering.rs`.

mod lowering;

use super::frame::FrameLayout;
use super::instruction::{AsmItem, MInstr};
use super::liveness::{self, Liveness};
use super::regalloc::Allocation;
use super::signatures::SignatureTable;
use crate::ir::{Function, Module, VReg};
use crate::BackendError;
use std::collections::HashMap;

/// Emission options.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// Load address for the origin directive.
    pub origin: u16,
    /// Emit the `; comment` annotation column.
    pub annotate: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            origin: 0x0100,
            annotate: true,
        }
    }
}

pub(super) struct Codegen<'a> {
    sigs: &'a SignatureTable,
    opts: &'a EmitOptions,
    out: Vec<AsmItem>,
}

impl<'a> Codegen<'a> {
    pub fn new(sigs: &'a SignatureTable, opts: &'a EmitOptions) -> Self {
        Self {
            sigs,
            opts,
            out: Vec::new(),
        }
    }

    /// Origin directive, interrupt enable, entry dispatch, halt. The halt
    /// is what the entry function returns into.
    pub fn emit_preamble(&mut self, module: &Module) {
        self.out.push(AsmItem::plain(MInstr::Org {
            addr: self.opts.origin,
        }));
        self.out.push(AsmItem::plain(MInstr::Ei));
        if let Some(entry) = module.entry_function() {
            self.out.push(AsmItem::commented(
                MInstr::Call {
                    target: entry.name.clone(),
                },
                "entry",
            ));
        }
        self.out.push(AsmItem::plain(MInstr::Halt));
        self.out.push(AsmItem::Blank);
    }

    pub fn emit_function(
        &mut self,
        func: &Function,
        live: &Liveness,
        alloc: &Allocation,
        frame: &FrameLayout,
    ) -> Result<(), BackendError> {
        let crossings = liveness::call_crossings(func, live);
        let mut em = lowering::FuncEmitter {
            func,
            sigs: self.sigs,
            alloc,
            frame,
            crossings,
            out: &mut self.out,
            pending_saves: None,
        };
        em.emit()?;
        self.out.push(AsmItem::Blank);
        Ok(())
    }

    pub fn finish(self) -> Vec<AsmItem> {
        self.out
    }
}

/// Assembly label of a block within a function. The entry block shares
/// the function's own label.
pub(super) fn block_label(func: &Function, label: &str) -> String {
    if func.blocks[0].label == label {
        func.name.clone()
    } else {
        format!("{}__{}", func.name, label)
    }
}

/// Label of a function's shared epilogue.
pub(super) fn epilogue_label(func: &Function) -> String {
    format!("{}__ret", func.name)
}

pub(super) type CallCrossings = HashMap<(usize, usize), Vec<VReg>>;
