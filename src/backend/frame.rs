//! Stack-frame layout.
//!
//! Computed once per function, after allocation and before emission.
//! The stack grows downward and `sp` is the frame base: spill slots sit
//! at `sp+0 .. sp+frame_size`, saved callee-saved registers above them,
//! then the return address, then any stack-passed parameters. Every
//! frame access the emitter produces is `sp + constant`; the pointer
//! itself only ever moves by one exact arithmetic adjustment in the
//! prologue and one in the epilogue.
//!
//! ```text
//!     incoming stack params   sp + frame_size + saved + 2 ..
//!     return address          sp + frame_size + saved
//!     saved callee-saved      sp + frame_size ..
//!     spill slots             sp + 0 ..
//! sp ->
//! ```

use super::abi::{PhysReg, MAX_INDEXED_OFFSET, RETURN_ADDR_SIZE};
use super::regalloc::{Allocation, Home};
use crate::ir::{Function, VReg};
use crate::BackendError;
use std::collections::HashMap;

#[derive(Debug)]
pub struct FrameLayout {
    /// Bytes of spill area; what the prologue subtracts from `sp`.
    pub frame_size: u16,
    /// Callee-saved registers the prologue pushes, in push order.
    pub saved_callee: Vec<PhysReg>,
    /// `sp`-relative offsets of spilled registers.
    slot_offsets: HashMap<VReg, u16>,
    /// `sp`-relative offsets of stack-passed parameters.
    param_offsets: HashMap<VReg, u16>,
}

impl FrameLayout {
    /// Frame offset of a memory-homed register, whichever table holds it.
    pub fn offset_of(&self, v: VReg) -> Option<u16> {
        self.slot_offsets
            .get(&v)
            .or_else(|| self.param_offsets.get(&v))
            .copied()
    }
}

pub fn layout(func: &Function, alloc: &Allocation) -> Result<FrameLayout, BackendError> {
    // Spill slots: word-class registers first so their slots stay at even
    // offsets, then byte-class; ascending id within each group.
    let mut slot_offsets = HashMap::new();
    let mut next: u16 = 0;
    for wide in [true, false] {
        for (i, home) in alloc.homes.iter().enumerate() {
            let v = VReg(i as u32);
            if !matches!(home, Home::Spill) {
                continue;
            }
            let size = func.class_of(v).size();
            if (size == 2) != wide {
                continue;
            }
            slot_offsets.insert(v, next);
            next += size;
        }
    }
    let frame_size = next;

    let saved_callee = alloc.used_callee_saved.clone();
    let saved_bytes: u16 = saved_callee.iter().map(|r| r.push_size()).sum();

    // Stack-passed parameters sit above the return address, laid out in
    // declaration order from low to high addresses (the caller pushes
    // them in reverse).
    let mut param_offsets = HashMap::new();
    let mut cum: u16 = frame_size + saved_bytes + RETURN_ADDR_SIZE;
    for &p in &func.params {
        if matches!(alloc.home(p), Home::StackParam) {
            param_offsets.insert(p, cum);
            cum += func.class_of(p).size();
        }
    }

    let required = cum;
    if required > MAX_INDEXED_OFFSET {
        return Err(BackendError::AllocationExhaustion {
            func: func.name.clone(),
            required: required as usize,
        });
    }

    log::debug!(
        "{}: frame {} bytes, {} saved callee-saved, {} stack params",
        func.name,
        frame_size,
        saved_callee.len(),
        param_offsets.len()
    );

    Ok(FrameLayout {
        frame_size,
        saved_callee,
        slot_offsets,
        param_offsets,
    })
}
