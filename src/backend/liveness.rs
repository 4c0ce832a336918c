//! Liveness analysis over a function's CFG.
//!
//! Computes per-block live-in/live-out sets with an iterative backward
//! dataflow fixed point, visiting blocks in reverse declaration order
//! (successors tend to come later) and iterating to convergence. CFGs
//! here are small — loop back-edges are the only source of extra rounds.

use crate::ir::{Function, Instr, VReg};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};

pub struct Liveness {
    /// Per block index: registers live on entry.
    pub live_in: Vec<HashSet<VReg>>,
    /// Per block index: registers live on exit.
    pub live_out: Vec<HashSet<VReg>>,
}

/// Successor block indices of block `bi`, derived from its terminator.
/// `BranchIf` and a trailing `Call` fall through to the next block.
pub fn successors(func: &Function, bi: usize) -> SmallVec<[usize; 2]> {
    let mut out = SmallVec::new();
    let block = &func.blocks[bi];
    match block.instrs.last() {
        Some(Instr::Branch { target }) => {
            if let Some(t) = func.block_index(target) {
                out.push(t);
            }
        }
        Some(Instr::BranchIf { target, .. }) => {
            if let Some(t) = func.block_index(target) {
                out.push(t);
            }
            if bi + 1 < func.blocks.len() {
                out.push(bi + 1);
            }
        }
        Some(Instr::Call { .. }) => {
            if bi + 1 < func.blocks.len() {
                out.push(bi + 1);
            }
        }
        // Ret / Halt: no successors.
        _ => {}
    }
    out
}

pub fn analyze(func: &Function) -> Liveness {
    let n = func.blocks.len();

    // Per-block gen (upward-exposed uses) and kill (defs).
    let mut gen_sets: Vec<HashSet<VReg>> = vec![HashSet::new(); n];
    let mut kill: Vec<HashSet<VReg>> = vec![HashSet::new(); n];
    for (bi, block) in func.blocks.iter().enumerate() {
        for instr in &block.instrs {
            for v in instr.uses() {
                if !kill[bi].contains(&v) {
                    gen_sets[bi].insert(v);
                }
            }
            if let Some(d) = instr.def() {
                kill[bi].insert(d);
            }
        }
    }

    let succs: Vec<SmallVec<[usize; 2]>> = (0..n).map(|bi| successors(func, bi)).collect();

    let mut live_in: Vec<HashSet<VReg>> = vec![HashSet::new(); n];
    let mut live_out: Vec<HashSet<VReg>> = vec![HashSet::new(); n];

    let mut changed = true;
    while changed {
        changed = false;
        for bi in (0..n).rev() {
            let mut new_out = HashSet::new();
            for &s in &succs[bi] {
                new_out.extend(live_in[s].iter().copied());
            }

            let mut new_in = gen_sets[bi].clone();
            for &v in &new_out {
                if !kill[bi].contains(&v) {
                    new_in.insert(v);
                }
            }

            if new_in != live_in[bi] || new_out != live_out[bi] {
                live_in[bi] = new_in;
                live_out[bi] = new_out;
                changed = true;
            }
        }
    }

    Liveness { live_in, live_out }
}

/// For every call site, the registers whose values must survive the call:
/// live after the call, excluding the call's own result. Keyed by
/// (block index, instruction index); values sorted for determinism.
pub fn call_crossings(func: &Function, live: &Liveness) -> HashMap<(usize, usize), Vec<VReg>> {
    let mut out = HashMap::new();
    for (bi, block) in func.blocks.iter().enumerate() {
        let mut live_set = live.live_out[bi].clone();
        for (ii, instr) in block.instrs.iter().enumerate().rev() {
            if let Instr::Call { ret, .. } = instr {
                let mut crossing: Vec<VReg> = live_set
                    .iter()
                    .copied()
                    .filter(|v| Some(*v) != *ret)
                    .collect();
                crossing.sort();
                out.insert((bi, ii), crossing);
            }
            if let Some(d) = instr.def() {
                live_set.remove(&d);
            }
            live_set.extend(instr.uses());
        }
    }
    out
}
