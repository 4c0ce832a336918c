//! Graph-coloring register allocation.
//!
//! Every virtual register of a function ends up with exactly one home:
//! a physical register or a frame slot. Parameters come pre-colored by
//! the calling convention; the rest are colored by simplification-stack
//! graph coloring, class by class, with overflow spilled to the frame.
//!
//! The allocator is deterministic: the simplification order picks the
//! lowest-id node among those below the color bound, the spill candidate
//! is the highest-degree node (lowest id on ties), and colors are tried
//! in ascending register number. Call-crossing nodes try callee-saved
//! registers only; if none fits they spill, never occupying a
//! caller-saved register that the call would clobber.

use super::abi::PhysReg;
use super::interference::InterferenceGraph;
use crate::ir::{Class, Function, VReg};
use std::collections::HashSet;

/// Where a virtual register lives for the whole function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    Reg(PhysReg),
    /// Spilled local; the frame layout assigns the offset.
    Spill,
    /// Parameter passed on the stack by the caller.
    StackParam,
}

#[derive(Debug)]
pub struct Allocation {
    /// Indexed by virtual-register id. Total: one entry per register.
    pub homes: Vec<Home>,
    /// Callee-saved registers handed out by coloring, ascending order.
    /// The prologue must save these.
    pub used_callee_saved: Vec<PhysReg>,
}

impl Allocation {
    pub fn home(&self, v: VReg) -> Home {
        self.homes[v.index()]
    }
}

pub fn allocate(func: &Function, graph: &InterferenceGraph) -> Allocation {
    let mut homes: Vec<Option<Home>> = vec![None; graph.len()];

    // Phase 1: calling-convention placements fixed before coloring runs.
    for i in 0..graph.len() {
        let node = graph.node(VReg(i as u32));
        if let Some(r) = node.pinned {
            homes[i] = Some(Home::Reg(r));
        } else if node.stack_param {
            homes[i] = Some(Home::StackParam);
        }
    }

    // Phase 2: color each class against its own pool.
    color_class(graph, Class::Byte, &mut homes);
    color_class(graph, Class::Word, &mut homes);

    let homes: Vec<Home> = homes
        .into_iter()
        .map(|h| h.expect("allocation left a register unassigned"))
        .collect();

    let mut used_callee_saved: Vec<PhysReg> = homes
        .iter()
        .filter_map(|h| match h {
            Home::Reg(r) if r.is_callee_saved() => Some(*r),
            _ => None,
        })
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    used_callee_saved.sort();

    let spilled = homes.iter().filter(|h| matches!(h, Home::Spill)).count();
    log::debug!(
        "{}: {} vregs, {} spilled, callee-saved {:?}",
        func.name,
        homes.len(),
        spilled,
        used_callee_saved
    );

    Allocation {
        homes,
        used_callee_saved,
    }
}

fn color_class(graph: &InterferenceGraph, class: Class, homes: &mut [Option<Home>]) {
    let pool = PhysReg::pool(class);
    let k = pool.len();

    // Nodes of this class that coloring must place, ascending id.
    let colorable: Vec<VReg> = (0..graph.len() as u32)
        .map(VReg)
        .filter(|v| {
            let n = graph.node(*v);
            n.class == class && n.pinned.is_none() && !n.stack_param
        })
        .collect();

    // A neighbor counts toward the degree while it can still end up in a
    // register: unprocessed colorable nodes and pinned nodes.
    let mut in_work = vec![false; graph.len()];
    for v in &colorable {
        in_work[v.index()] = true;
    }
    let mut degree = vec![0usize; graph.len()];
    for &v in &colorable {
        degree[v.index()] = graph
            .neighbors(v)
            .filter(|n| in_work[n.index()] || graph.node(*n).pinned.is_some())
            .count();
    }

    // Simplification: repeatedly push a node below the color bound; when
    // none exists, push the highest-degree node (lowest id on ties) as a
    // spill candidate. A candidate that still finds a free color during
    // select keeps it; one that does not gets a frame slot.
    let mut stack: Vec<VReg> = Vec::with_capacity(colorable.len());
    let mut remaining = colorable.len();
    while remaining > 0 {
        let live_nodes = || colorable.iter().copied().filter(|v| in_work[v.index()]);
        let v = match live_nodes().find(|v| degree[v.index()] < k) {
            Some(v) => v,
            None => live_nodes()
                .max_by_key(|&v| (degree[v.index()], std::cmp::Reverse(v)))
                .expect("non-empty worklist"),
        };
        in_work[v.index()] = false;
        remaining -= 1;
        for n in graph.neighbors(v) {
            if in_work[n.index()] {
                degree[n.index()] -= 1;
            }
        }
        stack.push(v);
    }

    // Select: pop and take the lowest-numbered color no neighbor holds.
    while let Some(v) = stack.pop() {
        let mut forbidden: HashSet<PhysReg> = HashSet::new();
        for n in graph.neighbors(v) {
            if let Some(Home::Reg(r)) = homes[n.index()] {
                forbidden.insert(r);
            }
        }
        let node = graph.node(v);
        let candidates: &[PhysReg] = if node.crosses_call {
            // Barred from the caller-saved file: the call clobbers it.
            PhysReg::callee_saved(class)
        } else {
            pool
        };
        let color = candidates.iter().copied().find(|r| !forbidden.contains(r));
        homes[v.index()] = Some(match color {
            Some(r) => Home::Reg(r),
            None => Home::Spill,
        });
    }
}
