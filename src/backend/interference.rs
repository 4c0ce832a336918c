//! Interference graph construction.
//!
//! Nodes are indexed by virtual-register id (arena + index, no object
//! references). Edges connect same-class registers only — the byte and
//! word files are disjoint, so cross-class pairs can never collide on a
//! physical register. Pinned parameter nodes are pre-colored members of
//! the graph: excluded from the coloring search but present for
//! interference checks.
//!
//! Call-crossing liveness is folded in as an attribute rather than a
//! separate pass, keeping this graph the single source of truth for
//! "cannot share a register": a node live across a call is barred from
//! every caller-saved register of its class.

use super::abi::PhysReg;
use super::liveness::Liveness;
use crate::ir::{Class, Function, Instr, VReg};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct Node {
    pub class: Class,
    /// Fixed physical register, for calling-convention-pinned parameters.
    pub pinned: Option<PhysReg>,
    /// Parameter passed beyond the register budget; lives in the caller's
    /// frame and never enters coloring.
    pub stack_param: bool,
    /// Live across at least one call site.
    pub crosses_call: bool,
}

#[derive(Debug)]
pub struct InterferenceGraph {
    nodes: Vec<Node>,
    adj: Vec<BTreeSet<u32>>,
}

impl InterferenceGraph {
    pub fn node(&self, v: VReg) -> &Node {
        &self.nodes[v.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Neighbors in ascending id order.
    pub fn neighbors(&self, v: VReg) -> impl Iterator<Item = VReg> + '_ {
        self.adj[v.index()].iter().map(|&i| VReg(i))
    }

    pub fn degree(&self, v: VReg) -> usize {
        self.adj[v.index()].len()
    }

    pub fn interferes(&self, u: VReg, v: VReg) -> bool {
        self.adj[u.index()].contains(&v.0)
    }

    fn add_edge(&mut self, u: VReg, v: VReg) {
        if u == v || self.nodes[u.index()].class != self.nodes[v.index()].class {
            return;
        }
        self.adj[u.index()].insert(v.0);
        self.adj[v.index()].insert(u.0);
    }
}

/// Build the interference graph for one function.
///
/// Walks each block backward from its live-out set. A definition
/// interferes with everything live after the defining instruction (the
/// standard def/result rule), which also gives all simultaneously-live
/// pairs an edge by induction. Parameters are all defined at entry, so
/// those live into the entry block form a clique.
pub fn build(func: &Function, live: &Liveness) -> InterferenceGraph {
    let mut graph = InterferenceGraph {
        nodes: func
            .vregs
            .iter()
            .map(|data| {
                let (pinned, stack_param) = match data.param {
                    Some(ord) => pin_for_param(func, ord),
                    None => (None, false),
                };
                Node {
                    class: data.class,
                    pinned,
                    stack_param,
                    crosses_call: false,
                }
            })
            .collect(),
        adj: vec![BTreeSet::new(); func.vregs.len()],
    };

    for (bi, block) in func.blocks.iter().enumerate() {
        let mut live_set = live.live_out[bi].clone();
        for instr in block.instrs.iter().rev() {
            let def = instr.def();
            if let Instr::Call { .. } = instr {
                for &v in &live_set {
                    if Some(v) != def {
                        graph.nodes[v.index()].crosses_call = true;
                    }
                }
            }
            if let Some(d) = def {
                for v in live_set.iter().copied().collect::<Vec<_>>() {
                    graph.add_edge(d, v);
                }
                live_set.remove(&d);
            }
            live_set.extend(instr.uses());
        }
    }

    // Parameters are simultaneously defined at entry.
    let entry_live: Vec<VReg> = live.live_in[0].iter().copied().collect();
    for (i, &u) in entry_live.iter().enumerate() {
        for &v in &entry_live[i + 1..] {
            graph.add_edge(u, v);
        }
    }

    graph
}

/// Calling-convention placement for parameter ordinal `ord`: a pinned
/// register while the class's parameter registers last, the stack after.
fn pin_for_param(func: &Function, ord: u8) -> (Option<PhysReg>, bool) {
    let v = func.params[ord as usize];
    let class = func.class_of(v);
    // Position among parameters of the same class.
    let class_pos = func.params[..ord as usize]
        .iter()
        .filter(|p| func.class_of(**p) == class)
        .count();
    let regs = PhysReg::param_regs(class);
    if class_pos < regs.len() {
        (Some(regs[class_pos]), false)
    } else {
        (None, true)
    }
}
