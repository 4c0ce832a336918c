//! Signature and call-site analysis.
//!
//! One module-wide pass, run before any per-function work: records each
//! function's parameter classes and return class, and which functions
//! contain calls. The resulting table is immutable and consulted by the
//! allocator and the call lowering. Building it up front is what makes
//! forward references work — a function may call one declared later.

use crate::ir::{Class, Instr, Module};
use crate::BackendError;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<Class>,
    pub ret: Option<Class>,
}

#[derive(Debug)]
pub struct SignatureTable {
    sigs: HashMap<String, Signature>,
    callers: HashSet<String>,
}

impl SignatureTable {
    pub fn get(&self, name: &str) -> Option<&Signature> {
        self.sigs.get(name)
    }

    /// Whether the named function contains at least one call.
    pub fn makes_calls(&self, name: &str) -> bool {
        self.callers.contains(name)
    }
}

/// Scan the module once. Every call target must resolve to a function in
/// the module; an unresolved target fails the whole compilation.
pub fn analyze(module: &Module) -> Result<SignatureTable, BackendError> {
    let mut sigs = HashMap::new();
    for func in &module.functions {
        let params = func.params.iter().map(|p| func.class_of(*p)).collect();
        sigs.insert(
            func.name.clone(),
            Signature {
                params,
                ret: func.ret,
            },
        );
    }

    let mut callers = HashSet::new();
    for func in &module.functions {
        for block in &func.blocks {
            for instr in &block.instrs {
                if let Instr::Call { target, .. } = instr {
                    if !sigs.contains_key(target.as_str()) {
                        return Err(BackendError::UnresolvedCall {
                            func: func.name.clone(),
                            target: target.clone(),
                        });
                    }
                    callers.insert(func.name.clone());
                }
            }
        }
    }

    log::debug!(
        "signature table: {} functions, {} callers",
        sigs.len(),
        callers.len()
    );
    Ok(SignatureTable { sigs, callers })
}
