//! IR instruction → VX16 machine-instruction lowering.
//!
//! Each IR opcode expands to a fixed template parameterised by the
//! operands' resolved locations. Spilled registers never appear as
//! machine operands: their values move through the per-class scratch
//! registers via indexed loads/stores, always `sp + constant`.

use super::{block_label, epilogue_label, CallCrossings};
use crate::backend::abi::{PhysReg, MAX_INDEXED_OFFSET};
use crate::backend::frame::FrameLayout;
use crate::backend::instruction::{AsmItem, MInstr, Rhs};
use crate::backend::regalloc::{Allocation, Home};
use crate::backend::signatures::SignatureTable;
use crate::ir::{Class, Function, Instr, Operand, VReg};
use crate::BackendError;

pub(super) struct FuncEmitter<'a> {
    pub func: &'a Function,
    pub sigs: &'a SignatureTable,
    pub alloc: &'a Allocation,
    pub frame: &'a FrameLayout,
    pub crossings: CallCrossings,
    pub out: &'a mut Vec<AsmItem>,
    /// Registers pushed by an explicit `PushCallerSaved` marker, waiting
    /// for the matching `PopCallerSaved`.
    pub pending_saves: Option<Vec<PhysReg>>,
}

impl<'a> FuncEmitter<'a> {
    pub fn emit(&mut self) -> Result<(), BackendError> {
        self.out.push(AsmItem::Label(self.func.name.clone()));
        self.emit_prologue();

        for bi in 0..self.func.blocks.len() {
            if bi > 0 {
                let label = block_label(self.func, &self.func.blocks[bi].label);
                self.out.push(AsmItem::Label(label));
            }
            for ii in 0..self.func.blocks[bi].instrs.len() {
                let instr = self.func.blocks[bi].instrs[ii].clone();
                self.emit_instr(bi, ii, &instr)?;
            }
        }

        self.emit_epilogue();
        Ok(())
    }

    // ── Prologue / epilogue ─────────────────────────────────────────────

    /// Save used callee-saved registers, then one exact `sp` adjustment.
    fn emit_prologue(&mut self) {
        for &r in &self.frame.saved_callee {
            self.push_commented(MInstr::Push { r }, format!("save {r}"));
        }
        let frame = self.frame.frame_size;
        if frame > 0 {
            self.push_commented(
                MInstr::SpAdjust {
                    delta: -(frame as i32),
                },
                format!("frame {frame} bytes"),
            );
        }
    }

    fn emit_epilogue(&mut self) {
        self.out
            .push(AsmItem::Label(epilogue_label(self.func)));
        let frame = self.frame.frame_size;
        if frame > 0 {
            self.push_commented(
                MInstr::SpAdjust {
                    delta: frame as i32,
                },
                "drop frame",
            );
        }
        for &r in self.frame.saved_callee.iter().rev() {
            self.push_commented(MInstr::Pop { r }, format!("restore {r}"));
        }
        self.push_asm(MInstr::Ret);
    }

    // ── Instruction dispatch ────────────────────────────────────────────

    fn emit_instr(&mut self, bi: usize, ii: usize, instr: &Instr) -> Result<(), BackendError> {
        match instr {
            Instr::Move { dst, src } => self.emit_move(*dst, src),
            Instr::Bin { op, dst, lhs, rhs } => {
                self.check_operand(self.class_of(*dst), lhs)?;
                self.check_operand(self.class_of(*dst), rhs)?;
                let class = self.class_of(*dst);
                let a = self.operand_reg(lhs, scratch(class, 0))?;
                let b = self.operand_rhs(rhs, scratch(class, 1))?;
                let d = self.def_reg(*dst);
                self.push_commented(
                    MInstr::Bin { op: *op, d, a, b },
                    self.describe(instr),
                );
                self.store_def(*dst, d);
                Ok(())
            }
            Instr::Cmp { lhs, rhs } => {
                let class = self
                    .operand_class(lhs)
                    .or_else(|| self.operand_class(rhs))
                    .ok_or_else(|| self.class_mismatch("compare of two immediates"))?;
                self.check_operand(class, lhs)?;
                self.check_operand(class, rhs)?;
                let a = self.operand_reg(lhs, scratch(class, 0))?;
                let b = self.operand_rhs(rhs, scratch(class, 1))?;
                self.push_commented(MInstr::Cmp { a, b }, self.describe(instr));
                Ok(())
            }
            Instr::BranchIf { cond, target } => {
                self.push_asm(MInstr::Br {
                    cond: *cond,
                    target: block_label(self.func, target),
                });
                Ok(())
            }
            Instr::Branch { target } => {
                self.push_asm(MInstr::Jmp {
                    target: block_label(self.func, target),
                });
                Ok(())
            }
            Instr::Call { target, args, ret } => self.emit_call(bi, ii, target, args, *ret),
            Instr::Ret { value } => self.emit_ret(value.as_ref()),
            Instr::LoadIndexed { dst, base, offset } => {
                let rb = self.base_reg(base, *offset)?;
                match self.alloc.home(*dst) {
                    Home::Reg(d) => {
                        self.push_commented(
                            MInstr::Ldx {
                                d,
                                base: rb,
                                offset: *offset,
                            },
                            self.describe(instr),
                        );
                    }
                    _ => {
                        let tmp = scratch(self.class_of(*dst), 0);
                        self.push_asm(MInstr::Ldx {
                            d: tmp,
                            base: rb,
                            offset: *offset,
                        });
                        self.store_def(*dst, tmp);
                    }
                }
                Ok(())
            }
            Instr::StoreIndexed { base, offset, src } => {
                let rb = self.base_reg(base, *offset)?;
                let class = self
                    .operand_class(src)
                    .ok_or_else(|| self.class_mismatch("store of unclassed immediate"))?;
                let s = self.operand_reg(src, scratch(class, 1))?;
                self.push_commented(
                    MInstr::Stx {
                        s,
                        base: rb,
                        offset: *offset,
                    },
                    self.describe(instr),
                );
                Ok(())
            }
            Instr::PushCallerSaved => {
                // Find the call this marker protects and save its live set.
                let next_call = self.func.blocks[bi].instrs[ii + 1..]
                    .iter()
                    .position(|i| matches!(i, Instr::Call { .. }))
                    .map(|j| (bi, ii + 1 + j));
                if let Some(site) = next_call {
                    let saves = self.save_set(site);
                    for &r in &saves {
                        self.push_commented(MInstr::Push { r }, format!("save {r} across call"));
                    }
                    self.pending_saves = Some(saves);
                }
                Ok(())
            }
            Instr::PopCallerSaved => {
                if let Some(saves) = self.pending_saves.take() {
                    for &r in saves.iter().rev() {
                        self.push_commented(MInstr::Pop { r }, format!("restore {r}"));
                    }
                }
                Ok(())
            }
            Instr::Halt => {
                self.push_asm(MInstr::Halt);
                Ok(())
            }
        }
    }

    // ── Move ────────────────────────────────────────────────────────────

    fn emit_move(&mut self, dst: VReg, src: &Operand) -> Result<(), BackendError> {
        let class = self.class_of(dst);
        self.check_operand(class, src)?;
        let comment = format!("{} = {}", self.name_of(dst), self.describe_operand(src));
        match self.alloc.home(dst) {
            Home::Reg(d) => self.read_into(d, src, comment)?,
            _ => {
                let off = self.slot(dst);
                let s = self.operand_reg(src, scratch(class, 0))?;
                self.push_commented(
                    MInstr::Stx {
                        s,
                        base: PhysReg::STACK_PTR,
                        offset: off,
                    },
                    comment,
                );
            }
        }
        Ok(())
    }

    // ── Call ────────────────────────────────────────────────────────────

    fn emit_call(
        &mut self,
        bi: usize,
        ii: usize,
        target: &str,
        args: &[Operand],
        ret: Option<VReg>,
    ) -> Result<(), BackendError> {
        let sig = self
            .sigs
            .get(target)
            .expect("call target resolved by signature analysis")
            .clone();

        if sig.params.len() != args.len() {
            return Err(self.class_mismatch(&format!(
                "call to {target}: {} args for {} params",
                args.len(),
                sig.params.len()
            )));
        }
        for (arg, &class) in args.iter().zip(&sig.params) {
            self.check_operand(class, arg)?;
        }

        // Caller-saved registers holding values live across this call.
        // An explicit PushCallerSaved marker may have saved them already.
        let inline_saves = if self.pending_saves.is_none() {
            let saves = self.save_set((bi, ii));
            for &r in &saves {
                self.push_commented(MInstr::Push { r }, format!("save {r} across call"));
            }
            Some(saves)
        } else {
            None
        };

        // Split arguments into register-passed and stack-passed.
        let mut reg_args: Vec<(PhysReg, &Operand)> = Vec::new();
        let mut stack_args: Vec<(&Operand, Class)> = Vec::new();
        let mut taken = [0usize; 2];
        for (arg, &class) in args.iter().zip(&sig.params) {
            let n = &mut taken[(class == Class::Word) as usize];
            let regs = PhysReg::param_regs(class);
            if *n < regs.len() {
                reg_args.push((regs[*n], arg));
                *n += 1;
            } else {
                stack_args.push((arg, class));
            }
        }

        // Stack-passed arguments, pushed in reverse declaration order so
        // the callee sees them low-to-high above its frame.
        let arg_bytes: u16 = stack_args.iter().map(|(_, c)| c.size()).sum();
        for &(arg, class) in stack_args.iter().rev() {
            let r = self.operand_reg(arg, scratch(class, 0))?;
            let note = format!("stack arg {}", self.describe_operand(arg));
            self.push_commented(MInstr::Push { r }, note);
        }

        // Register arguments. If any source currently sits in another
        // argument's target register, route everything through the stack;
        // otherwise move each value straight in.
        let targets: Vec<PhysReg> = reg_args.iter().map(|&(t, _)| t).collect();
        let conflict = reg_args.iter().any(|&(t, arg)| {
            if let Operand::Reg(v) = arg {
                if let Home::Reg(src) = self.alloc.home(*v) {
                    return targets.iter().any(|&other| other == src && other != t);
                }
            }
            false
        });
        if conflict {
            for &(t, arg) in &reg_args {
                let r = self.operand_reg(arg, scratch(t.class(), 0))?;
                self.push_asm(MInstr::Push { r });
            }
            for &(t, _) in reg_args.iter().rev() {
                self.push_asm(MInstr::Pop { r: t });
            }
        } else {
            for (i, &(t, arg)) in reg_args.iter().enumerate() {
                self.read_into(t, arg, format!("arg {}", i + 1))?;
            }
        }

        self.push_commented(
            MInstr::Call {
                target: target.to_string(),
            },
            format!("call {target}"),
        );

        // Return value first: a restore below must not clobber it.
        if let Some(r) = ret {
            let ret_class = sig
                .ret
                .ok_or_else(|| self.class_mismatch(&format!("{target} returns no value")))?;
            if ret_class != self.class_of(r) {
                return Err(self.class_mismatch(&format!(
                    "{target} returns {ret_class}, bound to {} value",
                    self.class_of(r)
                )));
            }
            let rr = PhysReg::ret_reg(ret_class);
            match self.alloc.home(r) {
                Home::Reg(d) => {
                    if d != rr {
                        self.push_commented(MInstr::Mov { d, s: Rhs::Reg(rr) }, "return value");
                    }
                }
                _ => {
                    let off = self.slot(r);
                    self.push_commented(
                        MInstr::Stx {
                            s: rr,
                            base: PhysReg::STACK_PTR,
                            offset: off,
                        },
                        "return value",
                    );
                }
            }
        }

        // Drop stack-passed arguments with one exact adjustment.
        if arg_bytes > 0 {
            self.push_commented(
                MInstr::SpAdjust {
                    delta: arg_bytes as i32,
                },
                "drop call args",
            );
        }

        // Inline saves are restored here; marker saves wait for the
        // explicit PopCallerSaved.
        if let Some(saves) = inline_saves {
            for &r in saves.iter().rev() {
                self.push_commented(MInstr::Pop { r }, format!("restore {r}"));
            }
        }
        Ok(())
    }

    fn emit_ret(&mut self, value: Option<&Operand>) -> Result<(), BackendError> {
        if let Some(v) = value {
            let class = self
                .func
                .ret
                .ok_or_else(|| self.class_mismatch("return value in void function"))?;
            self.check_operand(class, v)?;
            let rr = PhysReg::ret_reg(class);
            self.read_into(rr, v, format!("ret {}", self.describe_operand(v)))?;
        }
        self.push_asm(MInstr::Jmp {
            target: epilogue_label(self.func),
        });
        Ok(())
    }

    // ── Operand resolution ──────────────────────────────────────────────

    /// Registers that must be saved around the call at `site`: the
    /// caller-saved registers assigned to values live across it.
    fn save_set(&self, site: (usize, usize)) -> Vec<PhysReg> {
        let mut regs: Vec<PhysReg> = self
            .crossings
            .get(&site)
            .map(|vs| {
                vs.iter()
                    .filter_map(|v| match self.alloc.home(*v) {
                        Home::Reg(r) if r.is_caller_saved() => Some(r),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        regs.sort();
        regs.dedup();
        regs
    }

    /// Put an operand's value into `target`, skipping a no-op move.
    fn read_into(
        &mut self,
        target: PhysReg,
        op: &Operand,
        comment: String,
    ) -> Result<(), BackendError> {
        match op {
            Operand::Reg(v) => match self.alloc.home(*v) {
                Home::Reg(s) => {
                    if s != target {
                        self.push_commented(MInstr::Mov { d: target, s: Rhs::Reg(s) }, comment);
                    }
                }
                _ => {
                    let off = self.slot(*v);
                    self.push_commented(
                        MInstr::Ldx {
                            d: target,
                            base: PhysReg::STACK_PTR,
                            offset: off,
                        },
                        comment,
                    );
                }
            },
            Operand::Imm(i) => {
                self.push_commented(MInstr::Mov { d: target, s: Rhs::Imm(*i) }, comment);
            }
            Operand::Func(name) => {
                self.push_commented(
                    MInstr::Mov {
                        d: target,
                        s: Rhs::Sym(name.clone()),
                    },
                    comment,
                );
            }
        }
        Ok(())
    }

    /// Operand as a physical register, loading spills and materialising
    /// immediates into `tmp`.
    fn operand_reg(&mut self, op: &Operand, tmp: PhysReg) -> Result<PhysReg, BackendError> {
        match op {
            Operand::Reg(v) => match self.alloc.home(*v) {
                Home::Reg(r) => Ok(r),
                _ => {
                    let off = self.slot(*v);
                    self.push_commented(
                        MInstr::Ldx {
                            d: tmp,
                            base: PhysReg::STACK_PTR,
                            offset: off,
                        },
                        format!("reload {}", self.name_of(*v)),
                    );
                    Ok(tmp)
                }
            },
            Operand::Imm(i) => {
                self.push_asm(MInstr::Mov { d: tmp, s: Rhs::Imm(*i) });
                Ok(tmp)
            }
            Operand::Func(name) => {
                self.push_asm(MInstr::Mov {
                    d: tmp,
                    s: Rhs::Sym(name.clone()),
                });
                Ok(tmp)
            }
        }
    }

    /// Operand as a right-hand side: immediates stay immediate, spills
    /// reload into `tmp`.
    fn operand_rhs(&mut self, op: &Operand, tmp: PhysReg) -> Result<Rhs, BackendError> {
        match op {
            Operand::Imm(i) => Ok(Rhs::Imm(*i)),
            Operand::Func(name) => Ok(Rhs::Sym(name.clone())),
            Operand::Reg(_) => Ok(Rhs::Reg(self.operand_reg(op, tmp)?)),
        }
    }

    /// Base of an indexed access: must be word-class. An immediate base
    /// (absolute address, e.g. a hardware I/O window) is materialised
    /// into the word scratch register.
    fn base_reg(&mut self, base: &Operand, offset: u16) -> Result<PhysReg, BackendError> {
        if offset > MAX_INDEXED_OFFSET {
            return Err(self.class_mismatch(&format!(
                "indexed offset {offset} exceeds {MAX_INDEXED_OFFSET}"
            )));
        }
        if let Some(class) = self.operand_class(base) {
            if class != Class::Word {
                return Err(self.class_mismatch("indexed base must be word-class"));
            }
        }
        self.operand_reg(base, scratch(Class::Word, 0))
    }

    /// Register a definition lands in: its home, or the class scratch for
    /// spilled destinations (stored back by `store_def`).
    fn def_reg(&self, dst: VReg) -> PhysReg {
        match self.alloc.home(dst) {
            Home::Reg(r) => r,
            _ => scratch(self.class_of(dst), 0),
        }
    }

    /// Store a definition back to its frame slot if it is memory-homed.
    fn store_def(&mut self, dst: VReg, from: PhysReg) {
        if matches!(self.alloc.home(dst), Home::Reg(_)) {
            return;
        }
        let off = self.slot(dst);
        self.push_commented(
            MInstr::Stx {
                s: from,
                base: PhysReg::STACK_PTR,
                offset: off,
            },
            format!("spill {}", self.name_of(dst)),
        );
    }

    // ── Class checking ──────────────────────────────────────────────────

    fn operand_class(&self, op: &Operand) -> Option<Class> {
        match op {
            Operand::Reg(v) => Some(self.class_of(*v)),
            Operand::Imm(_) => None,
            Operand::Func(_) => Some(Class::Word),
        }
    }

    /// An operand must be usable where a value of `expected` class is
    /// required: classes match exactly, and immediates fit the width.
    fn check_operand(&self, expected: Class, op: &Operand) -> Result<(), BackendError> {
        match op {
            Operand::Reg(v) => {
                let got = self.class_of(*v);
                if got != expected {
                    return Err(self.class_mismatch(&format!(
                        "{} is {got}, expected {expected}",
                        self.name_of(*v)
                    )));
                }
            }
            Operand::Imm(i) => {
                let fits = match expected {
                    Class::Byte => (-128..=255).contains(i),
                    Class::Word => (-32768..=65535).contains(i),
                };
                if !fits {
                    return Err(self.class_mismatch(&format!(
                        "immediate {i} does not fit a {expected}"
                    )));
                }
            }
            Operand::Func(_) => {
                if expected != Class::Word {
                    return Err(self.class_mismatch("function address is word-class"));
                }
            }
        }
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn class_of(&self, v: VReg) -> Class {
        self.func.class_of(v)
    }

    fn name_of(&self, v: VReg) -> &str {
        &self.func.vreg(v).name
    }

    fn slot(&self, v: VReg) -> u16 {
        self.frame
            .offset_of(v)
            .expect("memory-homed register has a frame offset")
    }

    fn class_mismatch(&self, message: &str) -> BackendError {
        BackendError::ClassMismatch {
            func: self.func.name.clone(),
            message: message.to_string(),
        }
    }

    fn push_asm(&mut self, instr: MInstr) {
        self.out.push(AsmItem::plain(instr));
    }

    fn push_commented(&mut self, instr: MInstr, comment: impl Into<String>) {
        self.out.push(AsmItem::commented(instr, comment));
    }

    fn describe(&self, instr: &Instr) -> String {
        match instr {
            Instr::Bin { op, dst, lhs, rhs } => format!(
                "{} = {} {op} {}",
                self.name_of(*dst),
                self.describe_operand(lhs),
                self.describe_operand(rhs)
            ),
            Instr::Cmp { lhs, rhs } => format!(
                "{} ? {}",
                self.describe_operand(lhs),
                self.describe_operand(rhs)
            ),
            Instr::LoadIndexed { dst, base, offset } => format!(
                "{} = [{}+{offset}]",
                self.name_of(*dst),
                self.describe_operand(base)
            ),
            Instr::StoreIndexed { base, offset, src } => format!(
                "[{}+{offset}] = {}",
                self.describe_operand(base),
                self.describe_operand(src)
            ),
            other => format!("{other}"),
        }
    }

    fn describe_operand(&self, op: &Operand) -> String {
        match op {
            Operand::Reg(v) => self.name_of(*v).to_string(),
            Operand::Imm(i) => format!("{i}"),
            Operand::Func(n) => format!("@{n}"),
        }
    }
}

/// Scratch register `idx` (0 or 1) for a class. Outside the allocatable
/// pools, so clobbering one can never disturb an allocated value.
fn scratch(class: Class, idx: usize) -> PhysReg {
    PhysReg::scratch(class)[idx]
}
