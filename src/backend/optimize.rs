//! Assembly-level peephole passes.
//!
//! Run on the flat `AsmItem` list after code generation, before text
//! emission. Only pattern-local cleanups live here; anything that needs
//! liveness belongs in the allocator.

use super::instruction::AsmItem;

pub fn run(items: &mut Vec<AsmItem>) {
    remove_self_moves(items);
    remove_fallthrough_jumps(items);
}

/// `mov r,r` does nothing.
fn remove_self_moves(items: &mut Vec<AsmItem>) {
    items.retain(|item| match item {
        AsmItem::Instr { instr, .. } => !instr.is_self_move(),
        _ => true,
    });
}

/// `jmp X` immediately followed by the label `X` is a fallthrough.
fn remove_fallthrough_jumps(items: &mut Vec<AsmItem>) {
    let mut i = 0;
    while i + 1 < items.len() {
        let remove = match (&items[i], &items[i + 1]) {
            (AsmItem::Instr { instr, .. }, AsmItem::Label(next)) => {
                instr.jump_target() == Some(next.as_str())
            }
            _ => false,
        };
        if remove {
            items.remove(i);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::abi::PhysReg;
    use crate::backend::instruction::{MInstr, Rhs};

    #[test]
    fn drops_jump_to_next_label() {
        let mut items = vec![
            AsmItem::plain(MInstr::Jmp {
                target: "next".into(),
            }),
            AsmItem::Label("next".into()),
        ];
        run(&mut items);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], AsmItem::Label(l) if l == "next"));
    }

    #[test]
    fn drops_self_move_keeps_real_move() {
        let mut items = vec![
            AsmItem::plain(MInstr::Mov {
                d: PhysReg::B0,
                s: Rhs::Reg(PhysReg::B0),
            }),
            AsmItem::plain(MInstr::Mov {
                d: PhysReg::B0,
                s: Rhs::Reg(PhysReg::B1),
            }),
        ];
        run(&mut items);
        assert_eq!(items.len(), 1);
    }
}
