use crate::ir::{
    is_modified_immediate,
    AddrPart,
    BasicBlock,
    Cond,
    Edge,
    Id,
    Instruction,
    Opcode,
    Operand,
    PhysReg,
    Reg,
    Symbol,
    CFG,
};

/// Name of the naked function `void getaddr(void **base, void **end)` that returns the address
/// of the global guard and the address 32 bytes behind it
pub const GUARD_FUNCTION: &str = "__obscura_globalguard_getaddr";

/* mov dst, #value with the shortest possible encoding */
fn load_constant(bb: &mut BasicBlock, dst: PhysReg, value: u32) {
    if is_modified_immediate(value) {
        bb.mov_imm(Reg::Phys(dst), value as i64);
    } else {
        bb.movw(Reg::Phys(dst), Operand::Imm((value & 0xffff) as i64));
        bb.movt(Reg::Phys(dst), Operand::Imm(((value >> 16) & 0xffff) as i64));
    }
}

fn address_of(global: Id, part: AddrPart) -> Operand {
    Operand::Symbol {
        symbol: Symbol::Global(global),
        offset: 0,
        part,
    }
}

fn load_address(bb: &mut BasicBlock, dst: PhysReg, global: Id, pred: Cond) {
    bb.insert(Instruction::predicated(Opcode::MovLo16, vec![Operand::from(dst), address_of(global, AddrPart::Lo16)], pred));
    bb.insert(Instruction::predicated(Opcode::MovHi16, vec![Operand::from(dst), Operand::from(dst), address_of(global, AddrPart::Hi16)], pred));
}

/* *base = r12; *end = r12 + 32 */
fn return_guard(bb: &mut BasicBlock) {
    let r12 = Reg::Phys(PhysReg::r12);
    bb.store(r12, Operand::from(PhysReg::r0), 0);
    bb.add(r12, r12, Operand::Imm(32));
    bb.store(r12, Operand::from(PhysReg::r1), 0);
    bb.ret();
}

/// Generate the body of the guard accessor.
///
/// With an `rng_address` and more than one candidate the accessor selects one of the `candidates`
/// at runtime:
/// ```text
///         mov   r2, #rng_address
/// poll:   ldr   r3, [r2, #0]
///         cmp   r3, #0
///         beq   poll
///         mov   r2, #num_candidates
///         udiv  r12, r3, r2
///         mls   r3, r2, r12, r3
///         sub   r2, r2, #1           \
///         cmp   r3, r2               |
///         ittt  eq                   | for every candidate but the last one
///         movweq r12, :lower16:cand  |
///         movteq r12, :upper16:cand  |
///         beq   store                /
///         movw  r12, :lower16:last
///         movt  r12, :upper16:last
///         b     store
/// store:  str   r12, [r0]
///         add   r12, r12, #32
///         str   r12, [r1]
///         bx    lr
/// ```
/// Otherwise `candidates[static_pick]` is hardcoded.
pub(super) fn build_guard_cfg(candidates: &[Id], rng_address: Option<u32>, static_pick: usize) -> CFG {
    let mut cfg = CFG::new();

    match rng_address {
        Some(rng_address) if candidates.len() > 1 => {
            let r2 = Reg::Phys(PhysReg::r2);
            let r3 = Reg::Phys(PhysReg::r3);
            let r12 = Reg::Phys(PhysReg::r12);

            let mut setup = BasicBlock::new();
            load_constant(&mut setup, PhysReg::r2, rng_address);
            let setup = cfg.add_basic_block(setup);
            cfg.set_entry(setup);

            let poll = cfg.add_basic_block(BasicBlock::new());
            let select = cfg.add_basic_block(BasicBlock::new());
            let store = cfg.add_basic_block(BasicBlock::new());

            /* Wait until the RNG produces a value */
            if let Some(bb) = cfg.basic_block_mut(poll) {
                bb.load(r3, Operand::Reg(r2), 0);
                bb.cmp(r3, Operand::Imm(0));
                bb.branch_cond(Cond::Eq, poll);
                bb.add_edge(Edge::Jump(poll));
                bb.add_edge(Edge::Next(select));
            }

            /* r3 = random % num_candidates */
            if let Some(bb) = cfg.basic_block_mut(select) {
                load_constant(bb, PhysReg::r2, candidates.len() as u32);
                bb.udiv(r12, r3, r2);
                bb.mls(r3, r2, r12, r3);

                let (rest, last) = candidates.split_at(candidates.len() - 1);

                for candidate in rest {
                    bb.sub(r2, r2, Operand::Imm(1));
                    bb.cmp(r3, Operand::Reg(r2));
                    bb.it(Cond::Eq, 0b0010);
                    load_address(bb, PhysReg::r12, *candidate, Cond::Eq);
                    bb.insert(Instruction::predicated(Opcode::Branch, vec![Operand::Block(store)], Cond::Eq));
                }

                load_address(bb, PhysReg::r12, last[0], Cond::Al);
                bb.branch(store);
                bb.add_edge(Edge::Jump(store));
            }

            if let Some(bb) = cfg.basic_block_mut(setup) {
                bb.add_edge(Edge::Next(poll));
            }

            if let Some(bb) = cfg.basic_block_mut(store) {
                return_guard(bb);
            }
        },
        _ => {
            let mut bb = BasicBlock::new();
            load_address(&mut bb, PhysReg::r12, candidates[static_pick], Cond::Al);
            return_guard(&mut bb);

            let entry = cfg.add_basic_block(bb);
            cfg.set_entry(entry);
        },
    }

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::is_consistent;

    fn opcodes(bb: &BasicBlock) -> Vec<Opcode> {
        bb.instrs().iter().map(|instr| instr.opcode()).collect()
    }

    #[test]
    fn test_static_guard() {
        let cfg = build_guard_cfg(&[10, 11, 12], None, 1);
        assert_eq!(cfg.num_basic_blocks(), 1);

        let bb = cfg.basic_block_at(0).unwrap();
        assert_eq!(opcodes(bb), vec![Opcode::MovLo16, Opcode::MovHi16, Opcode::Store, Opcode::Add, Opcode::Store, Opcode::Return]);
        assert_eq!(bb.instrs()[0].operand(1), Some(&address_of(11, AddrPart::Lo16)));
        assert!(cfg.verify().is_ok());
    }

    #[test]
    fn test_single_candidate_ignores_rng() {
        let cfg = build_guard_cfg(&[10], Some(0x4000_0000), 0);
        assert_eq!(cfg.num_basic_blocks(), 1);
    }

    #[test]
    fn test_runtime_guard() {
        let cfg = build_guard_cfg(&[10, 11, 12], Some(0x4002_5800), 0);
        assert_eq!(cfg.num_basic_blocks(), 4);
        assert!(cfg.verify().is_ok());

        /* 0x40025800 is no modified immediate, 3 is */
        let setup = cfg.basic_block_at(0).unwrap();
        assert_eq!(opcodes(setup), vec![Opcode::MovLo16, Opcode::MovHi16]);

        let select = cfg.basic_block_at(2).unwrap();
        assert_eq!(select.instrs()[0].opcode(), Opcode::MovImm);
        assert_eq!(select.instrs().iter().filter(|instr| instr.opcode() == Opcode::It).count(), 2);
        assert!(is_consistent(select.instrs()));

        let store = cfg.basic_block_at(3).unwrap();
        assert_eq!(store.instrs().last().map(|instr| instr.opcode()), Some(Opcode::Return));
    }

    #[test]
    fn test_encodable_rng_address() {
        let cfg = build_guard_cfg(&[10, 11], Some(0x4000_0000), 0);
        let setup = cfg.basic_block_at(0).unwrap();
        assert_eq!(opcodes(setup), vec![Opcode::MovImm]);
    }
}
