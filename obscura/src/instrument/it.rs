//! Encoding and repair of predicated instruction groups (`IT` blocks).
//!
//! An `IT` instruction covers the next one to four instructions. The first covered instruction
//! executes under `firstcond`, every following one under `firstcond` or its inverse. The mask stores
//! one bit per following instruction (set = inverse condition) and a terminating 1 bit after the last one.

use crate::ir::{
    Cond,
    Instruction,
    Opcode,
};

/// Maximum number of instructions covered by a single IT instruction
pub const MAX_GROUP_LEN: usize = 4;

/// Compute the IT mask for a group with the given conditions
pub fn encode_mask(conds: &[Cond]) -> u8 {
    assert!(!conds.is_empty() && conds.len() <= MAX_GROUP_LEN);

    let first = conds[0];
    let mut mask = 1u8 << (4 - conds.len());

    for (i, cond) in conds.iter().enumerate().skip(1) {
        if *cond != first {
            mask |= 1 << (4 - i);
        }
    }

    mask
}

/// Expand an IT instruction into the conditions of the instructions it covers
pub fn decode_mask(first: Cond, mask: u8) -> Option<Vec<Cond>> {
    let mask = mask & 0xf;

    if mask == 0 {
        return None;
    }

    let len = 4 - mask.trailing_zeros() as usize;
    let mut conds = vec![first];

    for i in 1..len {
        if mask & (1 << (4 - i)) != 0 {
            if first == Cond::Al {
                return None;
            }
            conds.push(first.inverse());
        } else {
            conds.push(first);
        }
    }

    Some(conds)
}

/// Return the positions of the instructions covered by the IT instruction at `it`
/// if the group is consistent with the predicates of those instructions.
pub(crate) fn covered_by(instrs: &[Instruction], it: usize) -> Option<Vec<usize>> {
    let (first, mask) = instrs.get(it)?.it_fields()?;
    let conds = decode_mask(first, mask)?;
    let mut covered = Vec::with_capacity(conds.len());
    let mut pos = it + 1;

    for (i, cond) in conds.iter().enumerate() {
        while instrs.get(pos).map(|instr| instr.is_debug()).unwrap_or(false) {
            pos += 1;
        }

        let instr = instrs.get(pos)?;

        if !instr.needs_predicate_group() || instr.pred() != *cond {
            return None;
        }

        if instr.opcode().ends_predicate_group() && i + 1 != conds.len() {
            return None;
        }

        covered.push(pos);
        pos += 1;
    }

    Some(covered)
}

/// Find the IT instruction that covers the instruction at `idx`
/// Debug instructions do not count towards the distance.
pub(crate) fn find_group(instrs: &[Instruction], idx: usize) -> Option<usize> {
    let window = 2 * MAX_GROUP_LEN + 1;

    (0..idx.min(instrs.len()))
        .rev()
        .filter(|&pos| !instrs[pos].is_debug())
        .take(window)
        .find(|&it| instrs[it].opcode() == Opcode::It && covered_by(instrs, it).map(|c| c.contains(&idx)).unwrap_or(false))
}

/// Whether all predicated instructions are covered by consistent IT groups
pub(crate) fn is_consistent(instrs: &[Instruction]) -> bool {
    let mut covered = vec![false; instrs.len()];

    for (i, instr) in instrs.iter().enumerate() {
        if instr.opcode() == Opcode::It {
            match covered_by(instrs, i) {
                Some(positions) => {
                    for pos in positions {
                        if covered[pos] {
                            return false;
                        }
                        covered[pos] = true;
                    }
                },
                None => return false,
            }
        }
    }

    instrs.iter().zip(covered).all(|(instr, covered)| covered || !instr.needs_predicate_group())
}

/// Re-encode every predicated group that became inconsistent after an edit.
///
/// IT instructions that no longer match the instructions they cover are removed and all
/// predicated instructions without a group get new IT instructions. Consistent groups are left alone.
/// Returns whether the instruction list was changed.
pub(crate) fn repair(instrs: &mut Vec<Instruction>) -> bool {
    let mut changed = false;

    /* Drop stale IT instructions */
    while let Some(stale) = (0..instrs.len()).rev().find(|&i| instrs[i].opcode() == Opcode::It && covered_by(instrs, i).is_none()) {
        instrs.remove(stale);
        changed = true;
    }

    let mut covered = vec![false; instrs.len()];

    for i in 0..instrs.len() {
        if let Some(positions) = covered_by(instrs, i) {
            for pos in positions {
                covered[pos] = true;
            }
        }
    }

    if instrs.iter().zip(&covered).all(|(instr, covered)| *covered || !instr.needs_predicate_group()) {
        return changed;
    }

    /* Form new groups for uncovered predicated instructions */
    let old = std::mem::take(instrs);
    let mut i = 0;

    while i < old.len() {
        if covered[i] || !old[i].needs_predicate_group() {
            instrs.push(old[i].clone());
            i += 1;
            continue;
        }

        let first = old[i].pred();
        let mut conds = vec![first];
        let mut ended = old[i].opcode().ends_predicate_group();
        let mut end = i + 1;
        let mut pos = i + 1;

        while !ended && conds.len() < MAX_GROUP_LEN && pos < old.len() {
            let instr = &old[pos];

            if instr.is_debug() {
                pos += 1;
                continue;
            }

            if covered[pos] || !instr.needs_predicate_group() || (instr.pred() != first && instr.pred() != first.inverse()) {
                break;
            }

            conds.push(instr.pred());
            ended = instr.opcode().ends_predicate_group();
            pos += 1;
            end = pos;
        }

        instrs.push(Instruction::it(first, encode_mask(&conds)));
        instrs.extend_from_slice(&old[i..end]);
        i = end;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Operand,
        PhysReg,
    };

    fn mov(pred: Cond) -> Instruction {
        Instruction::predicated(Opcode::Mov, vec![Operand::from(PhysReg::r0), Operand::from(PhysReg::r1)], pred)
    }

    fn nop() -> Instruction {
        Instruction::new(Opcode::Nop, vec![])
    }

    #[test]
    fn test_mask_encoding() {
        assert_eq!(encode_mask(&[Cond::Eq]), 0b1000);
        assert_eq!(encode_mask(&[Cond::Eq, Cond::Ne]), 0b1100);
        assert_eq!(encode_mask(&[Cond::Eq, Cond::Eq, Cond::Ne, Cond::Eq]), 0b0101);
        assert_eq!(decode_mask(Cond::Gt, 0b0011).unwrap(), vec![Cond::Gt, Cond::Gt, Cond::Gt, Cond::Le]);
        assert_eq!(decode_mask(Cond::Eq, 0), None);
    }

    #[test]
    fn test_repair_creates_groups() {
        let mut instrs = vec![nop(), mov(Cond::Eq), mov(Cond::Ne), mov(Cond::Eq), mov(Cond::Eq), mov(Cond::Eq), nop()];

        assert!(repair(&mut instrs));
        assert!(is_consistent(&instrs));

        /* Four instructions per group at most */
        assert_eq!(instrs.iter().filter(|i| i.opcode() == Opcode::It).count(), 2);
        assert_eq!(instrs[1].it_fields(), Some((Cond::Eq, 0b1001)));
    }

    #[test]
    fn test_repair_keeps_consistent_groups() {
        let mut instrs = vec![Instruction::it(Cond::Lt, 0b1100), mov(Cond::Lt), mov(Cond::Ge), nop()];
        let before = instrs.clone();

        assert!(!repair(&mut instrs));
        assert_eq!(instrs, before);
    }

    #[test]
    fn test_repair_after_removal() {
        /* The group claims three instructions but only two predicated ones are left */
        let mut instrs = vec![Instruction::it(Cond::Eq, 0b0110), mov(Cond::Eq), mov(Cond::Ne), nop()];

        assert!(repair(&mut instrs));
        assert!(is_consistent(&instrs));
        assert_eq!(instrs[0].it_fields(), Some((Cond::Eq, 0b1100)));
        assert_eq!(instrs.len(), 4);
    }

    #[test]
    fn test_branch_ends_group() {
        let branch = Instruction::predicated(Opcode::Branch, vec![Operand::Block(1)], Cond::Eq);
        let mut instrs = vec![mov(Cond::Eq), branch, mov(Cond::Eq)];

        repair(&mut instrs);
        assert!(is_consistent(&instrs));
        assert_eq!(instrs.iter().filter(|i| i.opcode() == Opcode::It).count(), 2);
        assert_eq!(find_group(&instrs, 2), Some(0));
    }

    #[test]
    fn test_find_group_across_debug_instructions() {
        let debug = || Instruction::new(Opcode::Debug, vec![]);
        let mut instrs = vec![Instruction::it(Cond::Eq, 0b0001)];

        for _ in 0..3 {
            instrs.push(mov(Cond::Eq));
            instrs.extend((0..4).map(|_| debug()));
        }
        instrs.push(mov(Cond::Eq));

        assert!(is_consistent(&instrs));
        let last = instrs.len() - 1;
        assert_eq!(last, 16);
        assert_eq!(find_group(&instrs, last), Some(0));
        assert_eq!(find_group(&instrs, 6), Some(0));
        assert_eq!(find_group(&instrs, 5), None);
        assert_eq!(find_group(&[nop(), mov(Cond::Eq)], 1), None);
    }
}
