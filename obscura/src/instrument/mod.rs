//! Editing machine code without breaking predicated instruction groups

mod it;
mod liveness;

pub use it::{
    decode_mask,
    encode_mask,
    MAX_GROUP_LEN,
};
pub(crate) use it::is_consistent;
use liveness::Liveness;
use thiserror::Error;

use crate::ir::{
    BasicBlock,
    Cond,
    Edge,
    Id,
    Instruction,
    Opcode,
    PhysReg,
    RegClass,
    RegSet,
    CFG,
};

/// Everything that can go wrong when editing a basic block
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("Unknown basic block: {0}")]
    UnknownBasicBlock(Id),

    #[error("Basic block {0} has no instruction at position {1}")]
    InvalidPosition(Id, usize),

    #[error("Cannot remove the IT instruction at position {1} of basic block {0}")]
    RemoveIt(Id, usize),
}

/// Inserts, removes and relocates instructions and splits basic blocks while keeping every
/// predicated instruction group consistent. Also answers which registers are free at a program point.
#[derive(Debug, Default)]
pub struct Instrumentor {
    inserted: usize,
    removed: usize,
    splits: usize,
}

/* Position of the `rank`-th instruction that is not an IT instruction */
fn locate(instrs: &[Instruction], rank: usize) -> usize {
    instrs.iter().enumerate().filter(|(_, instr)| instr.opcode() != Opcode::It).nth(rank).map(|(idx, _)| idx).unwrap_or(instrs.len())
}

fn rank_of(instrs: &[Instruction], idx: usize) -> usize {
    instrs[..idx].iter().filter(|instr| instr.opcode() != Opcode::It).count()
}

impl Instrumentor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions inserted so far
    pub fn num_inserted(&self) -> usize {
        self.inserted
    }

    /// Number of instructions removed so far
    pub fn num_removed(&self) -> usize {
        self.removed
    }

    /// Number of basic blocks created by splitting
    pub fn num_splits(&self) -> usize {
        self.splits
    }

    fn block_mut<'a>(cfg: &'a mut CFG, bb: Id) -> Result<&'a mut BasicBlock, InstrumentError> {
        cfg.basic_block_mut(bb).ok_or(InstrumentError::UnknownBasicBlock(bb))
    }

    fn insert(&mut self, cfg: &mut CFG, bb: Id, anchor: usize, after: bool, instrs: Vec<Instruction>) -> Result<usize, InstrumentError> {
        let block = Self::block_mut(cfg, bb)?;
        let list = block.instrs_mut();

        let Some(anchor_instr) = list.get(anchor) else {
            return Err(InstrumentError::InvalidPosition(bb, anchor));
        };

        /* Unpredicated instructions placed next to a predicated anchor execute under the same condition */
        let pred = if anchor_instr.needs_predicate_group() { anchor_instr.pred() } else { Cond::Al };
        let count = instrs.len();

        /* The group of the anchor gets re-encoded as a whole */
        let mut anchor = anchor;
        if let Some(it) = it::find_group(list, anchor) {
            list.remove(it);
            anchor -= 1;
        }

        let at = if after { anchor + 1 } else { anchor };

        for (i, mut instr) in instrs.into_iter().enumerate() {
            if pred != Cond::Al && !instr.is_conditional() && instr.opcode() != Opcode::It {
                instr.set_pred(pred);
            }
            list.insert(at + i, instr);
        }

        let anchor = if after { anchor } else { anchor + count };
        let rank = rank_of(list, anchor);

        it::repair(list);

        self.inserted += count;
        Ok(locate(list, rank))
    }

    /// Insert `instrs` in front of the instruction at position `anchor` of `bb`.
    /// Returns the new position of the anchor.
    pub fn insert_before(&mut self, cfg: &mut CFG, bb: Id, anchor: usize, instrs: Vec<Instruction>) -> Result<usize, InstrumentError> {
        self.insert(cfg, bb, anchor, false, instrs)
    }

    /// Insert `instrs` behind the instruction at position `anchor` of `bb`.
    /// Returns the new position of the anchor.
    pub fn insert_after(&mut self, cfg: &mut CFG, bb: Id, anchor: usize, instrs: Vec<Instruction>) -> Result<usize, InstrumentError> {
        self.insert(cfg, bb, anchor, true, instrs)
    }

    /// Remove the instruction at `idx` of `bb`. IT instructions cannot be removed directly,
    /// they disappear together with the last instruction of their group.
    pub fn remove(&mut self, cfg: &mut CFG, bb: Id, idx: usize) -> Result<Instruction, InstrumentError> {
        let block = Self::block_mut(cfg, bb)?;
        let list = block.instrs_mut();

        match list.get(idx) {
            None => return Err(InstrumentError::InvalidPosition(bb, idx)),
            Some(instr) if instr.opcode() == Opcode::It => return Err(InstrumentError::RemoveIt(bb, idx)),
            Some(_) => {},
        }

        let mut idx = idx;
        if let Some(it) = it::find_group(list, idx) {
            list.remove(it);
            idx -= 1;
        }

        let instr = list.remove(idx);
        it::repair(list);

        self.removed += 1;
        Ok(instr)
    }

    /// Split `bb` so that the instruction at `idx` becomes the first instruction of a new basic block.
    /// The new block directly follows `bb` in the layout, takes over all outgoing edges and
    /// is the fallthrough successor of `bb`.
    pub fn split_before(&mut self, cfg: &mut CFG, bb: Id, idx: usize) -> Result<Id, InstrumentError> {
        let block = Self::block_mut(cfg, bb)?;

        if idx > block.instrs().len() {
            return Err(InstrumentError::InvalidPosition(bb, idx));
        }

        let mut tail = block.split(idx);
        it::repair(block.instrs_mut());
        it::repair(tail.instrs_mut());

        let new = cfg.insert_basic_block_after(bb, tail).ok_or(InstrumentError::UnknownBasicBlock(bb))?;
        Self::block_mut(cfg, bb)?.add_edge(Edge::Next(new));

        self.splits += 1;
        Ok(new)
    }

    /// Split `bb` so that the instruction at `idx` becomes the last instruction of `bb`
    pub fn split_after(&mut self, cfg: &mut CFG, bb: Id, idx: usize) -> Result<Id, InstrumentError> {
        self.split_before(cfg, bb, idx + 1)
    }

    fn free_registers(live: RegSet, compact: bool) -> Vec<PhysReg> {
        let class = if compact { RegClass::LowGpr } else { RegClass::Gpr };
        class.registers().difference(live).iter().collect()
    }

    /// Registers that are not live right before the instruction at `idx` of `bb`.
    /// With `compact` only registers that fit 16-bit encodings are returned.
    pub fn free_registers_before(&self, cfg: &CFG, bb: Id, idx: usize, compact: bool) -> Result<Vec<PhysReg>, InstrumentError> {
        let live = Liveness::compute(cfg).live_before(cfg, bb, idx).ok_or(InstrumentError::InvalidPosition(bb, idx))?;
        Ok(Self::free_registers(live, compact))
    }

    /// Registers that are not live right after the instruction at `idx` of `bb`
    pub fn free_registers_after(&self, cfg: &CFG, bb: Id, idx: usize, compact: bool) -> Result<Vec<PhysReg>, InstrumentError> {
        let live = Liveness::compute(cfg).live_after(cfg, bb, idx).ok_or(InstrumentError::InvalidPosition(bb, idx))?;
        Ok(Self::free_registers(live, compact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Operand,
        Reg,
    };

    fn cfg_with(instrs: Vec<Instruction>) -> (CFG, Id) {
        let mut bb = BasicBlock::new();
        for instr in instrs {
            bb.insert(instr);
        }

        let mut cfg = CFG::new();
        let id = cfg.add_basic_block(bb);
        cfg.set_entry(id);
        (cfg, id)
    }

    fn mov(dst: PhysReg, src: PhysReg, pred: Cond) -> Instruction {
        Instruction::predicated(Opcode::Mov, vec![Operand::from(dst), Operand::from(src)], pred)
    }

    #[test]
    fn test_insert_into_group_adopts_predicate() {
        let (mut cfg, bb) = cfg_with(vec![
            Instruction::it(Cond::Eq, 0b1100),
            mov(PhysReg::r0, PhysReg::r1, Cond::Eq),
            mov(PhysReg::r0, PhysReg::r2, Cond::Ne),
            Instruction::new(Opcode::Return, vec![]),
        ]);
        let mut instrumentor = Instrumentor::new();

        let anchor = instrumentor.insert_before(&mut cfg, bb, 2, vec![mov(PhysReg::r3, PhysReg::r4, Cond::Al)]).unwrap();
        let instrs = cfg.basic_block(bb).unwrap().instrs();

        assert!(is_consistent(instrs));
        assert_eq!(instrs[anchor].operand(1), Some(&Operand::from(PhysReg::r2)));
        assert_eq!(instrs[anchor - 1].pred(), Cond::Ne);
        assert_eq!(instrs[0].it_fields(), Some((Cond::Eq, 0b1110)));
        assert_eq!(instrumentor.num_inserted(), 1);
    }

    #[test]
    fn test_insert_overflowing_group() {
        let (mut cfg, bb) = cfg_with(vec![
            Instruction::it(Cond::Eq, 0b0001),
            mov(PhysReg::r0, PhysReg::r1, Cond::Eq),
            mov(PhysReg::r0, PhysReg::r1, Cond::Eq),
            mov(PhysReg::r0, PhysReg::r1, Cond::Eq),
            mov(PhysReg::r0, PhysReg::r1, Cond::Eq),
        ]);
        let mut instrumentor = Instrumentor::new();

        let anchor = instrumentor.insert_after(&mut cfg, bb, 2, vec![mov(PhysReg::r5, PhysReg::r6, Cond::Al)]).unwrap();
        let instrs = cfg.basic_block(bb).unwrap().instrs();

        assert!(is_consistent(instrs));
        assert_eq!(anchor, 2);
        assert_eq!(instrs.iter().filter(|i| i.opcode() == Opcode::It).count(), 2);
        assert_eq!(instrs.iter().filter(|i| i.pred() == Cond::Eq && i.opcode() == Opcode::Mov).count(), 5);
    }

    #[test]
    fn test_remove() {
        let (mut cfg, bb) = cfg_with(vec![
            Instruction::it(Cond::Eq, 0b1100),
            mov(PhysReg::r0, PhysReg::r1, Cond::Eq),
            mov(PhysReg::r0, PhysReg::r2, Cond::Ne),
        ]);
        let mut instrumentor = Instrumentor::new();

        assert!(matches!(instrumentor.remove(&mut cfg, bb, 0), Err(InstrumentError::RemoveIt(_, 0))));

        instrumentor.remove(&mut cfg, bb, 1).unwrap();
        let instrs = cfg.basic_block(bb).unwrap().instrs();
        assert!(is_consistent(instrs));
        assert_eq!(instrs[0].it_fields(), Some((Cond::Ne, 0b1000)));
    }

    #[test]
    fn test_split_inside_group() {
        let (mut cfg, bb) = cfg_with(vec![
            Instruction::it(Cond::Eq, 0b0110),
            mov(PhysReg::r0, PhysReg::r1, Cond::Eq),
            mov(PhysReg::r0, PhysReg::r1, Cond::Eq),
            mov(PhysReg::r0, PhysReg::r1, Cond::Ne),
            Instruction::new(Opcode::Return, vec![]),
        ]);
        cfg.basic_block_mut(bb).unwrap().add_edge(Edge::Jump(bb));
        let mut instrumentor = Instrumentor::new();

        let new = instrumentor.split_before(&mut cfg, bb, 2).unwrap();

        let head = cfg.basic_block(bb).unwrap();
        let tail = cfg.basic_block(new).unwrap();
        assert!(is_consistent(head.instrs()));
        assert!(is_consistent(tail.instrs()));
        assert_eq!(head.instrs().len(), 2);
        assert_eq!(tail.instrs().len(), 4);
        assert_eq!(head.edges(), &[Edge::Next(new)]);
        assert_eq!(tail.edges(), &[Edge::Jump(bb)]);
        assert_eq!(cfg.layout_predecessor(new), Some(bb));
    }

    #[test]
    fn test_free_registers() {
        let (cfg, bb) = cfg_with(vec![
            Instruction::new(Opcode::MovImm, vec![Operand::Reg(Reg::Phys(PhysReg::r2)), Operand::Imm(3)]),
            Instruction::new(Opcode::CallIndirect, vec![Operand::from(PhysReg::r6)]),
            Instruction::new(Opcode::Return, vec![]),
        ]);
        let instrumentor = Instrumentor::new();

        let free = instrumentor.free_registers_before(&cfg, bb, 1, true).unwrap();
        assert!(!free.contains(&PhysReg::r2));
        assert!(!free.contains(&PhysReg::r6));
        assert!(!free.contains(&PhysReg::r4));
        assert!(free.is_empty() || free.iter().all(|r| r.is_low()));

        let free = instrumentor.free_registers_after(&cfg, bb, 1, false).unwrap();
        assert!(free.contains(&PhysReg::r2));
        assert!(free.contains(&PhysReg::r12));
        assert!(!free.contains(&PhysReg::lr));
    }
}
