use rustc_hash::FxHashMap;

use crate::ir::{
    HasId,
    Id,
    Instruction,
    RegSet,
    CFG,
};

/// Backward transfer function of a single instruction.
/// Predicated instructions may not execute, so their definitions do not end a live range.
pub(crate) fn transfer(instr: &Instruction, live: RegSet) -> RegSet {
    if instr.is_conditional() {
        live.union(instr.phys_uses())
    } else {
        live.difference(instr.phys_defs()).union(instr.phys_uses())
    }
}

/// Physical register liveness of a CFG
pub(crate) struct Liveness {
    live_out: FxHashMap<Id, RegSet>,
}

impl Liveness {
    pub(crate) fn compute(cfg: &CFG) -> Self {
        let mut live_in: FxHashMap<Id, RegSet> = FxHashMap::default();
        let mut live_out: FxHashMap<Id, RegSet> = FxHashMap::default();
        let mut changed = true;

        while changed {
            changed = false;

            for bb in cfg.iter_basic_blocks().rev() {
                let mut out = RegSet::new();

                for edge in bb.edges() {
                    out = out.union(live_in.get(&edge.target()).copied().unwrap_or_default());
                }

                let mut live = out;
                for instr in bb.instrs().iter().rev() {
                    live = transfer(instr, live);
                }

                live_out.insert(bb.id(), out);

                if live_in.get(&bb.id()) != Some(&live) {
                    live_in.insert(bb.id(), live);
                    changed = true;
                }
            }
        }

        Self {
            live_out,
        }
    }

    /// Registers live right before the instruction at `idx` of `bb`
    pub(crate) fn live_before(&self, cfg: &CFG, bb: Id, idx: usize) -> Option<RegSet> {
        self.live_from(cfg, bb, idx)
    }

    /// Registers live right after the instruction at `idx` of `bb`
    pub(crate) fn live_after(&self, cfg: &CFG, bb: Id, idx: usize) -> Option<RegSet> {
        self.live_from(cfg, bb, idx + 1)
    }

    fn live_from(&self, cfg: &CFG, bb: Id, idx: usize) -> Option<RegSet> {
        let block = cfg.basic_block(bb)?;

        if idx > block.instrs().len() {
            return None;
        }

        let mut live = self.live_out.get(&bb).copied().unwrap_or_default();

        for instr in block.instrs()[idx..].iter().rev() {
            live = transfer(instr, live);
        }

        Some(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        BasicBlock,
        Edge,
        Operand,
        PhysReg,
        Reg,
    };

    #[test]
    fn test_liveness_across_blocks() {
        let mut cfg = CFG::new();

        let mut entry = BasicBlock::new();
        entry.mov_imm(Reg::Phys(PhysReg::r5), 1);
        entry.nop();
        let entry = cfg.add_basic_block(entry);

        let mut exit = BasicBlock::new();
        exit.add(Reg::Phys(PhysReg::r0), Reg::Phys(PhysReg::r5), Operand::Imm(1));
        exit.ret();
        let exit = cfg.add_basic_block(exit);

        cfg.basic_block_mut(entry).unwrap().add_edge(Edge::Next(exit));
        cfg.set_entry(entry);

        let liveness = Liveness::compute(&cfg);

        let before_mov = liveness.live_before(&cfg, entry, 0).unwrap();
        assert!(!before_mov.contains(PhysReg::r5));
        assert!(!before_mov.contains(PhysReg::r0));
        assert!(before_mov.contains(PhysReg::lr));

        let after_mov = liveness.live_after(&cfg, entry, 0).unwrap();
        assert!(after_mov.contains(PhysReg::r5));
        assert!(!after_mov.contains(PhysReg::r2));
    }
}
