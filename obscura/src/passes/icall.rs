use thiserror::Error;

use crate::{
    instrument::{
        InstrumentError,
        Instrumentor,
    },
    ir::{
        Cond,
        Function,
        HasId,
        Id,
        Instruction,
        Opcode,
        Operand,
        Program,
        Reg,
        RegClass,
    },
    passes::Pass,
    Logger,
};

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum ICallError {
    #[error("Indirect call in function {0} has no register operand")]
    UnexpectedOperand(String),

    #[error("No free register for the indirect call in basic block {1} of function {0}")]
    NoFreeRegister(String, Id),

    #[error("{0}")]
    InstrumentError(#[from] InstrumentError),
}

/// Forces the target register of every indirect call into the tail-call class (r0-r3, r12).
/// These registers are never saved as callee-saved registers, so function pointers
/// in them do not get spilled to the stack.
pub struct ICallLimiterPass {
    instrumentor: Instrumentor,
    limited: usize,
}

impl ICallLimiterPass {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            instrumentor: Instrumentor::new(),
            limited: 0,
        }
    }

    /// Number of indirect calls that were limited so far
    pub fn num_limited_calls(&self) -> usize {
        self.limited
    }

    /* Copy `target` into a register of the tail-call class in front of the call. Returns the new position of the call. */
    fn copy_target(&mut self, func: &mut Function, bb: Id, call: usize, target: Reg) -> Result<(usize, Reg), ICallError> {
        let name = func.name().to_string();
        let pred = func.cfg().and_then(|cfg| cfg.basic_block(bb)).and_then(|bb| bb.instr(call)).map(|instr| instr.pred()).ok_or(InstrumentError::InvalidPosition(bb, call))?;

        let (new, copy) = if func.regs().is_allocated() {
            let cfg = func.cfg().ok_or(InstrumentError::UnknownBasicBlock(bb))?;
            let free = self.instrumentor.free_registers_before(cfg, bb, call, false)?;
            let Some(reg) = free.into_iter().find(|reg| RegClass::TailCall.contains(*reg)) else {
                return Err(ICallError::NoFreeRegister(name, bb));
            };
            let new = Reg::Phys(reg);
            (new, Instruction::predicated(Opcode::Mov, vec![Operand::Reg(new), Operand::Reg(target)], pred))
        } else {
            let new = Reg::Virt(func.regs_mut().create_virtual(RegClass::TailCall));

            /* A copy cannot be predicated */
            let copy = if pred == Cond::Al {
                Instruction::new(Opcode::Copy, vec![Operand::Reg(new), Operand::Reg(target)])
            } else {
                Instruction::predicated(Opcode::Mov, vec![Operand::Reg(new), Operand::Reg(target)], pred)
            };
            (new, copy)
        };

        let cfg = func.cfg_mut().ok_or(InstrumentError::UnknownBasicBlock(bb))?;
        let call = self.instrumentor.insert_before(cfg, bb, call, vec![copy])?;
        Ok((call, new))
    }

    fn limit_function(&mut self, func: &mut Function, logger: &Logger) -> Result<bool, ICallError> {
        let Some(cfg) = func.cfg() else {
            return Ok(false);
        };

        let blocks: Vec<Id> = cfg.iter_basic_blocks().map(|bb| bb.id()).collect();
        let mut changed = false;

        for bb in blocks {
            let mut idx = 0;

            loop {
                let Some(instr) = func.cfg().and_then(|cfg| cfg.basic_block(bb)).and_then(|bb| bb.instr(idx)) else {
                    break;
                };

                if instr.opcode() != Opcode::CallIndirect {
                    idx += 1;
                    continue;
                }

                let Some(target) = instr.operand(0).and_then(|op| op.reg()) else {
                    return Err(ICallError::UnexpectedOperand(func.name().to_string()));
                };

                let mut call = idx;

                match target {
                    Reg::Virt(reg) => {
                        if func.regs_mut().constrain(reg, RegClass::TailCall).is_none() {
                            let (new_call, new) = self.copy_target(func, bb, call, target)?;
                            call = new_call;
                            set_target(func, bb, call, new);
                        }
                    },
                    Reg::Phys(reg) if !RegClass::TailCall.contains(reg) => {
                        let (new_call, new) = self.copy_target(func, bb, call, target)?;
                        call = new_call;
                        set_target(func, bb, call, new);
                        logger.debug(format!("Moved the target of an indirect call in {} out of {}", func.name(), reg));
                    },
                    Reg::Phys(_) => {},
                }

                if let Some(instr) = func.cfg_mut().and_then(|cfg| cfg.basic_block_mut(bb)).and_then(|bb| bb.instr_mut(call)) {
                    instr.set_opcode(Opcode::CallIndirectLimited);
                }

                self.limited += 1;
                changed = true;
                idx = call + 1;
            }
        }

        Ok(changed)
    }
}

fn set_target(func: &mut Function, bb: Id, call: usize, target: Reg) {
    if let Some(instr) = func.cfg_mut().and_then(|cfg| cfg.basic_block_mut(bb)).and_then(|bb| bb.instr_mut(call)) {
        instr.set_operand(0, Operand::Reg(target));
    }
}

impl Pass for ICallLimiterPass {
    type Error = ICallError;

    fn name(&self) -> String {
        "ICallLimiterPass".to_string()
    }

    fn run(&mut self, program: &mut Program, logger: &Logger) -> Result<bool, ICallError> {
        let before = self.limited;
        let mut changed = false;

        for func in program.iter_functions_mut() {
            changed |= self.limit_function(func, logger)?;
        }

        logger.info(format!("Limited {} indirect calls", self.limited - before));
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        BasicBlock,
        PhysReg,
        CFG,
    };

    fn program_with(bb: BasicBlock, allocated: bool, build: impl FnOnce(&mut Function)) -> (Program, Id) {
        let mut cfg = CFG::new();
        let entry = cfg.add_basic_block(bb);
        cfg.set_entry(entry);

        let mut func = Function::builder().name("f").cfg(cfg).allocated(allocated).build().unwrap();
        build(&mut func);

        let mut program = Program::new(4).unwrap();
        let id = program.add_function(func).unwrap();
        (program, id)
    }

    fn instrs(program: &Program, func: Id) -> Vec<Instruction> {
        let cfg = program.function(func).unwrap().cfg().unwrap();
        cfg.basic_block_at(0).unwrap().instrs().to_vec()
    }

    #[test]
    fn test_virtual_target_is_constrained() {
        let mut reg = None;
        let (mut program, f) = program_with(BasicBlock::new(), false, |func| {
            let vreg = func.regs_mut().create_virtual(RegClass::Gpr);
            let cfg = func.cfg_mut().unwrap();
            let bb = cfg.basic_block_at_mut(0).unwrap();
            bb.call_indirect(Reg::Virt(vreg));
            bb.ret();
            reg = Some(vreg);
        });

        let mut pass = ICallLimiterPass::new();
        assert!(pass.run(&mut program, &Logger::spinner()).unwrap());

        let func = program.function(f).unwrap();
        assert_eq!(func.regs().class_of(reg.unwrap()), Some(RegClass::TailCall));
        assert_eq!(func.regs().num_virtuals(), 1);
        assert_eq!(instrs(&program, f)[0].opcode(), Opcode::CallIndirectLimited);
        assert_eq!(pass.num_limited_calls(), 1);
    }

    #[test]
    fn test_physical_target_is_copied() {
        let mut bb = BasicBlock::new();
        bb.call_indirect(Reg::Phys(PhysReg::r5));
        bb.call_indirect(Reg::Phys(PhysReg::r12));
        bb.ret();
        let (mut program, f) = program_with(bb, false, |_| {});

        let mut pass = ICallLimiterPass::new();
        assert!(pass.run(&mut program, &Logger::spinner()).unwrap());

        let instrs = instrs(&program, f);
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[0].opcode(), Opcode::Copy);
        assert_eq!(instrs[0].operand(1), Some(&Operand::from(PhysReg::r5)));
        assert_eq!(instrs[1].opcode(), Opcode::CallIndirectLimited);
        assert_eq!(instrs[1].operand(0), instrs[0].operand(0));
        assert_eq!(instrs[2].opcode(), Opcode::CallIndirectLimited);
        assert_eq!(instrs[2].operand(0), Some(&Operand::from(PhysReg::r12)));

        /* At most one new virtual register per call */
        assert_eq!(program.function(f).unwrap().regs().num_virtuals(), 1);
        assert_eq!(pass.num_limited_calls(), 2);
    }

    #[test]
    fn test_predicated_call() {
        let mut bb = BasicBlock::new();
        bb.cmp(Reg::Phys(PhysReg::r0), Operand::Imm(0));
        bb.it(Cond::Ne, 0b1000);
        bb.insert(Instruction::predicated(Opcode::CallIndirect, vec![Operand::from(PhysReg::r6)], Cond::Ne));
        bb.ret();
        let (mut program, f) = program_with(bb, false, |_| {});

        ICallLimiterPass::new().run(&mut program, &Logger::spinner()).unwrap();

        let instrs = instrs(&program, f);
        assert_eq!(instrs.len(), 5);
        assert_eq!(instrs[1].it_fields(), Some((Cond::Ne, 0b0100)));
        assert_eq!(instrs[2].opcode(), Opcode::Mov);
        assert_eq!(instrs[2].pred(), Cond::Ne);
        assert_eq!(instrs[3].opcode(), Opcode::CallIndirectLimited);
        assert_eq!(instrs[3].pred(), Cond::Ne);
    }

    #[test]
    fn test_after_register_allocation() {
        let mut bb = BasicBlock::new();
        bb.call_indirect(Reg::Phys(PhysReg::r7));
        bb.ret();
        let (mut program, f) = program_with(bb, true, |_| {});

        ICallLimiterPass::new().run(&mut program, &Logger::spinner()).unwrap();

        let instrs = instrs(&program, f);
        assert_eq!(instrs[0].opcode(), Opcode::Mov);
        assert_eq!(instrs[0].operands(), &[Operand::from(PhysReg::r12), Operand::from(PhysReg::r7)]);
        assert_eq!(instrs[1].operand(0), Some(&Operand::from(PhysReg::r12)));
    }

    #[test]
    fn test_no_free_register() {
        /* A predicated call does not clobber r12 for sure, so r12 stays live in front of it */
        let mut bb = BasicBlock::new();
        bb.cmp(Reg::Phys(PhysReg::r0), Operand::Imm(0));
        bb.it(Cond::Ne, 0b1000);
        bb.insert(Instruction::predicated(Opcode::CallIndirect, vec![Operand::from(PhysReg::r7)], Cond::Ne));
        bb.add(Reg::Phys(PhysReg::r0), Reg::Phys(PhysReg::r12), Operand::Imm(1));
        bb.ret();
        let (mut program, _) = program_with(bb, true, |_| {});

        assert!(matches!(ICallLimiterPass::new().run(&mut program, &Logger::spinner()), Err(ICallError::NoFreeRegister(..))));
    }
}
