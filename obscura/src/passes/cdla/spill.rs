use rustc_hash::FxHashMap;

use crate::{
    ir::{
        HasId,
        Id,
        Opcode,
        Operand,
        Program,
    },
    passes::cdla::CdlaError,
};

/// Answers for every function whether it may spill the link register to the stack,
/// i.e. whether its return address can end up in memory.
///
/// That is the case if
/// 1. the function has no body, or its callee-saved registers are not finalized (unknown code),
/// 2. the link register is among its callee-saved registers,
/// 3. it tail-calls a function that may spill the link register, or tail-calls through a
///    register or an external symbol.
///
/// Tail-call cycles resolve to the least fixed point: a cycle whose members all fail 1. and 2.
/// and only tail-call each other never spills.
pub struct SpillAnalysis {
    spills: FxHashMap<Id, bool>,
}

impl SpillAnalysis {
    pub fn compute(program: &Program) -> Result<Self, CdlaError> {
        let mut spills = FxHashMap::default();
        let mut tail_callers: FxHashMap<Id, Vec<Id>> = FxHashMap::default();
        let mut worklist = Vec::new();

        for func in program.iter_functions() {
            let mut spill = match (func.cfg(), func.callee_saved()) {
                (None, _) | (_, None) => true,
                _ => func.saves_link_register(),
            };

            if let Some(cfg) = func.cfg() {
                for bb in cfg.iter_basic_blocks() {
                    for instr in bb.instrs() {
                        match instr.opcode() {
                            Opcode::TailCall => match instr.operand(0) {
                                Some(Operand::Symbol {
                                    symbol,
                                    ..
                                }) => {
                                    let callee = program.resolve_function(*symbol)?;
                                    tail_callers.entry(callee).or_default().push(func.id());
                                },
                                Some(Operand::External(_)) => spill = true,
                                _ => {
                                    return Err(CdlaError::UnexpectedOperand {
                                        function: func.name().to_string(),
                                        opcode: instr.opcode(),
                                    })
                                },
                            },
                            Opcode::TailCallIndirect => spill = true,
                            _ => {},
                        }
                    }
                }
            }

            spills.insert(func.id(), spill);

            if spill {
                worklist.push(func.id());
            }
        }

        /* Propagate to the tail callers */
        while let Some(callee) = worklist.pop() {
            for caller in tail_callers.get(&callee).map(|c| c.as_slice()).unwrap_or(&[]) {
                if let Some(spill) = spills.get_mut(caller) {
                    if !*spill {
                        *spill = true;
                        worklist.push(*caller);
                    }
                }
            }
        }

        Ok(Self {
            spills,
        })
    }

    /// Whether `func` may spill the link register. Unknown functions are assumed to do so.
    pub fn can_spill_link_register(&self, func: Id) -> bool {
        self.spills.get(&func).copied().unwrap_or(true)
    }
}
