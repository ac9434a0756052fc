use thiserror::Error;

use crate::{
    instrument::is_consistent,
    ir::{
        BasicBlock,
        CFGError,
        Function,
        GlobalObject,
        HasId,
        Id,
        Instruction,
        Opcode,
        Operand,
        Pointer,
        Program,
        Reg,
        Symbol,
    },
    passes::Pass,
    Logger,
};

/// Everything the verifier complains about. If this error is returned then a pass
/// modified the program incorrectly.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Function {0} has an invalid CFG: {1}")]
    InvalidCfg(String, CFGError),

    #[error("Basic block {1} of function {0} has an inconsistent IT group")]
    InconsistentItGroup(String, Id),

    #[error("Basic block {1} of function {0} references an unknown {2}")]
    InvalidOperand(String, Id, &'static str),

    #[error("Function {0} uses virtual registers after register allocation")]
    VirtualRegisterAfterAllocation(String),

    #[error("Global {0} is bigger than its initializer allows")]
    InvalidInitializer(String),

    #[error("Global {0} contains a dangling pointer")]
    DanglingPointer(String),

    #[error("Symbol {0:?} in the used list does not exist")]
    InvalidUsedSymbol(Symbol),
}

fn symbol_exists(program: &Program, symbol: Symbol) -> bool {
    program.symbol_name(symbol).is_some()
}

fn verify_operand(program: &Program, func: &Function, bb: &BasicBlock, operand: &Operand) -> Result<(), VerifyError> {
    let cfg_has = |id: Id| func.cfg().map(|cfg| cfg.basic_block(id).is_some()).unwrap_or(false);
    let invalid = |what| VerifyError::InvalidOperand(func.name().to_string(), bb.id(), what);

    match operand {
        Operand::Symbol {
            symbol,
            ..
        } => {
            if !symbol_exists(program, *symbol) {
                return Err(invalid("symbol"));
            }
        },
        Operand::Block(id) => {
            if !cfg_has(*id) {
                return Err(invalid("basic block"));
            }
        },
        Operand::Frame(id) => {
            if func.frame().object(*id).is_none() {
                return Err(invalid("stack object"));
            }
        },
        Operand::Reg(Reg::Virt(reg)) => {
            if func.regs().is_allocated() {
                return Err(VerifyError::VirtualRegisterAfterAllocation(func.name().to_string()));
            }

            if func.regs().class_of(*reg).is_none() {
                return Err(invalid("virtual register"));
            }
        },
        Operand::Reg(_) | Operand::Imm(_) | Operand::External(_) => {},
    }

    Ok(())
}

fn verify_instruction(program: &Program, func: &Function, bb: &BasicBlock, instr: &Instruction) -> Result<(), VerifyError> {
    for operand in instr.operands() {
        verify_operand(program, func, bb, operand)?;
    }

    if instr.opcode() == Opcode::It && instr.it_fields().is_none() {
        return Err(VerifyError::InconsistentItGroup(func.name().to_string(), bb.id()));
    }

    Ok(())
}

fn verify_function(program: &Program, func: &Function) -> Result<(), VerifyError> {
    let Some(cfg) = func.cfg() else {
        return Ok(());
    };

    cfg.verify().map_err(|err| VerifyError::InvalidCfg(func.name().to_string(), err))?;

    for bb in cfg.iter_basic_blocks() {
        if !is_consistent(bb.instrs()) {
            return Err(VerifyError::InconsistentItGroup(func.name().to_string(), bb.id()));
        }

        for instr in bb.instrs() {
            verify_instruction(program, func, bb, instr)?;
        }
    }

    Ok(())
}

fn verify_pointer(program: &Program, pointer: &Pointer) -> bool {
    match pointer {
        Pointer::Null | Pointer::Raw(_) => true,
        Pointer::Global(pointer) => program.global(pointer.global).map(|g| pointer.offset < g.size().max(1)).unwrap_or(false),
        Pointer::Function(pointer) => program.function(pointer.function).is_some(),
        Pointer::BasicBlock(pointer) => program
            .function(pointer.function)
            .and_then(|f| f.cfg())
            .map(|cfg| cfg.basic_block(pointer.bb).is_some())
            .unwrap_or(false),
    }
}

fn verify_global(program: &Program, global: &GlobalObject) -> Result<(), VerifyError> {
    let Some(init) = global.initializer() else {
        return Ok(());
    };

    if init.pointers().len() * program.pointer_size() > global.size() {
        return Err(VerifyError::InvalidInitializer(global.name().to_string()));
    }

    for pointer in init.pointers() {
        if !verify_pointer(program, pointer) {
            return Err(VerifyError::DanglingPointer(global.name().to_string()));
        }
    }

    Ok(())
}

/// The VerifyPass is an internal pass that checks the consistency of a program:
/// CFG well-formedness, predicated instruction groups, operand and pointer references.
pub struct VerifyPass;

impl VerifyPass {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }
}

impl Pass for VerifyPass {
    type Error = VerifyError;

    fn name(&self) -> String {
        "VerifyPass".to_string()
    }

    fn run(&mut self, program: &mut Program, logger: &Logger) -> Result<bool, VerifyError> {
        for func in program.iter_functions() {
            logger.debug(format!("Verifying {}", func.name()));
            verify_function(program, func)?;
        }

        for global in program.iter_globals() {
            verify_global(program, global)?;
        }

        for symbol in program.used() {
            if !symbol_exists(program, *symbol) {
                return Err(VerifyError::InvalidUsedSymbol(*symbol));
            }
        }

        Ok(false)
    }
}
