use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

use crate::{
    ir::{
        CallGraph,
        GlobalObject,
        HasId,
        Id,
        Initializer,
        IrError,
        Linkage,
        Operand,
        Program,
        Symbol,
        Type,
    },
    passes::Pass,
    Logger,
};

/// Every byte of a function pointer slot in a promoted object is initialized with this value
pub const SENTINEL_BYTE: u8 = 0xff;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum PromoteError {
    #[error("Could not build the call graph: {0}")]
    Ir(#[from] IrError),

    #[error("Could not create a global for {0}: {1}")]
    InvalidGlobal(String, &'static str),
}

/// Numbers of the stack objects that hold function pointers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionStatistics {
    /// Objects moved into a global
    pub promoted: u64,
    /// Objects left on the stack because their function may be active more than once
    pub skipped_recursive: u64,
    /// Variable-sized objects
    pub not_eligible: u64,
}

struct Candidate {
    object: Id,
    name: String,
    size: usize,
    align: usize,
    ty: Type,
}

/* Zero everywhere except for the function pointer slots */
fn sentinel_initializer(ty: &Type, size: usize, ptr: usize) -> Initializer {
    let offsets = ty.function_pointer_offsets(ptr);

    if offsets.is_empty() {
        return Initializer::Zero;
    }

    let mut bytes = vec![0u8; size];

    for offset in offsets {
        let end = (offset + ptr).min(size);
        bytes[offset.min(end)..end].fill(SENTINEL_BYTE);
    }

    Initializer::Bytes(bytes)
}

/// Moves stack objects holding function pointers into dedicated private globals so that
/// return addresses and function pointers do not live next to each other on the stack.
///
/// A global has room for a single instance of the object. Functions that are part of a
/// call cycle may be active multiple times at once and are therefore skipped.
pub struct PromotePass {
    statistics: PromotionStatistics,
}

impl PromotePass {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            statistics: PromotionStatistics::default(),
        }
    }

    /// Statistics accumulated over all runs
    pub fn statistics(&self) -> &PromotionStatistics {
        &self.statistics
    }

    fn unique_name(program: &Program, func: &str, object: &str) -> String {
        let base = format!("{}.{}", func, object);
        let mut name = base.clone();
        let mut counter = 1;

        while program.symbol_by_name(&name).is_some() {
            name = format!("{}.{}", base, counter);
            counter += 1;
        }

        name
    }

    fn candidates(&mut self, program: &Program, func: Id, recursive: bool) -> Vec<Candidate> {
        let Some(function) = program.function(func) else {
            return Vec::new();
        };

        if !function.has_body() {
            return Vec::new();
        }

        let mut candidates = Vec::new();

        for object in function.frame().iter_objects() {
            let Some(ty) = object.ty() else {
                continue;
            };

            if !ty.contains_function_pointer() {
                continue;
            }

            if object.is_variable_sized() {
                self.statistics.not_eligible += 1;
            } else if recursive {
                self.statistics.skipped_recursive += 1;
            } else {
                candidates.push(Candidate {
                    object: object.id(),
                    name: Self::unique_name(program, function.name(), object.name()),
                    size: object.size(),
                    align: object.align(),
                    ty: ty.clone(),
                });
            }
        }

        candidates
    }

    fn promote(&mut self, program: &mut Program, func: Id, candidate: Candidate, logger: &Logger) -> Result<(), PromoteError> {
        let global = GlobalObject::builder()
            .name(&candidate.name)
            .size(candidate.size)
            .align(candidate.align.max(1))
            .initializer(sentinel_initializer(&candidate.ty, candidate.size, program.pointer_size()))
            .linkage(Linkage::Private)
            .ty(candidate.ty)
            .build()
            .map_err(|err| PromoteError::InvalidGlobal(candidate.name.clone(), err))?;
        let global = program.add_global(global)?;
        let replacement = Operand::symbol(Symbol::Global(global));

        let Some(function) = program.function_mut(func) else {
            return Ok(());
        };

        if let Some(cfg) = function.cfg_mut() {
            for bb in cfg.iter_basic_blocks_mut() {
                for instr in bb.instrs_mut().iter_mut() {
                    for operand in instr.operands_mut() {
                        if *operand == Operand::Frame(candidate.object) {
                            *operand = replacement.clone();
                        }
                    }
                }
            }
        }

        function.frame_mut().remove_object(candidate.object);

        logger.debug(format!("Promoted a stack object of {} to @{}", function.name(), candidate.name));
        self.statistics.promoted += 1;
        Ok(())
    }
}

impl Pass for PromotePass {
    type Error = PromoteError;

    fn name(&self) -> String {
        "PromotePass".to_string()
    }

    fn run(&mut self, program: &mut Program, logger: &Logger) -> Result<bool, PromoteError> {
        let callgraph = CallGraph::build(program)?;
        let before = self.statistics;

        for scc in callgraph.sccs() {
            for func in &scc.functions {
                for candidate in self.candidates(program, *func, scc.cyclic) {
                    self.promote(program, *func, candidate, logger)?;
                }
            }
        }

        logger.summary(
            "Stack objects with function pointers",
            &[
                ("promoted", self.statistics.promoted - before.promoted),
                ("recursive", self.statistics.skipped_recursive - before.skipped_recursive),
                ("variable-sized", self.statistics.not_eligible - before.not_eligible),
            ],
        );

        Ok(self.statistics.promoted > before.promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        BasicBlock,
        FrameInfo,
        Function,
        PhysReg,
        Reg,
        StackObject,
        CFG,
    };

    fn handler_type() -> Type {
        Type::Struct(vec![Type::Int(8), Type::FunctionPointer, Type::Int(32)])
    }

    /* A function that stores r0 into a function pointer slot of its stack object and calls `callee` */
    fn function(name: &str, object: StackObject, callee: Option<Symbol>) -> Function {
        let mut frame = FrameInfo::new();
        let slot = frame.add_object(object);

        let mut bb = BasicBlock::new();
        bb.store(Reg::Phys(PhysReg::r0), Operand::Frame(slot), 4);
        if let Some(callee) = callee {
            bb.call(callee);
        }
        bb.ret();

        let mut cfg = CFG::new();
        let entry = cfg.add_basic_block(bb);
        cfg.set_entry(entry);

        Function::builder().name(name).cfg(cfg).frame(frame).build().unwrap()
    }

    #[test]
    fn test_sentinel_initializer() {
        let init = sentinel_initializer(&handler_type(), 12, 4);
        assert_eq!(init, Initializer::Bytes(vec![0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]));
        assert_eq!(sentinel_initializer(&Type::Int(32), 4, 4), Initializer::Zero);
    }

    #[test]
    fn test_promotion() {
        let mut program = Program::new(4).unwrap();
        let f = program.add_function(function("main", StackObject::new("handler", Some(handler_type()), 12, 4), None)).unwrap();

        let mut pass = PromotePass::new();
        assert!(pass.run(&mut program, &Logger::spinner()).unwrap());

        let Some(Symbol::Global(global)) = program.symbol_by_name("main.handler") else {
            panic!("Promoted global is missing");
        };
        let global = program.global(global).unwrap();
        assert_eq!(global.size(), 12);
        assert_eq!(global.align(), 4);
        assert_eq!(global.linkage(), Linkage::Private);

        let func = program.function(f).unwrap();
        assert_eq!(func.frame().num_objects(), 0);

        let store = &func.cfg().unwrap().basic_block_at(0).unwrap().instrs()[0];
        assert_eq!(store.operand(1), Some(&Operand::symbol(Symbol::Global(global.id()))));
        assert_eq!(pass.statistics().promoted, 1);
    }

    #[test]
    fn test_recursion_is_skipped() {
        let mut program = Program::new(4).unwrap();
        let a = program.add_function(function("a", StackObject::new("fp", Some(Type::FunctionPointer), 4, 4), None)).unwrap();
        let b = program.add_function(function("b", StackObject::new("fp", Some(Type::FunctionPointer), 4, 4), Some(Symbol::Function(a)))).unwrap();

        /* a -> b -> a */
        let a_body = function("a", StackObject::new("fp", Some(Type::FunctionPointer), 4, 4), Some(Symbol::Function(b)));
        program.function_mut(a).unwrap().set_cfg(a_body.cfg().unwrap().clone());

        let leaf = program.add_function(function("leaf", StackObject::new("fp", Some(Type::FunctionPointer), 4, 4), None)).unwrap();
        let selfish = program.add_function(function("selfish", StackObject::new("fp", Some(Type::FunctionPointer), 4, 4), None)).unwrap();
        let selfish_body = function("selfish", StackObject::new("fp", Some(Type::FunctionPointer), 4, 4), Some(Symbol::Function(selfish)));
        program.function_mut(selfish).unwrap().set_cfg(selfish_body.cfg().unwrap().clone());

        let mut pass = PromotePass::new();
        pass.run(&mut program, &Logger::spinner()).unwrap();

        assert_eq!(pass.statistics().promoted, 1);
        assert_eq!(pass.statistics().skipped_recursive, 3);
        assert_eq!(program.function(leaf).unwrap().frame().num_objects(), 0);
        assert_eq!(program.function(a).unwrap().frame().num_objects(), 1);
        assert_eq!(program.function(b).unwrap().frame().num_objects(), 1);
        assert_eq!(program.function(selfish).unwrap().frame().num_objects(), 1);
    }

    #[test]
    fn test_not_eligible() {
        let mut program = Program::new(4).unwrap();
        program.add_function(function("vla", StackObject::variable_sized("fps", Some(Type::FunctionPointer), 4), None)).unwrap();
        program.add_function(function("ints", StackObject::new("buf", Some(Type::Array(Box::new(Type::Int(32)), 4)), 16, 4), None)).unwrap();

        let mut pass = PromotePass::new();
        assert!(!pass.run(&mut program, &Logger::spinner()).unwrap());
        assert_eq!(pass.statistics().not_eligible, 1);
        assert_eq!(program.num_globals(), 0);
    }

    #[test]
    fn test_name_collision() {
        let mut program = Program::new(4).unwrap();
        program.add_global(GlobalObject::builder().name("main.fp").size(4).initializer(Initializer::Zero).build().unwrap()).unwrap();
        program.add_function(function("main", StackObject::new("fp", Some(Type::FunctionPointer), 4, 4), None)).unwrap();

        PromotePass::new().run(&mut program, &Logger::spinner()).unwrap();
        assert!(program.symbol_by_name("main.fp.1").is_some());
    }
}
