//! Control data leakage analysis.
//!
//! Estimates how much code an attacker could locate by disclosing control data:
//! function pointers that escape to memory and return addresses that are spilled to the stack.
//! The analysis never modifies the program.

mod escape;
mod spill;

pub use escape::is_really_address_taken;
use rustc_hash::FxHashSet;
use serde::{
    Deserialize,
    Serialize,
};
pub use spill::SpillAnalysis;
use thiserror::Error;

use crate::{
    ir::{
        BasicBlock,
        HasId,
        Id,
        Instruction,
        IrError,
        Opcode,
        Operand,
        Program,
        CFG,
    },
    passes::Pass,
    Logger,
};

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum CdlaError {
    #[error("Could not resolve a call target: {0}")]
    Ir(#[from] IrError),

    #[error("Unrecognized operand of {opcode:?} in function {function}")]
    UnexpectedOperand {
        function: String,
        opcode: Opcode,
    },
}

/// Sizes and counts of one analysis run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakageStatistics {
    /// Size of all code in bytes
    pub code_size: u64,
    /// Size of the code leakable through any channel (every block counted once)
    pub code_size_leakable: u64,
    /// Size of the code leakable via function pointers
    pub code_size_leakable_via_func_ptr: u64,
    /// Size of the code leakable via return addresses
    pub code_size_leakable_via_ret_addr: u64,
    pub num_funcs: u64,
    pub num_funcs_leakable: u64,
    pub num_bbs: u64,
    pub num_bbs_leakable: u64,
}

impl LeakageStatistics {
    /// Add the numbers of `other` to these
    pub fn add(&mut self, other: &LeakageStatistics) {
        self.code_size += other.code_size;
        self.code_size_leakable += other.code_size_leakable;
        self.code_size_leakable_via_func_ptr += other.code_size_leakable_via_func_ptr;
        self.code_size_leakable_via_ret_addr += other.code_size_leakable_via_ret_addr;
        self.num_funcs += other.num_funcs;
        self.num_funcs_leakable += other.num_funcs_leakable;
        self.num_bbs += other.num_bbs;
        self.num_bbs_leakable += other.num_bbs_leakable;
    }
}

/// Statistics of the code before and after hardening
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub original: LeakageStatistics,
    pub transformed: LeakageStatistics,
}

impl Statistics {
    /// Accumulate the statistics of another run
    pub fn merge(&mut self, other: &Statistics) {
        self.original.add(&other.original);
        self.transformed.add(&other.transformed);
    }
}

/// Runs the control data leakage analysis.
/// `post_hardening` selects whether the results count as original or as transformed code.
pub struct LeakageAnalysisPass {
    post_hardening: bool,
    leakable: FxHashSet<(Id, Id)>,
    leakable_funcs: FxHashSet<Id>,
    statistics: Statistics,
}

impl LeakageAnalysisPass {
    pub fn new(post_hardening: bool) -> Self {
        Self {
            post_hardening,
            leakable: FxHashSet::default(),
            leakable_funcs: FxHashSet::default(),
            statistics: Statistics::default(),
        }
    }

    /// The statistics of the last run
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Whether basic block `bb` of function `func` was found leakable in the last run
    pub fn is_leakable_block(&self, func: Id, bb: Id) -> bool {
        self.leakable.contains(&(func, bb))
    }

    /// Whether the address of function `func` escapes according to the last run
    pub fn is_leakable_function(&self, func: Id) -> bool {
        self.leakable_funcs.contains(&func)
    }

    /* Can the return address of this call end up in memory? */
    fn call_may_leak(program: &Program, spills: &SpillAnalysis, function: &str, instr: &Instruction) -> Result<bool, CdlaError> {
        match instr.opcode() {
            Opcode::Call => match instr.operand(0) {
                Some(Operand::Symbol {
                    symbol,
                    ..
                }) => {
                    let callee = program.resolve_function(*symbol)?;
                    Ok(spills.can_spill_link_register(callee))
                },
                Some(Operand::External(_)) => Ok(true),
                _ => Err(CdlaError::UnexpectedOperand {
                    function: function.to_string(),
                    opcode: instr.opcode(),
                }),
            },
            Opcode::CallIndirect | Opcode::CallIndirectLimited => Ok(true),
            _ => Ok(false),
        }
    }

    fn determine_leakability(&self, program: &Program, spills: &SpillAnalysis, func: Id, name: &str, cfg: &CFG, bb: &BasicBlock) -> Result<bool, CdlaError> {
        /* A return address pointing into this block may be spilled by a call at the end of the layout predecessor */
        if let Some(pred) = cfg.layout_predecessor(bb.id()) {
            if self.leakable.contains(&(func, pred)) {
                return Ok(true);
            }

            if let Some((_, last)) = cfg.basic_block(pred).and_then(|pred| pred.last_non_debug()) {
                if Self::call_may_leak(program, spills, name, last)? {
                    return Ok(true);
                }
            }
        }

        /* Calls in the middle of the block return into the block itself */
        let last = bb.last_non_debug().map(|(idx, _)| idx);

        for (idx, instr) in bb.instrs().iter().enumerate() {
            if Self::call_may_leak(program, spills, name, instr)? && Some(idx) != last {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Analyze the whole program and return the statistics of this run
    pub fn analyze(&mut self, program: &Program, logger: &Logger) -> Result<Statistics, CdlaError> {
        self.leakable.clear();
        self.leakable_funcs.clear();

        let spills = SpillAnalysis::compute(program)?;
        let mut stats = LeakageStatistics::default();

        for func in program.iter_functions() {
            let Some(cfg) = func.cfg() else {
                continue;
            };

            stats.num_funcs += 1;

            for bb in cfg.iter_basic_blocks().filter(|bb| !bb.is_trap()) {
                stats.num_bbs += 1;
                stats.code_size += bb.size() as u64;
            }

            /* The whole function is leakable if its address escapes to memory */
            if is_really_address_taken(program, func, logger) {
                stats.num_funcs_leakable += 1;
                self.leakable_funcs.insert(func.id());

                for bb in cfg.iter_basic_blocks().filter(|bb| !bb.is_trap()) {
                    let size = bb.size() as u64;
                    stats.code_size_leakable_via_func_ptr += size;

                    if self.leakable.insert((func.id(), bb.id())) {
                        stats.code_size_leakable += size;
                    }
                }
            }

            for bb in cfg.iter_basic_blocks().filter(|bb| !bb.is_trap()) {
                if self.determine_leakability(program, &spills, func.id(), func.name(), cfg, bb)? {
                    let size = bb.size() as u64;
                    stats.num_bbs_leakable += 1;
                    stats.code_size_leakable_via_ret_addr += size;

                    if self.leakable.insert((func.id(), bb.id())) {
                        stats.code_size_leakable += size;
                    }
                }
            }
        }

        let mut statistics = Statistics::default();

        if self.post_hardening {
            statistics.transformed = stats;
        } else {
            statistics.original = stats;
        }

        self.statistics = statistics;
        Ok(statistics)
    }
}

impl Pass for LeakageAnalysisPass {
    type Error = CdlaError;

    fn name(&self) -> String {
        "LeakageAnalysisPass".to_string()
    }

    fn run(&mut self, program: &mut Program, logger: &Logger) -> Result<bool, CdlaError> {
        let statistics = self.analyze(program, logger)?;
        let stats = if self.post_hardening { &statistics.transformed } else { &statistics.original };

        logger.summary(
            "Code bytes",
            &[
                ("total", stats.code_size),
                ("leakable", stats.code_size_leakable),
                ("via function pointers", stats.code_size_leakable_via_func_ptr),
                ("via return addresses", stats.code_size_leakable_via_ret_addr),
            ],
        );
        logger.summary(
            "Functions and basic blocks",
            &[
                ("functions", stats.num_funcs),
                ("leakable functions", stats.num_funcs_leakable),
                ("basic blocks", stats.num_bbs),
                ("leakable basic blocks", stats.num_bbs_leakable),
            ],
        );

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Edge,
        Function,
        PhysReg,
        Reg,
        Symbol,
        ValueKind,
    };

    /* Builds a function from a list of blocks, each block described by a closure */
    fn function(name: &str, blocks: Vec<Box<dyn FnOnce(&mut BasicBlock)>>) -> (Function, Vec<Id>) {
        let mut cfg = CFG::new();
        let mut ids = Vec::new();

        for build in blocks {
            let mut bb = BasicBlock::new();
            build(&mut bb);
            ids.push(cfg.add_basic_block(bb));
        }

        for pair in ids.windows(2) {
            cfg.basic_block_mut(pair[0]).unwrap().add_edge(Edge::Next(pair[1]));
        }
        cfg.set_entry(ids[0]);

        let func = Function::builder().name(name).cfg(cfg).callee_saved(vec![PhysReg::r4, PhysReg::lr]).build().unwrap();
        (func, ids)
    }

    fn leaf(name: &str) -> Function {
        let (mut func, _) = function(name, vec![Box::new(|bb: &mut BasicBlock| bb.ret())]);
        func.set_callee_saved(vec![]);
        func
    }

    #[test]
    fn test_leakability_propagates_along_layout() {
        let mut program = Program::new(4).unwrap();
        let leaf = program.add_function(leaf("leaf")).unwrap();

        let (func, ids) = function(
            "main",
            vec![
                Box::new(move |bb: &mut BasicBlock| bb.call(Symbol::Function(leaf))),
                Box::new(|bb: &mut BasicBlock| bb.call_indirect(Reg::Phys(PhysReg::r3))),
                Box::new(|bb: &mut BasicBlock| bb.nop()),
                Box::new(|bb: &mut BasicBlock| bb.ret()),
            ],
        );
        let main = program.add_function(func).unwrap();

        let mut pass = LeakageAnalysisPass::new(false);
        let stats = pass.analyze(&program, &Logger::spinner()).unwrap();

        /* A call to a leaf does not leak, an indirect call leaks every following block */
        assert!(!pass.is_leakable_block(main, ids[0]));
        assert!(!pass.is_leakable_block(main, ids[1]));
        assert!(pass.is_leakable_block(main, ids[2]));
        assert!(pass.is_leakable_block(main, ids[3]));

        assert_eq!(stats.original.num_funcs, 2);
        assert_eq!(stats.original.num_bbs, 5);
        assert_eq!(stats.original.num_bbs_leakable, 2);
        assert_eq!(stats.original.code_size_leakable, 4);
        assert_eq!(stats.original.code_size_leakable_via_func_ptr, 0);
        assert_eq!(stats.transformed, LeakageStatistics::default());
    }

    #[test]
    fn test_call_in_the_middle() {
        let mut program = Program::new(4).unwrap();
        let (func, ids) = function(
            "main",
            vec![Box::new(|bb: &mut BasicBlock| {
                bb.call_external("printf");
                bb.debug();
            }), Box::new(|bb: &mut BasicBlock| {
                bb.call_external("printf");
                bb.ret();
            })],
        );
        let main = program.add_function(func).unwrap();

        let mut pass = LeakageAnalysisPass::new(true);
        let stats = pass.analyze(&program, &Logger::spinner()).unwrap();

        /* The first call is the last non-debug instruction of its block */
        assert!(!pass.is_leakable_block(main, ids[0]));
        assert!(pass.is_leakable_block(main, ids[1]));
        assert_eq!(stats.transformed.num_bbs_leakable, 1);
    }

    #[test]
    fn test_trap_blocks_are_ignored() {
        let mut program = Program::new(4).unwrap();
        let (mut func, _) = function("main", vec![Box::new(|bb: &mut BasicBlock| bb.call_external("abort"))]);
        let cfg = func.cfg_mut().unwrap();
        let last = cfg.basic_block_at(0).unwrap().id();
        let trap = cfg.add_basic_block(BasicBlock::trap_block());
        cfg.basic_block_mut(last).unwrap().add_edge(Edge::Next(trap));
        program.add_function(func).unwrap();

        let stats = LeakageAnalysisPass::new(false).analyze(&program, &Logger::spinner()).unwrap();
        assert_eq!(stats.original.num_bbs, 1);
        assert_eq!(stats.original.num_bbs_leakable, 0);
        assert_eq!(stats.original.code_size, 4);
    }

    #[test]
    fn test_compare_vs_store() {
        let mut program = Program::new(4).unwrap();
        let unused = program.add_function(leaf("unused")).unwrap();
        let compared = program.add_function(leaf("compared")).unwrap();
        let stored = program.add_function(leaf("stored")).unwrap();

        program.function_mut(compared).unwrap().set_address_taken(true);
        program.function_mut(stored).unwrap().set_address_taken(true);

        let cv = program.value_of(Symbol::Function(compared)).unwrap();
        let sv = program.value_of(Symbol::Function(stored)).unwrap();
        program.values_mut().add(ValueKind::Compare, &[cv]);
        program.values_mut().add(ValueKind::Store, &[sv]);

        let mut pass = LeakageAnalysisPass::new(false);
        let stats = pass.analyze(&program, &Logger::spinner()).unwrap();

        assert!(!pass.is_leakable_function(unused));
        assert!(!pass.is_leakable_function(compared));
        assert!(pass.is_leakable_function(stored));
        assert_eq!(stats.original.num_funcs, 3);
        assert_eq!(stats.original.num_funcs_leakable, 1);
        assert_eq!(stats.original.code_size_leakable_via_func_ptr, 2);
        assert_eq!(stats.original.code_size_leakable, 2);
    }

    #[test]
    fn test_rerun_clears_state() {
        let mut program = Program::new(4).unwrap();
        let (func, ids) = function("main", vec![Box::new(|bb: &mut BasicBlock| {
            bb.call_external("printf");
            bb.ret();
        })]);
        let main = program.add_function(func).unwrap();

        let mut pass = LeakageAnalysisPass::new(false);
        pass.analyze(&program, &Logger::spinner()).unwrap();
        assert!(pass.is_leakable_block(main, ids[0]));

        let cfg = program.function_mut(main).unwrap().cfg_mut().unwrap();
        let bb = cfg.basic_block_mut(ids[0]).unwrap();
        bb.set_cursor(0);
        bb.delete_instr();

        let stats = pass.analyze(&program, &Logger::spinner()).unwrap();
        assert!(!pass.is_leakable_block(main, ids[0]));
        assert_eq!(stats.original.code_size_leakable, 0);
    }
}
