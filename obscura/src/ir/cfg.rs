use paste::paste;
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::ir::{
    idmap::{
        idmap_functions,
        HasId,
        HasIdMut,
        Id,
        IdMap,
        IdMapValues,
        IdMapValuesMut,
    },
    instr::{
        Cond,
        Instruction,
        Opcode,
        Operand,
    },
    program::Symbol,
    register::{
        PhysReg,
        Reg,
    },
};

/// This error type shows everything that can go wrong when synthesizing basic blocks or CFGs.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum CFGError {
    #[error("Invalid entry: {0}")]
    InvalidEntry(Id),

    #[error("Basic block has no id")]
    NoId,

    #[error("CFG is empty")]
    CfgEmpty,

    #[error("Basic block {0} has invalid edge target: {1}")]
    InvalidTarget(Id, Id),

    #[error("Multiple next basic blocks found in basic block {0}")]
    MultipleNextBasicBlocks(Id),

    #[error("Trap block {0} does not start with a trap instruction")]
    InvalidTrapBlock(Id),
}

/// An Edge is an edge in the CFG
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Edge {
    /// The "next" edge points to the basic block that immediately follows the source basic block
    /// in the layout order (fallthrough).
    Next(Id),

    /// The "jump" edge points to a basic block that is reached by a branch
    Jump(Id),
}

impl Edge {
    /// The destination basic block of this edge
    pub fn target(&self) -> Id {
        match self {
            Edge::Next(id) | Edge::Jump(id) => *id,
        }
    }
}

/// A BasicBlock is a sequence of machine instructions.
///
/// Instructions are synthesized at the position of the cursor, which advances with every
/// inserted instruction.
#[derive(Debug, Clone, Hash)]
pub struct BasicBlock {
    id: Id,
    instrs: Vec<Instruction>,
    cursor: usize,
    edges: Vec<Edge>,
    trap: bool,
}

impl HasId for BasicBlock {
    fn id(&self) -> Id {
        self.id
    }
}

impl HasIdMut for BasicBlock {
    fn id_mut(&mut self) -> &mut Id {
        &mut self.id
    }
}

impl BasicBlock {
    /// Create a new, empty BasicBlock
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            id: Id::default(),
            instrs: Vec::new(),
            cursor: 0,
            edges: Vec::new(),
            trap: false,
        }
    }

    /// Create a trap block as emitted by the code layout randomizer:
    /// a single permanently undefined instruction whose operand has not been etched yet.
    pub fn trap_block() -> Self {
        let mut bb = Self::new();
        bb.trap(0);
        bb.trap = true;
        bb
    }

    /// Whether this block is a trap block
    pub fn is_trap(&self) -> bool {
        self.trap
    }

    /// Mark or unmark this block as a trap block
    pub fn set_trap(&mut self, trap: bool) {
        self.trap = trap;
    }

    /// The outgoing edges of this basic block
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Add an outgoing edge to this basic block
    pub fn add_edge(&mut self, edge: Edge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    /// Delete an outgoing edge from this basic block
    pub fn delete_edge(&mut self, id: Id) -> Option<Edge> {
        let idx = self.edges.iter().position(|edge| edge.target() == id)?;
        Some(self.edges.remove(idx))
    }

    pub(crate) fn take_edges(&mut self) -> Vec<Edge> {
        std::mem::take(&mut self.edges)
    }

    /// Check if this basic block has an outgoing `Edge::Next` edge and return its destination
    pub fn next_basic_block(&self) -> Option<Id> {
        self.edges.iter().find_map(|edge| match edge {
            Edge::Next(id) => Some(*id),
            _ => None,
        })
    }

    /// Check if this basic block has an outgoing `Edge::Jump` edge and return its destination
    pub fn jump_target(&self) -> Option<Id> {
        self.edges.iter().find_map(|edge| match edge {
            Edge::Jump(id) => Some(*id),
            _ => None,
        })
    }

    /// Get the instructions of this basic block
    pub fn instrs(&self) -> &[Instruction] {
        &self.instrs
    }

    pub(crate) fn instrs_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.instrs
    }

    /// Get the instruction at position `idx`
    pub fn instr(&self, idx: usize) -> Option<&Instruction> {
        self.instrs.get(idx)
    }

    /// Get the instruction at position `idx`
    pub fn instr_mut(&mut self, idx: usize) -> Option<&mut Instruction> {
        self.instrs.get_mut(idx)
    }

    /// The last instruction that produces code, together with its position
    pub fn last_non_debug(&self) -> Option<(usize, &Instruction)> {
        self.instrs.iter().enumerate().rev().find(|(_, instr)| !instr.is_debug())
    }

    /// Encoded size of this basic block in bytes
    pub fn size(&self) -> usize {
        self.instrs.iter().map(|instr| instr.size()).sum()
    }

    /// Update the instruction cursor
    pub fn set_cursor(&mut self, idx: usize) {
        assert!(idx <= self.instrs.len());
        self.cursor = idx;
    }

    /// Set the cursor to the end of the instruction list. This enables appending instructions.
    pub fn move_cursor_beyond_end(&mut self) {
        self.cursor = self.instrs.len();
    }

    /// Get the current cursor position
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Get the instruction at the current cursor position
    pub fn cursor_instr(&self) -> Option<&Instruction> {
        self.instrs.get(self.cursor)
    }

    /// Delete and return the instruction at the current cursor position
    pub fn delete_instr(&mut self) -> Instruction {
        let instr = self.instrs.remove(self.cursor);
        self.cursor = std::cmp::min(self.cursor, self.instrs.len());
        instr
    }

    /// Insert an arbitrary instruction at the cursor position
    pub fn insert(&mut self, instr: Instruction) {
        self.instrs.insert(self.cursor, instr);
        self.cursor += 1;
    }

    /// Split this basic block in two at position `idx`.
    /// All edges move to the returned basic block.
    pub(crate) fn split(&mut self, idx: usize) -> Self {
        let instrs = self.instrs.split_off(idx);
        let edges = self.take_edges();
        self.cursor = std::cmp::min(self.cursor, self.instrs.len());

        BasicBlock {
            id: Id::default(),
            instrs,
            cursor: 0,
            edges,
            trap: false,
        }
    }

    /// Verify the internal state of this basic block
    pub fn verify(&self) -> Result<(), CFGError> {
        if self.id == Id::default() {
            return Err(CFGError::NoId);
        }

        let num_next = self.edges.iter().filter(|edge| matches!(edge, Edge::Next(_))).count();

        if num_next > 1 {
            return Err(CFGError::MultipleNextBasicBlocks(self.id));
        }

        if self.trap && !matches!(self.instrs.first().map(|i| i.opcode()), Some(Opcode::Trap)) {
            return Err(CFGError::InvalidTrapBlock(self.id));
        }

        Ok(())
    }
}

/* Instruction synthesis */
impl BasicBlock {
    pub fn nop(&mut self) {
        self.insert(Instruction::new(Opcode::Nop, vec![]));
    }

    pub fn debug(&mut self) {
        self.insert(Instruction::new(Opcode::Debug, vec![]));
    }

    pub fn trap(&mut self, imm: i64) {
        self.insert(Instruction::new(Opcode::Trap, vec![Operand::Imm(imm)]));
    }

    pub fn it(&mut self, first: Cond, mask: u8) {
        self.insert(Instruction::it(first, mask));
    }

    pub fn copy(&mut self, dst: Reg, src: Reg) {
        self.insert(Instruction::new(Opcode::Copy, vec![dst.into(), src.into()]));
    }

    pub fn mov(&mut self, dst: Reg, src: Reg) {
        self.insert(Instruction::new(Opcode::Mov, vec![dst.into(), src.into()]));
    }

    pub fn mov_imm(&mut self, dst: Reg, imm: i64) {
        self.insert(Instruction::new(Opcode::MovImm, vec![dst.into(), Operand::Imm(imm)]));
    }

    /// `movw dst, #lo16`
    pub fn movw(&mut self, dst: Reg, lo: Operand) {
        self.insert(Instruction::new(Opcode::MovLo16, vec![dst.into(), lo]));
    }

    /// `movt dst, #hi16`
    pub fn movt(&mut self, dst: Reg, hi: Operand) {
        self.insert(Instruction::new(Opcode::MovHi16, vec![dst.into(), dst.into(), hi]));
    }

    pub fn add(&mut self, dst: Reg, src: Reg, op2: Operand) {
        self.insert(Instruction::new(Opcode::Add, vec![dst.into(), src.into(), op2]));
    }

    pub fn sub(&mut self, dst: Reg, src: Reg, op2: Operand) {
        self.insert(Instruction::new(Opcode::Sub, vec![dst.into(), src.into(), op2]));
    }

    pub fn udiv(&mut self, dst: Reg, lhs: Reg, rhs: Reg) {
        self.insert(Instruction::new(Opcode::Udiv, vec![dst.into(), lhs.into(), rhs.into()]));
    }

    /// `mls dst, a, b, c` computes `c - a * b`
    pub fn mls(&mut self, dst: Reg, a: Reg, b: Reg, c: Reg) {
        self.insert(Instruction::new(Opcode::Mls, vec![dst.into(), a.into(), b.into(), c.into()]));
    }

    pub fn cmp(&mut self, lhs: Reg, rhs: Operand) {
        self.insert(Instruction::new(Opcode::Cmp, vec![lhs.into(), rhs]));
    }

    /// `ldr dst, [base, #offset]` where base may be a register or a stack object
    pub fn load(&mut self, dst: Reg, base: Operand, offset: i64) {
        self.insert(Instruction::new(Opcode::Load, vec![dst.into(), base, Operand::Imm(offset)]));
    }

    /// `str src, [base, #offset]` where base may be a register or a stack object
    pub fn store(&mut self, src: Reg, base: Operand, offset: i64) {
        self.insert(Instruction::new(Opcode::Store, vec![src.into(), base, Operand::Imm(offset)]));
    }

    pub fn push(&mut self, regs: &[PhysReg]) {
        self.insert(Instruction::new(Opcode::Push, regs.iter().map(|r| Operand::from(*r)).collect::<Vec<_>>()));
    }

    pub fn pop(&mut self, regs: &[PhysReg]) {
        self.insert(Instruction::new(Opcode::Pop, regs.iter().map(|r| Operand::from(*r)).collect::<Vec<_>>()));
    }

    pub fn branch(&mut self, target: Id) {
        self.insert(Instruction::new(Opcode::Branch, vec![Operand::Block(target)]));
    }

    pub fn branch_cond(&mut self, cond: Cond, target: Id) {
        self.insert(Instruction::predicated(Opcode::BranchCond, vec![Operand::Block(target)], cond));
    }

    pub fn call(&mut self, symbol: Symbol) {
        self.insert(Instruction::new(Opcode::Call, vec![Operand::symbol(symbol)]));
    }

    pub fn call_external<S: Into<String>>(&mut self, name: S) {
        self.insert(Instruction::new(Opcode::Call, vec![Operand::External(name.into())]));
    }

    pub fn call_indirect(&mut self, target: Reg) {
        self.insert(Instruction::new(Opcode::CallIndirect, vec![target.into()]));
    }

    pub fn tail_call(&mut self, symbol: Symbol) {
        self.insert(Instruction::new(Opcode::TailCall, vec![Operand::symbol(symbol)]));
    }

    pub fn tail_call_external<S: Into<String>>(&mut self, name: S) {
        self.insert(Instruction::new(Opcode::TailCall, vec![Operand::External(name.into())]));
    }

    pub fn tail_call_indirect(&mut self, target: Reg) {
        self.insert(Instruction::new(Opcode::TailCallIndirect, vec![target.into()]));
    }

    pub fn ret(&mut self) {
        self.insert(Instruction::new(Opcode::Return, vec![]));
    }
}

/// The Control Flow Graph of a function. The order of the basic blocks is their layout order.
#[derive(Clone, Debug)]
pub struct CFG {
    idmap: IdMap<BasicBlock>,
    entry: Id,
}

idmap_functions!(CFG, idmap, BasicBlock, basic_block);

impl CFG {
    /// Create a new, empty CFG
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            idmap: IdMap::new(),
            entry: Id::default(),
        }
    }

    /// Append a basic block to the layout and assign it an ID that is returned by this function
    pub fn add_basic_block(&mut self, bb: BasicBlock) -> Id {
        self.idmap.insert(bb)
    }

    /// Insert a basic block into the layout directly after `after`
    pub fn insert_basic_block_after(&mut self, after: Id, bb: BasicBlock) -> Option<Id> {
        let idx = self.idmap.position(after)?;
        Some(self.idmap.insert_at(idx + 1, bb))
    }

    /// Get the entrypoint basic block of this CFG
    pub fn entry(&self) -> Id {
        self.entry
    }

    /// Change the entrypoint basic block of this CFG
    pub fn set_entry(&mut self, id: Id) {
        self.entry = id;
    }

    /// The basic block that precedes `id` in the layout order
    pub fn layout_predecessor(&self, id: Id) -> Option<Id> {
        let idx = self.idmap.position(id)?;
        let prev = self.idmap.get_at(idx.checked_sub(1)?)?;
        Some(prev.id())
    }

    /// Encoded size of all basic blocks
    pub fn size(&self) -> usize {
        self.idmap.values().map(|bb| bb.size()).sum()
    }

    pub(crate) fn verify(&self) -> Result<(), CFGError> {
        /* Check if entry was set */
        if self.entry == Id::default() {
            return Err(CFGError::InvalidEntry(self.entry));
        }

        /* Check that we have basic blocks */
        if self.idmap.is_empty() {
            return Err(CFGError::CfgEmpty);
        }

        let ids: FxHashSet<Id> = self.iter_basic_blocks().map(|x| x.id()).collect();

        /* Check that entry points to an existing block */
        if !ids.contains(&self.entry) {
            return Err(CFGError::InvalidEntry(self.entry));
        }

        /* Check that all basic blocks are valid */
        for bb in self.iter_basic_blocks() {
            bb.verify()?;
        }

        /* Check that all edge targets are valid */
        for bb in self.iter_basic_blocks() {
            for edge in bb.edges() {
                if !ids.contains(&edge.target()) {
                    return Err(CFGError::InvalidTarget(bb.id(), edge.target()));
                }
            }
        }

        Ok(())
    }
}
