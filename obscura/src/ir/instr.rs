use crate::ir::{
    idmap::Id,
    program::Symbol,
    register::{
        argument_registers,
        call_clobbered_registers,
        callee_saved_registers,
        PhysReg,
        Reg,
        RegSet,
    },
};

/// Thumb-2 condition codes
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Hs,
    Lo,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

impl Cond {
    const ALL: [Cond; 15] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Hs,
        Cond::Lo,
        Cond::Mi,
        Cond::Pl,
        Cond::Vs,
        Cond::Vc,
        Cond::Hi,
        Cond::Ls,
        Cond::Ge,
        Cond::Lt,
        Cond::Gt,
        Cond::Le,
        Cond::Al,
    ];

    /// The 4-bit encoding of this condition
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Decode a 4-bit condition
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// The opposite condition. `Al` has no opposite and stays `Al`.
    pub fn inverse(&self) -> Self {
        if *self == Cond::Al {
            Cond::Al
        } else {
            Self::ALL[(self.code() ^ 1) as usize]
        }
    }
}

/// The opcodes of the machine IR
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Opcode {
    /// `IT{x{y{z}}} firstcond`: operands `[Imm(firstcond), Imm(mask)]`
    It,
    /// Register copy before register allocation: `[dst, src]`
    Copy,
    /// `mov dst, src`
    Mov,
    /// `mov dst, #imm` (Thumb-2 modified immediate)
    MovImm,
    /// `movw dst, #lo16`: `[dst, Imm | Symbol(Lo16)]`
    MovLo16,
    /// `movt dst, #hi16`: `[dst, dst, Imm | Symbol(Hi16)]`
    MovHi16,
    /// `add dst, src, op2`
    Add,
    /// `sub dst, src, op2`
    Sub,
    /// `udiv dst, lhs, rhs`
    Udiv,
    /// `mls dst, a, b, c` computes `c - a * b`
    Mls,
    /// `cmp lhs, rhs`
    Cmp,
    /// `ldr dst, [base, #offset]`
    Load,
    /// `str src, [base, #offset]`
    Store,
    /// `push {regs}`
    Push,
    /// `pop {regs}`
    Pop,
    /// Unconditional branch (or predicated inside an IT group): `[Block]`
    Branch,
    /// Conditional branch with an inline condition: `[Block]`
    BranchCond,
    /// `bl target`: `[Symbol | External]`
    Call,
    /// `blx reg`: `[Reg]`
    CallIndirect,
    /// `blx reg` whose target register was restricted by the indirect call limiter
    CallIndirectLimited,
    /// Direct tail call: `[Symbol | External]`
    TailCall,
    /// Indirect tail call: `[Reg]`
    TailCallIndirect,
    /// `bx lr`
    Return,
    /// Permanently undefined instruction whose operand can be etched with an address: `[Imm | Symbol(Lo16)]`
    Trap,
    #[allow(missing_docs)]
    Nop,
    /// Debug information that does not produce any code
    Debug,
}

impl Opcode {
    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            Opcode::Debug => 0,
            Opcode::It
            | Opcode::Copy
            | Opcode::Mov
            | Opcode::Cmp
            | Opcode::Push
            | Opcode::Pop
            | Opcode::Branch
            | Opcode::CallIndirect
            | Opcode::CallIndirectLimited
            | Opcode::TailCallIndirect
            | Opcode::Return
            | Opcode::Nop => 2,
            Opcode::MovImm
            | Opcode::MovLo16
            | Opcode::MovHi16
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Udiv
            | Opcode::Mls
            | Opcode::Load
            | Opcode::Store
            | Opcode::BranchCond
            | Opcode::Call
            | Opcode::TailCall
            | Opcode::Trap => 4,
        }
    }

    /// Number of leading operands that are written by the instruction
    fn num_defs(&self) -> usize {
        match self {
            Opcode::Copy
            | Opcode::Mov
            | Opcode::MovImm
            | Opcode::MovLo16
            | Opcode::MovHi16
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Udiv
            | Opcode::Mls
            | Opcode::Load => 1,
            _ => 0,
        }
    }

    /// Whether the condition is encoded into the instruction itself instead of an IT group
    pub fn has_inline_predicate(&self) -> bool {
        matches!(self, Opcode::BranchCond)
    }

    #[allow(missing_docs)]
    pub fn is_call(&self) -> bool {
        matches!(self, Opcode::Call | Opcode::CallIndirect | Opcode::CallIndirectLimited)
    }

    #[allow(missing_docs)]
    pub fn is_tail_call(&self) -> bool {
        matches!(self, Opcode::TailCall | Opcode::TailCallIndirect)
    }

    /// Instructions that change the control flow and therefore must be the last one of an IT group
    pub fn ends_predicate_group(&self) -> bool {
        matches!(
            self,
            Opcode::Branch
                | Opcode::BranchCond
                | Opcode::Call
                | Opcode::CallIndirect
                | Opcode::CallIndirectLimited
                | Opcode::TailCall
                | Opcode::TailCallIndirect
                | Opcode::Return
                | Opcode::It
        )
    }
}

/// Which part of a symbol address an operand refers to
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AddrPart {
    /// The whole address
    Full,
    /// The lower 16 bits
    Lo16,
    /// The upper 16 bits
    Hi16,
}

/// An instruction operand
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    #[allow(missing_docs)]
    Reg(Reg),
    #[allow(missing_docs)]
    Imm(i64),
    /// Address of a function, global or alias
    Symbol {
        #[allow(missing_docs)]
        symbol: Symbol,
        #[allow(missing_docs)]
        offset: i64,
        #[allow(missing_docs)]
        part: AddrPart,
    },
    /// A symbol that is resolved at link time and is unknown to the program
    External(String),
    /// A basic block of the same function
    Block(Id),
    /// A stack object of the same function
    Frame(Id),
}

impl Operand {
    /// The address of `symbol`
    pub fn symbol(symbol: Symbol) -> Self {
        Operand::Symbol {
            symbol,
            offset: 0,
            part: AddrPart::Full,
        }
    }

    #[allow(missing_docs)]
    pub fn reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(reg) => Some(*reg),
            _ => None,
        }
    }
}

impl From<PhysReg> for Operand {
    fn from(reg: PhysReg) -> Self {
        Operand::Reg(Reg::Phys(reg))
    }
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Reg(reg)
    }
}

/// A single machine instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    opcode: Opcode,
    operands: Vec<Operand>,
    pred: Cond,
}

impl Instruction {
    /// Create an unconditionally executed instruction
    pub fn new<V: Into<Vec<Operand>>>(opcode: Opcode, operands: V) -> Self {
        Self {
            opcode,
            operands: operands.into(),
            pred: Cond::Al,
        }
    }

    /// Create an instruction that only executes if `pred` holds
    pub fn predicated<V: Into<Vec<Operand>>>(opcode: Opcode, operands: V, pred: Cond) -> Self {
        Self {
            opcode,
            operands: operands.into(),
            pred,
        }
    }

    /// Create an IT instruction
    pub fn it(first: Cond, mask: u8) -> Self {
        Self::new(Opcode::It, vec![Operand::Imm(first.code() as i64), Operand::Imm(mask as i64)])
    }

    #[allow(missing_docs)]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Change the opcode, keeping the operands
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode;
    }

    #[allow(missing_docs)]
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    #[allow(missing_docs)]
    pub fn operands_mut(&mut self) -> &mut [Operand] {
        &mut self.operands
    }

    #[allow(missing_docs)]
    pub fn operand(&self, idx: usize) -> Option<&Operand> {
        self.operands.get(idx)
    }

    #[allow(missing_docs)]
    pub fn set_operand(&mut self, idx: usize, operand: Operand) {
        self.operands[idx] = operand;
    }

    /// The execution predicate
    pub fn pred(&self) -> Cond {
        self.pred
    }

    #[allow(missing_docs)]
    pub fn set_pred(&mut self, pred: Cond) {
        self.pred = pred;
    }

    /// Whether this instruction executes conditionally
    pub fn is_conditional(&self) -> bool {
        self.pred != Cond::Al
    }

    /// Whether this instruction must be covered by an IT group
    pub fn needs_predicate_group(&self) -> bool {
        self.is_conditional() && !self.opcode.has_inline_predicate() && self.opcode != Opcode::It
    }

    #[allow(missing_docs)]
    pub fn is_debug(&self) -> bool {
        self.opcode == Opcode::Debug
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        self.opcode.size()
    }

    /// For IT instructions: the first condition and the mask
    pub fn it_fields(&self) -> Option<(Cond, u8)> {
        if self.opcode != Opcode::It {
            return None;
        }

        match (self.operands.first(), self.operands.get(1)) {
            (Some(Operand::Imm(first)), Some(Operand::Imm(mask))) => Some((Cond::from_code(*first as u8)?, *mask as u8)),
            _ => None,
        }
    }

    fn pops_pc(&self) -> bool {
        self.opcode == Opcode::Pop && self.operands.contains(&Operand::from(PhysReg::pc))
    }

    /// Whether this instruction leaves the function
    pub fn is_return(&self) -> bool {
        self.opcode == Opcode::Return || self.opcode.is_tail_call() || self.pops_pc()
    }

    /// Physical registers read by this instruction (explicit and implicit)
    pub fn phys_uses(&self) -> RegSet {
        let mut uses = RegSet::new();

        let explicit = match self.opcode {
            Opcode::Pop => &self.operands[..0],
            Opcode::MovHi16 => &self.operands[1..],
            _ => &self.operands[self.opcode.num_defs().min(self.operands.len())..],
        };

        for operand in explicit {
            if let Operand::Reg(Reg::Phys(reg)) = operand {
                uses.insert(*reg);
            }
        }

        if self.is_conditional() || self.opcode == Opcode::It {
            uses.insert(PhysReg::cpsr);
        }

        match self.opcode {
            Opcode::Push | Opcode::Pop | Opcode::Load | Opcode::Store => uses.insert(PhysReg::sp),
            Opcode::Call | Opcode::CallIndirect | Opcode::CallIndirectLimited => {
                for reg in argument_registers {
                    uses.insert(reg);
                }
                uses.insert(PhysReg::sp);
            },
            Opcode::TailCall | Opcode::TailCallIndirect | Opcode::Return => {
                uses = uses.union(exit_registers());
                uses.insert(PhysReg::lr);
                if self.opcode.is_tail_call() {
                    for reg in argument_registers {
                        uses.insert(reg);
                    }
                }
            },
            _ => {},
        }

        if self.pops_pc() {
            uses = uses.union(exit_registers().difference(self.phys_defs()));
        }

        uses
    }

    /// Physical registers written by this instruction (explicit and implicit)
    pub fn phys_defs(&self) -> RegSet {
        let mut defs = RegSet::new();

        let explicit = match self.opcode {
            Opcode::Pop => &self.operands[..],
            _ => &self.operands[..self.opcode.num_defs().min(self.operands.len())],
        };

        for operand in explicit {
            if let Operand::Reg(Reg::Phys(reg)) = operand {
                defs.insert(*reg);
            }
        }

        match self.opcode {
            Opcode::Cmp => defs.insert(PhysReg::cpsr),
            Opcode::Push | Opcode::Pop => defs.insert(PhysReg::sp),
            Opcode::Call | Opcode::CallIndirect | Opcode::CallIndirectLimited => {
                for reg in call_clobbered_registers {
                    defs.insert(reg);
                }
            },
            _ => {},
        }

        defs
    }
}

/// Registers that are live when control leaves a function
fn exit_registers() -> RegSet {
    let mut regs: RegSet = callee_saved_registers.into_iter().collect();
    regs.insert(PhysReg::r0);
    regs.insert(PhysReg::r1);
    regs.insert(PhysReg::sp);
    regs
}

/// Check whether `value` can be encoded as a Thumb-2 modified immediate constant
pub fn is_modified_immediate(value: u32) -> bool {
    let byte = value & 0xff;

    if value <= 0xff || value == (byte << 16 | byte) || value == (byte << 24 | byte << 16 | byte << 8 | byte) {
        return true;
    }

    let hi = value & 0xff00;
    if value == (hi << 16 | hi) {
        return true;
    }

    /* 8-bit value with the top bit set, rotated */
    (8..32).any(|rot| {
        let unrotated = value.rotate_left(rot);
        unrotated <= 0xff && (unrotated & 0x80) != 0
    })
}
