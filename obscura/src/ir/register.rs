//! Contains everything related to Thumb-2 registers

#![allow(non_upper_case_globals)]

use std::fmt::{
    Display,
    Formatter,
};

use serde::{
    Deserialize,
    Serialize,
};

mod gpr {
    pub(super) const r0: usize = 0;
    pub(super) const r1: usize = 1;
    pub(super) const r2: usize = 2;
    pub(super) const r3: usize = 3;
    pub(super) const r4: usize = 4;
    pub(super) const r5: usize = 5;
    pub(super) const r6: usize = 6;
    pub(super) const r7: usize = 7;
    pub(super) const r8: usize = 8;
    pub(super) const r9: usize = 9;
    pub(super) const r10: usize = 10;
    pub(super) const r11: usize = 11;
    pub(super) const r12: usize = 12;
    pub(super) const sp: usize = 13;
    pub(super) const lr: usize = 14;
    pub(super) const pc: usize = 15;
    pub(super) const cpsr: usize = 16;
}

/// The physical registers of the Thumb-2 ISA (including the status register)
#[allow(missing_docs)]
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(usize)]
pub enum PhysReg {
    r0 = gpr::r0,
    r1 = gpr::r1,
    r2 = gpr::r2,
    r3 = gpr::r3,
    r4 = gpr::r4,
    r5 = gpr::r5,
    r6 = gpr::r6,
    r7 = gpr::r7,
    r8 = gpr::r8,
    r9 = gpr::r9,
    r10 = gpr::r10,
    r11 = gpr::r11,
    r12 = gpr::r12,
    sp = gpr::sp,
    lr = gpr::lr,
    pc = gpr::pc,
    cpsr = gpr::cpsr,
}

impl PhysReg {
    /// All physical registers in encoding order
    pub const ALL: [PhysReg; 17] = [
        PhysReg::r0,
        PhysReg::r1,
        PhysReg::r2,
        PhysReg::r3,
        PhysReg::r4,
        PhysReg::r5,
        PhysReg::r6,
        PhysReg::r7,
        PhysReg::r8,
        PhysReg::r9,
        PhysReg::r10,
        PhysReg::r11,
        PhysReg::r12,
        PhysReg::sp,
        PhysReg::lr,
        PhysReg::pc,
        PhysReg::cpsr,
    ];

    pub(crate) fn from_usize(number: usize) -> Self {
        Self::ALL[number]
    }

    /// Registers r0-r7 can be encoded in 16-bit Thumb instructions
    pub fn is_low(&self) -> bool {
        (*self as usize) <= gpr::r7
    }
}

impl Display for PhysReg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The link register holds the return address of a call
pub const link_register: PhysReg = PhysReg::lr;
/// Argument registers of the calling convention
pub const argument_registers: [PhysReg; 4] = [PhysReg::r0, PhysReg::r1, PhysReg::r2, PhysReg::r3];
/// Registers that a callee must preserve
pub const callee_saved_registers: [PhysReg; 8] = [PhysReg::r4, PhysReg::r5, PhysReg::r6, PhysReg::r7, PhysReg::r8, PhysReg::r9, PhysReg::r10, PhysReg::r11];
/// Registers that a call may overwrite
pub const call_clobbered_registers: [PhysReg; 7] = [PhysReg::r0, PhysReg::r1, PhysReg::r2, PhysReg::r3, PhysReg::r12, PhysReg::lr, PhysReg::cpsr];

/// A virtual register that has not been assigned to a physical register yet
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct VirtReg(usize);

impl VirtReg {
    pub(crate) fn new(number: usize) -> Self {
        Self(number)
    }

    /// The number of this virtual register
    pub fn number(&self) -> usize {
        self.0
    }
}

/// A register operand
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Reg {
    #[allow(missing_docs)]
    Phys(PhysReg),
    #[allow(missing_docs)]
    Virt(VirtReg),
}

impl Reg {
    /// Return the physical register if this is one
    pub fn phys(&self) -> Option<PhysReg> {
        match self {
            Reg::Phys(reg) => Some(*reg),
            Reg::Virt(_) => None,
        }
    }

    #[allow(missing_docs)]
    pub fn is_virtual(&self) -> bool {
        matches!(self, Reg::Virt(_))
    }
}

impl From<PhysReg> for Reg {
    fn from(reg: PhysReg) -> Self {
        Reg::Phys(reg)
    }
}

/// Register classes that constrain which physical registers a virtual register may be assigned to
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RegClass {
    /// r0-r12, lr
    Gpr,
    /// r0-r7 (16-bit encodable)
    LowGpr,
    /// r0-r3, r12: caller-saved registers that are never spilled as callee-saved registers
    TailCall,
    /// r0-r3
    LowTailCall,
}

impl RegClass {
    /// The physical registers of this class
    pub fn registers(&self) -> RegSet {
        let regs: &[PhysReg] = match self {
            RegClass::Gpr => &[
                PhysReg::r0,
                PhysReg::r1,
                PhysReg::r2,
                PhysReg::r3,
                PhysReg::r4,
                PhysReg::r5,
                PhysReg::r6,
                PhysReg::r7,
                PhysReg::r8,
                PhysReg::r9,
                PhysReg::r10,
                PhysReg::r11,
                PhysReg::r12,
                PhysReg::lr,
            ],
            RegClass::LowGpr => &[PhysReg::r0, PhysReg::r1, PhysReg::r2, PhysReg::r3, PhysReg::r4, PhysReg::r5, PhysReg::r6, PhysReg::r7],
            RegClass::TailCall => &[PhysReg::r0, PhysReg::r1, PhysReg::r2, PhysReg::r3, PhysReg::r12],
            RegClass::LowTailCall => &argument_registers,
        };
        regs.iter().copied().collect()
    }

    #[allow(missing_docs)]
    pub fn contains(&self, reg: PhysReg) -> bool {
        self.registers().contains(reg)
    }

    /// The largest class whose registers are contained in both classes
    pub fn common_subclass(&self, other: RegClass) -> Option<RegClass> {
        let common = self.registers().intersection(other.registers());

        [RegClass::Gpr, RegClass::LowGpr, RegClass::TailCall, RegClass::LowTailCall].into_iter().find(|class| class.registers() == common)
    }
}

/// A set of physical registers
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct RegSet(u32);

impl RegSet {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self(0)
    }

    #[allow(missing_docs)]
    pub fn insert(&mut self, reg: PhysReg) {
        self.0 |= 1 << (reg as usize);
    }

    #[allow(missing_docs)]
    pub fn remove(&mut self, reg: PhysReg) {
        self.0 &= !(1 << (reg as usize));
    }

    #[allow(missing_docs)]
    pub fn contains(&self, reg: PhysReg) -> bool {
        (self.0 & (1 << (reg as usize))) != 0
    }

    #[allow(missing_docs)]
    pub fn union(&self, other: RegSet) -> RegSet {
        RegSet(self.0 | other.0)
    }

    #[allow(missing_docs)]
    pub fn intersection(&self, other: RegSet) -> RegSet {
        RegSet(self.0 & other.0)
    }

    #[allow(missing_docs)]
    pub fn difference(&self, other: RegSet) -> RegSet {
        RegSet(self.0 & !other.0)
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate over the registers in encoding order
    pub fn iter(&self) -> impl Iterator<Item = PhysReg> + '_ {
        (0..PhysReg::ALL.len()).filter(|i| (self.0 & (1 << i)) != 0).map(PhysReg::from_usize)
    }
}

impl FromIterator<PhysReg> for RegSet {
    fn from_iter<I: IntoIterator<Item = PhysReg>>(iter: I) -> Self {
        let mut set = RegSet::new();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_subclass() {
        assert_eq!(RegClass::Gpr.common_subclass(RegClass::TailCall), Some(RegClass::TailCall));
        assert_eq!(RegClass::LowGpr.common_subclass(RegClass::TailCall), Some(RegClass::LowTailCall));
        assert_eq!(RegClass::TailCall.common_subclass(RegClass::TailCall), Some(RegClass::TailCall));
        assert!(RegClass::TailCall.contains(PhysReg::r12));
        assert!(!RegClass::TailCall.contains(PhysReg::r4));
    }

    #[test]
    fn test_regset() {
        let mut set: RegSet = [PhysReg::r0, PhysReg::lr].into_iter().collect();
        assert_eq!(set.len(), 2);
        set.remove(PhysReg::r0);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![PhysReg::lr]);
        assert!(set.union(RegClass::LowTailCall.registers()).contains(PhysReg::r3));
    }
}
