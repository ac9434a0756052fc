use crate::ir::idmap::Id;

/// Points into a global object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalPointer {
    pub global: Id,
    pub offset: usize,
}

/// Points to the entry of a function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionPointer {
    pub function: Id,
}

/// Points to a basic block of a function (block address)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BasicBlockPointer {
    pub function: Id,
    pub bb: Id,
}

/// A pointer-sized initializer entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pointer {
    Null,
    /// A plain integer that is stored as is
    Raw(u64),
    Global(GlobalPointer),
    Function(FunctionPointer),
    BasicBlock(BasicBlockPointer),
}
