//! The machine-level program representation that all hardening passes operate on

mod callgraph;
mod cfg;
mod error;
mod func;
mod global;
mod idmap;
mod instr;
mod pointer;
mod program;
mod register;
mod types;
mod value;

pub use callgraph::{
    CallGraph,
    Scc,
};
pub use cfg::{
    BasicBlock,
    CFGError,
    Edge,
    CFG,
};
pub use error::IrError;
pub use func::{
    FrameInfo,
    Function,
    FunctionBuilder,
    RegisterInfo,
    StackObject,
};
pub use global::{
    GlobalObject,
    GlobalObjectBuilder,
    Initializer,
    Linkage,
};
pub use idmap::{
    HasId,
    Id,
};
pub use instr::{
    is_modified_immediate,
    AddrPart,
    Cond,
    Instruction,
    Opcode,
    Operand,
};
pub use pointer::{
    BasicBlockPointer,
    FunctionPointer,
    GlobalPointer,
    Pointer,
};
pub use program::{
    Alias,
    Program,
    Symbol,
    COMPILER_USED_LIST,
    USED_LIST,
};
pub use register::{
    argument_registers,
    call_clobbered_registers,
    callee_saved_registers,
    link_register,
    PhysReg,
    Reg,
    RegClass,
    RegSet,
    VirtReg,
};
pub use types::Type;
pub use value::{
    ValueGraph,
    ValueId,
    ValueKind,
    ValueNode,
};
