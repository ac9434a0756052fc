use thiserror::Error;

use crate::ir::program::Symbol;

/// Errors when building or querying a [`Program`](crate::ir::Program)
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum IrError {
    #[error("Unsupported pointer size: {0}")]
    InvalidPointerSize(usize),

    #[error("Unknown symbol: {0:?}")]
    UnknownSymbol(Symbol),

    #[error("Symbol name is already in use: {0}")]
    DuplicateName(String),

    #[error("Alias {0} does not resolve to a function")]
    NotAFunction(String),

    #[error("Alias {0} is part of an alias cycle")]
    AliasCycle(String),

    #[error("New order has {0} elements but there are {1}")]
    InvalidOrder(usize, usize),

    #[error("New order contains an unknown or repeated ID: {0}")]
    UnknownId(usize),
}
