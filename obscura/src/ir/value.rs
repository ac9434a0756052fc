use crate::ir::idmap::Id;

/// Index of a node in the [`ValueGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(usize);

/// What a node of the value graph represents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// The address of a function
    Function(Id),
    /// A global variable. Bookkeeping lists without a corresponding object have no id.
    Global {
        id: Option<Id>,
        name: String,
    },
    /// A symbol alias
    Alias(Id),
    Phi,
    /// The address of a basic block
    BlockAddress,
    /// A constant expression. Compares among them do not propagate addresses.
    ConstantExpr {
        compare: bool,
    },
    /// Any other constant, e.g. an aggregate
    Constant,
    /// A store instruction: `[value, pointer]`
    Store,
    Cast,
    Select,
    Compare,
    /// A call instruction: `[callee, args...]`
    Call,
    /// Anything not modelled explicitly
    Other(String),
}

/// A single value with its use-def edges
#[derive(Debug, Clone)]
pub struct ValueNode {
    kind: ValueKind,
    operands: Vec<ValueId>,
    users: Vec<ValueId>,
}

impl ValueNode {
    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    /// The values this node uses, in operand order
    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    /// The values that use this node
    pub fn users(&self) -> &[ValueId] {
        &self.users
    }
}

/// Arena of values connected by use-def edges
#[derive(Debug, Clone, Default)]
pub struct ValueGraph {
    nodes: Vec<ValueNode>,
}

impl ValueGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value that uses `operands`
    pub fn add(&mut self, kind: ValueKind, operands: &[ValueId]) -> ValueId {
        let id = ValueId(self.nodes.len());

        self.nodes.push(ValueNode {
            kind,
            operands: Vec::new(),
            users: Vec::new(),
        });

        for operand in operands {
            self.add_operand(id, *operand);
        }

        id
    }

    /// Append `operand` to the operands of `user`
    pub fn add_operand(&mut self, user: ValueId, operand: ValueId) {
        self.nodes[user.0].operands.push(operand);

        let users = &mut self.nodes[operand.0].users;
        if !users.contains(&user) {
            users.push(user);
        }
    }

    /// Replace all operands of `user`
    pub fn set_operands(&mut self, user: ValueId, operands: &[ValueId]) {
        let old = std::mem::take(&mut self.nodes[user.0].operands);

        for operand in old {
            self.nodes[operand.0].users.retain(|u| *u != user);
        }

        for operand in operands {
            self.add_operand(user, *operand);
        }
    }

    pub fn node(&self, id: ValueId) -> &ValueNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
