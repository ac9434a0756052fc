use rustc_hash::{
    FxHashMap,
    FxHashSet,
};

use crate::ir::{
    error::IrError,
    idmap::{
        HasId,
        Id,
    },
    instr::{
        Opcode,
        Operand,
    },
    program::Program,
};

/// A strongly connected component of the call graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scc {
    /// The functions of this component
    pub functions: Vec<Id>,
    /// Whether the functions of this component can (transitively) call themselves
    pub cyclic: bool,
}

/// Direct call edges between the functions of a program
#[derive(Debug, Clone)]
pub struct CallGraph {
    nodes: Vec<Id>,
    callees: FxHashMap<Id, Vec<Id>>,
}

/* Helper struct to group the state of Tarjan's algorithm */
struct TarjanState {
    index_counter: usize,
    stack: Vec<Id>,
    indices: FxHashMap<Id, usize>,
    lowlinks: FxHashMap<Id, usize>,
    on_stack: FxHashSet<Id>,
    sccs: Vec<Vec<Id>>,
}

impl TarjanState {
    fn new() -> Self {
        Self {
            index_counter: 0,
            stack: Vec::new(),
            indices: FxHashMap::default(),
            lowlinks: FxHashMap::default(),
            on_stack: FxHashSet::default(),
            sccs: Vec::new(),
        }
    }
}

impl CallGraph {
    /// Collect the direct calls and tail calls of every function. Calls through aliases are resolved.
    pub fn build(program: &Program) -> Result<Self, IrError> {
        let mut nodes = Vec::new();
        let mut callees = FxHashMap::default();

        for func in program.iter_functions() {
            nodes.push(func.id());

            let Some(cfg) = func.cfg() else {
                continue;
            };

            let mut targets: Vec<Id> = Vec::new();

            for bb in cfg.iter_basic_blocks() {
                for instr in bb.instrs() {
                    if !matches!(instr.opcode(), Opcode::Call | Opcode::TailCall) {
                        continue;
                    }

                    if let Some(Operand::Symbol {
                        symbol,
                        ..
                    }) = instr.operand(0)
                    {
                        let target = program.resolve_function(*symbol)?;

                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                }
            }

            callees.insert(func.id(), targets);
        }

        Ok(Self {
            nodes,
            callees,
        })
    }

    /// The functions directly called by `func`
    pub fn callees(&self, func: Id) -> &[Id] {
        self.callees.get(&func).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// Strongly connected components in reverse topological order (callees before callers)
    pub fn sccs(&self) -> Vec<Scc> {
        let mut state = TarjanState::new();

        for node in &self.nodes {
            if !state.indices.contains_key(node) {
                self.strongconnect(*node, &mut state);
            }
        }

        state
            .sccs
            .into_iter()
            .map(|functions| {
                let cyclic = functions.len() > 1 || self.callees(functions[0]).contains(&functions[0]);
                Scc {
                    functions,
                    cyclic,
                }
            })
            .collect()
    }

    fn strongconnect(&self, node: Id, state: &mut TarjanState) {
        state.indices.insert(node, state.index_counter);
        state.lowlinks.insert(node, state.index_counter);
        state.index_counter += 1;
        state.stack.push(node);
        state.on_stack.insert(node);

        for successor in self.callees(node) {
            if !state.indices.contains_key(successor) {
                self.strongconnect(*successor, state);
                let lowlink = state.lowlinks[&node].min(state.lowlinks[successor]);
                state.lowlinks.insert(node, lowlink);
            } else if state.on_stack.contains(successor) {
                let lowlink = state.lowlinks[&node].min(state.indices[successor]);
                state.lowlinks.insert(node, lowlink);
            }
        }

        /* Root node: pop the stack and create an SCC */
        if state.lowlinks[&node] == state.indices[&node] {
            let mut scc = Vec::new();

            while let Some(w) = state.stack.pop() {
                state.on_stack.remove(&w);
                scc.push(w);

                if w == node {
                    break;
                }
            }

            state.sccs.push(scc);
        }
    }
}
