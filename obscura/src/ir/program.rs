use paste::paste;
use rustc_hash::{
    FxHashMap,
    FxHashSet,
};

use crate::ir::{
    error::IrError,
    func::Function,
    global::GlobalObject,
    idmap::{
        idmap_functions,
        HasId,
        HasIdMut,
        Id,
        IdMap,
        IdMapValues,
        IdMapValuesMut,
    },
    pointer::Pointer,
    value::{
        ValueGraph,
        ValueId,
        ValueKind,
    },
};

/// Name of the list of symbols that must be kept even if they seem unreferenced
pub const USED_LIST: &str = "obscura.used";
/// Name of the list of symbols that the compiler must keep but the linker may discard
pub const COMPILER_USED_LIST: &str = "obscura.compiler.used";

/// Anything that has an address and a name in a program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Function(Id),
    Global(Id),
    Alias(Id),
}

/// Another name for a function, global or alias
#[derive(Debug, Clone)]
pub struct Alias {
    id: Id,
    name: String,
    target: Symbol,
}

impl HasId for Alias {
    fn id(&self) -> Id {
        self.id
    }
}

impl HasIdMut for Alias {
    fn id_mut(&mut self) -> &mut Id {
        &mut self.id
    }
}

impl Alias {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The aliased symbol
    pub fn target(&self) -> Symbol {
        self.target
    }
}

/// A whole translation unit: machine functions, global objects, aliases and the
/// use-def graph of the IR values that refer to them.
#[derive(Debug, Clone)]
pub struct Program {
    functions: IdMap<Function>,
    globals: IdMap<GlobalObject>,
    aliases: IdMap<Alias>,
    names: FxHashMap<String, Symbol>,
    values: ValueGraph,
    symbol_values: FxHashMap<Symbol, ValueId>,
    used: Vec<Symbol>,
    used_set: FxHashSet<Symbol>,
    used_node: ValueId,
    compiler_used_node: ValueId,
    pointer_size: usize,
}

idmap_functions!(Program, functions, Function, function);
idmap_functions!(Program, globals, GlobalObject, global);

impl Program {
    /// Create an empty program for a target with `pointer_size`-byte pointers
    pub fn new(pointer_size: usize) -> Result<Self, IrError> {
        if pointer_size != 4 && pointer_size != 8 {
            return Err(IrError::InvalidPointerSize(pointer_size));
        }

        let mut values = ValueGraph::new();
        let used_node = values.add(
            ValueKind::Global {
                id: None,
                name: USED_LIST.to_string(),
            },
            &[],
        );
        let compiler_used_node = values.add(
            ValueKind::Global {
                id: None,
                name: COMPILER_USED_LIST.to_string(),
            },
            &[],
        );

        Ok(Self {
            functions: IdMap::new(),
            globals: IdMap::new(),
            aliases: IdMap::new(),
            names: FxHashMap::default(),
            values,
            symbol_values: FxHashMap::default(),
            used: Vec::new(),
            used_set: FxHashSet::default(),
            used_node,
            compiler_used_node,
            pointer_size,
        })
    }

    /// Size of a pointer in bytes
    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn claim_name(&self, name: &str) -> Result<(), IrError> {
        if self.names.contains_key(name) || name == USED_LIST || name == COMPILER_USED_LIST {
            return Err(IrError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Add a function and create its value node
    pub fn add_function(&mut self, func: Function) -> Result<Id, IrError> {
        let name = func.name().to_string();
        self.claim_name(&name)?;

        let id = self.functions.insert(func);
        let symbol = Symbol::Function(id);
        let value = self.values.add(ValueKind::Function(id), &[]);

        self.names.insert(name, symbol);
        self.symbol_values.insert(symbol, value);
        Ok(id)
    }

    /// Add a global object. Pointers in its initializer become uses of the referenced symbols,
    /// so they must have been added before.
    pub fn add_global(&mut self, global: GlobalObject) -> Result<Id, IrError> {
        let name = global.name().to_string();
        self.claim_name(&name)?;

        /* Resolve the initializer before touching any state */
        let mut operands = Vec::new();

        if let Some(init) = global.initializer() {
            for pointer in init.pointers() {
                match pointer {
                    Pointer::Null | Pointer::Raw(_) => {},
                    Pointer::Global(ptr) => operands.push(self.lookup_value(Symbol::Global(ptr.global))?),
                    Pointer::Function(ptr) => operands.push(self.lookup_value(Symbol::Function(ptr.function))?),
                    Pointer::BasicBlock(ptr) => {
                        let func = self.lookup_value(Symbol::Function(ptr.function))?;
                        let address = self.values.add(ValueKind::BlockAddress, &[func]);
                        operands.push(address);
                    },
                }
            }
        }

        let id = self.globals.insert(global);
        let symbol = Symbol::Global(id);
        let value = self.values.add(
            ValueKind::Global {
                id: Some(id),
                name: name.clone(),
            },
            &operands,
        );

        self.names.insert(name, symbol);
        self.symbol_values.insert(symbol, value);
        Ok(id)
    }

    /// Add an alias of `target`
    pub fn add_alias<S: Into<String>>(&mut self, name: S, target: Symbol) -> Result<Id, IrError> {
        let name = name.into();
        self.claim_name(&name)?;

        /* Aliases may be created before their target so cycles can be expressed */
        let target_value = self.symbol_values.get(&target).copied();

        let id = self.aliases.insert(Alias {
            id: Id::default(),
            name: name.clone(),
            target,
        });
        let symbol = Symbol::Alias(id);
        let value = self.values.add(ValueKind::Alias(id), &[]);

        if let Some(target_value) = target_value {
            self.values.add_operand(value, target_value);
        }

        self.names.insert(name, symbol);
        self.symbol_values.insert(symbol, value);
        Ok(id)
    }

    /// Point an existing alias to another symbol
    pub fn set_alias_target(&mut self, alias: Id, target: Symbol) -> Result<(), IrError> {
        let target_value = self.lookup_value(target)?;
        let alias_value = self.lookup_value(Symbol::Alias(alias))?;

        let Some(entry) = self.aliases.get_mut(alias) else {
            return Err(IrError::UnknownSymbol(Symbol::Alias(alias)));
        };
        entry.target = target;

        self.values.set_operands(alias_value, &[target_value]);
        Ok(())
    }

    pub fn alias(&self, id: Id) -> Option<&Alias> {
        self.aliases.get(id)
    }

    pub fn iter_aliases(&self) -> IdMapValues<Alias> {
        self.aliases.values()
    }

    /// Look up a symbol by name
    pub fn symbol_by_name(&self, name: &str) -> Option<Symbol> {
        self.names.get(name).copied()
    }

    /// The name of a symbol
    pub fn symbol_name(&self, symbol: Symbol) -> Option<&str> {
        match symbol {
            Symbol::Function(id) => self.function(id).map(|f| f.name()),
            Symbol::Global(id) => self.global(id).map(|g| g.name()),
            Symbol::Alias(id) => self.alias(id).map(|a| a.name()),
        }
    }

    /// The use-def graph of the program
    pub fn values(&self) -> &ValueGraph {
        &self.values
    }

    /// The use-def graph of the program. Add IR-level uses of symbols here.
    pub fn values_mut(&mut self) -> &mut ValueGraph {
        &mut self.values
    }

    /// The value node that represents the address of `symbol`
    pub fn value_of(&self, symbol: Symbol) -> Option<ValueId> {
        self.symbol_values.get(&symbol).copied()
    }

    fn lookup_value(&self, symbol: Symbol) -> Result<ValueId, IrError> {
        self.value_of(symbol).ok_or(IrError::UnknownSymbol(symbol))
    }

    /// Follow aliases until a function is reached
    pub fn resolve_function(&self, symbol: Symbol) -> Result<Id, IrError> {
        let mut visited = FxHashSet::default();
        let mut current = symbol;

        loop {
            match current {
                Symbol::Function(id) => {
                    return match self.function(id) {
                        Some(_) => Ok(id),
                        None => Err(IrError::UnknownSymbol(current)),
                    };
                },
                Symbol::Global(id) => {
                    let name = self.global(id).map(|g| g.name().to_string()).ok_or(IrError::UnknownSymbol(current))?;
                    return Err(IrError::NotAFunction(name));
                },
                Symbol::Alias(id) => {
                    let alias = self.alias(id).ok_or(IrError::UnknownSymbol(current))?;

                    if !visited.insert(id) {
                        return Err(IrError::AliasCycle(alias.name().to_string()));
                    }

                    current = alias.target();
                },
            }
        }
    }

    /// Symbols that must be kept in the output
    pub fn used(&self) -> &[Symbol] {
        &self.used
    }

    pub fn is_used(&self, symbol: Symbol) -> bool {
        self.used_set.contains(&symbol)
    }

    /// Mark `symbol` as referenced from outside the program so that it survives dead code elimination
    pub fn append_to_used(&mut self, symbol: Symbol) -> Result<(), IrError> {
        let value = self.lookup_value(symbol)?;

        if self.used_set.insert(symbol) {
            self.used.push(symbol);
            self.values.add_operand(self.used_node, value);
        }

        Ok(())
    }

    /// Record a use of `symbol` in the compiler-only list
    pub fn append_to_compiler_used(&mut self, symbol: Symbol) -> Result<(), IrError> {
        let value = self.lookup_value(symbol)?;
        self.values.add_operand(self.compiler_used_node, value);
        Ok(())
    }

    /// Reorder the global list. `order` must be a permutation of all global IDs.
    pub(crate) fn reorder_globals(&mut self, order: &[Id]) -> Result<(), IrError> {
        self.globals.reorder(order)
    }
}
