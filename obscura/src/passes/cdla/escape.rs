use rustc_hash::FxHashSet;

use crate::{
    ir::{
        Function,
        HasId,
        Program,
        Symbol,
        ValueKind,
        COMPILER_USED_LIST,
        USED_LIST,
    },
    Logger,
};

/// Check whether the address of `func` can escape to memory.
///
/// The address-taken flag of a function is set for any use other than a direct call, including
/// harmless ones like comparisons against the function address. This walks the uses of the function
/// to tell them apart. It is deliberately local: a store or a non-callee call argument counts as an escape
/// without following where the value goes afterwards.
pub fn is_really_address_taken(program: &Program, func: &Function, logger: &Logger) -> bool {
    if !func.is_address_taken() {
        return false;
    }

    let Some(start) = program.value_of(Symbol::Function(func.id())) else {
        return false;
    };

    let values = program.values();
    let mut visited = FxHashSet::default();
    let mut worklist = vec![start];
    visited.insert(start);

    while let Some(value) = worklist.pop() {
        for user in values.node(value).users() {
            let node = values.node(*user);

            let follow = match node.kind() {
                ValueKind::Phi | ValueKind::Alias(_) | ValueKind::Function(_) | ValueKind::Constant | ValueKind::Cast | ValueKind::Select => true,
                ValueKind::BlockAddress | ValueKind::Compare => false,
                ValueKind::ConstantExpr {
                    compare,
                } => !compare,
                ValueKind::Global {
                    name,
                    ..
                } => {
                    if name != USED_LIST && name != COMPILER_USED_LIST {
                        return true;
                    }
                    false
                },
                ValueKind::Store => return true,
                ValueKind::Call => {
                    if node.operands().iter().skip(1).any(|arg| arg == &value) {
                        return true;
                    }
                    false
                },
                ValueKind::Other(_) => {
                    logger.warning(format!("Unrecognized use of @{}: {:?}", func.name(), node.kind()));
                    false
                },
            };

            if follow && visited.insert(*user) {
                worklist.push(*user);
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        FunctionPointer,
        GlobalObject,
        Id,
        Initializer,
        Pointer,
    };

    fn program_with(address_taken: bool) -> (Program, Id) {
        let mut program = Program::new(4).unwrap();
        let f = program.add_function(Function::builder().name("f").address_taken(address_taken).build().unwrap()).unwrap();
        (program, f)
    }

    fn escapes(program: &Program, f: Id) -> bool {
        is_really_address_taken(program, program.function(f).unwrap(), &Logger::spinner())
    }

    #[test]
    fn test_not_address_taken() {
        let (mut program, f) = program_with(false);
        let fv = program.value_of(Symbol::Function(f)).unwrap();
        program.values_mut().add(ValueKind::Store, &[fv]);

        /* The flag is trusted if it is not set */
        assert!(!escapes(&program, f));
    }

    #[test]
    fn test_compare_only() {
        let (mut program, f) = program_with(true);
        let fv = program.value_of(Symbol::Function(f)).unwrap();
        let cast = program.values_mut().add(ValueKind::Cast, &[fv]);
        program.values_mut().add(ValueKind::Compare, &[cast]);
        program.values_mut().add(ValueKind::ConstantExpr { compare: true }, &[fv]);

        assert!(!escapes(&program, f));
    }

    #[test]
    fn test_store_through_phi_and_select() {
        let (mut program, f) = program_with(true);
        let fv = program.value_of(Symbol::Function(f)).unwrap();
        let phi = program.values_mut().add(ValueKind::Phi, &[fv]);
        program.values_mut().add_operand(phi, phi);
        let select = program.values_mut().add(ValueKind::Select, &[phi]);
        program.values_mut().add(ValueKind::Store, &[select]);

        assert!(escapes(&program, f));
    }

    #[test]
    fn test_call_argument_vs_callee() {
        let (mut program, f) = program_with(true);
        let fv = program.value_of(Symbol::Function(f)).unwrap();
        program.values_mut().add(ValueKind::Call, &[fv]);
        assert!(!escapes(&program, f));

        let other = program.values_mut().add(ValueKind::Other("callee".to_string()), &[]);
        program.values_mut().add(ValueKind::Call, &[other, fv]);
        assert!(escapes(&program, f));
    }

    #[test]
    fn test_used_lists_and_globals() {
        let (mut program, f) = program_with(true);
        program.append_to_used(Symbol::Function(f)).unwrap();
        program.append_to_compiler_used(Symbol::Function(f)).unwrap();
        assert!(!escapes(&program, f));

        let table = GlobalObject::builder()
            .name("table")
            .size(4)
            .initializer(Initializer::Pointers(vec![Pointer::Function(FunctionPointer {
                function: f,
            })]))
            .build()
            .unwrap();
        program.add_global(table).unwrap();
        assert!(escapes(&program, f));
    }

    #[test]
    fn test_use_by_another_function() {
        let (mut program, f) = program_with(true);
        let g = program.add_function(Function::builder().name("g").build().unwrap()).unwrap();
        let fv = program.value_of(Symbol::Function(f)).unwrap();
        let gv = program.value_of(Symbol::Function(g)).unwrap();

        /* e.g. a prefix or personality operand of g refers to f */
        program.values_mut().add_operand(gv, fv);
        assert!(!escapes(&program, f));

        program.values_mut().add(ValueKind::Store, &[gv]);
        assert!(escapes(&program, f));
    }

    #[test]
    fn test_alias_cycle_terminates() {
        let (mut program, f) = program_with(true);
        let a = program.add_alias("a", Symbol::Function(f)).unwrap();
        let b = program.add_alias("b", Symbol::Alias(a)).unwrap();
        program.set_alias_target(a, Symbol::Alias(b)).unwrap();

        let av = program.value_of(Symbol::Alias(a)).unwrap();
        let fv = program.value_of(Symbol::Function(f)).unwrap();
        program.values_mut().add_operand(av, fv);

        assert!(!escapes(&program, f));
    }
}
