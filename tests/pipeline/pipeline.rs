use obscura::{
    ir::{
        BasicBlock,
        FrameInfo,
        Function,
        GlobalObject,
        Id,
        Initializer,
        Opcode,
        Operand,
        PhysReg,
        Program,
        Reg,
        RegClass,
        StackObject,
        Symbol,
        Type,
        ValueKind,
        CFG,
    },
    passes::{
        StorageClass,
        GUARD_FUNCTION,
    },
    Hardener,
    Options,
};

fn leaf(name: &str) -> Function {
    let mut bb = BasicBlock::new();
    bb.ret();

    let mut cfg = CFG::new();
    let entry = cfg.add_basic_block(bb);
    cfg.set_entry(entry);

    Function::builder().name(name).cfg(cfg).build().unwrap()
}

/* main stores a callback into a stack slot, reloads it and calls it */
fn dispatcher(num_traps: usize) -> Function {
    let mut frame = FrameInfo::new();
    let slot = frame.add_object(StackObject::new("callbacks", Some(Type::FunctionPointer), 4, 4));

    let mut func = Function::builder().name("main").frame(frame).build().unwrap();
    let target = func.regs_mut().create_virtual(RegClass::Gpr);

    let mut bb = BasicBlock::new();
    bb.store(Reg::Phys(PhysReg::r0), Operand::Frame(slot), 0);
    bb.load(Reg::Virt(target), Operand::Frame(slot), 0);
    bb.call_indirect(Reg::Virt(target));
    bb.ret();

    let mut cfg = CFG::new();
    let entry = cfg.add_basic_block(bb);
    cfg.set_entry(entry);

    for _ in 0..num_traps {
        cfg.add_basic_block(BasicBlock::trap_block());
    }

    func.set_cfg(cfg);
    func
}

fn compare_vs_store() -> (Program, Id, Id, Id) {
    let mut program = Program::new(4).unwrap();
    let unused = program.add_function(leaf("unused")).unwrap();
    let compared = program.add_function(leaf("compared")).unwrap();
    let stored = program.add_function(leaf("stored")).unwrap();

    program.function_mut(compared).unwrap().set_address_taken(true);
    program.function_mut(stored).unwrap().set_address_taken(true);

    let cv = program.value_of(Symbol::Function(compared)).unwrap();
    let sv = program.value_of(Symbol::Function(stored)).unwrap();
    program.values_mut().add(ValueKind::Compare, &[cv]);
    program.values_mut().add(ValueKind::Store, &[sv]);

    (program, unused, compared, stored)
}

fn firmware() -> Program {
    let (mut program, ..) = compare_vs_store();
    program.add_function(dispatcher(2)).unwrap();

    program
        .add_global(GlobalObject::builder().name("table").size(64).align(4).constant(true).initializer(Initializer::Bytes(vec![7; 64])).build().unwrap())
        .unwrap();
    program
        .add_global(GlobalObject::builder().name("counter").size(4).align(4).initializer(Initializer::Bytes(vec![1, 0, 0, 0])).build().unwrap())
        .unwrap();
    program
        .add_global(GlobalObject::builder().name("buffer").size(32).align(4).initializer(Initializer::Zero).build().unwrap())
        .unwrap();
    program
}

fn all_enabled(seed: u64) -> Options {
    Options::builder()
        .enable_lgpromote(true)
        .enable_icall_limiter(true)
        .enable_gdlr(true)
        .enable_trap_decoys(true)
        .enable_global_guard(true)
        .gdlr_seed(seed)
        .max_rodata_size(0x400)
        .max_data_size(0x200)
        .max_bss_size(0x200)
        .num_guard_candidates(4)
        .build()
        .unwrap()
}

#[test]
fn test_compare_vs_store() {
    let (program, unused, compared, stored) = compare_vs_store();
    let stored_size = program.function(stored).unwrap().size() as u64;

    let report = Hardener::new(program, Options::default()).unwrap().harden().unwrap();
    let original = report.statistics.original;

    assert_eq!(original.num_funcs, 3);
    assert_eq!(original.num_funcs_leakable, 1);
    assert_eq!(original.code_size_leakable_via_func_ptr, stored_size);
    assert_eq!(original.code_size_leakable_via_ret_addr, 0);

    /* Nothing was enabled so nothing changed */
    assert_eq!(report.statistics.transformed, original);
    assert_eq!(report.program.num_functions(), 3);
    assert!(report.program.function(unused).is_some());
    assert!(report.program.function(compared).is_some());
    assert_eq!(report.layout.decoy_words_data, 0);
    assert_eq!(report.limited_calls, 0);
    assert_eq!(report.warnings, 0);
}

#[test]
fn test_full_pipeline() {
    let report = Hardener::new(firmware(), all_enabled(42)).unwrap().harden().unwrap();
    let program = &report.program;

    assert_eq!(report.statistics.original.num_funcs, 4);
    assert_eq!(report.statistics.original.num_funcs_leakable, 1);
    assert_eq!(report.statistics.transformed.num_funcs, 5);

    /* The callback slot moved out of the stack frame */
    assert_eq!(report.promotion.promoted, 1);
    let Some(Symbol::Function(main)) = program.symbol_by_name("main") else {
        panic!("main is missing");
    };
    assert_eq!(program.function(main).unwrap().frame().num_objects(), 0);
    let Some(Symbol::Global(slot)) = program.symbol_by_name("main.callbacks") else {
        panic!("Promoted global is missing");
    };
    assert_eq!(StorageClass::of(program.global(slot).unwrap()), Some(StorageClass::Data));

    /* The indirect call is limited */
    assert_eq!(report.limited_calls, 1);
    let entry = program.function(main).unwrap().cfg().unwrap().basic_block_at(0).unwrap();
    assert!(entry.instrs().iter().any(|instr| instr.opcode() == Opcode::CallIndirectLimited));
    assert!(!entry.instrs().iter().any(|instr| instr.opcode() == Opcode::CallIndirect));

    /* The data regions were filled up to their capacity */
    assert_eq!(report.layout.rodata_bytes, 64);
    assert_eq!(report.layout.data_bytes, 8);
    assert_eq!(report.layout.bss_bytes, 32);
    assert_eq!(report.layout.traps_etched, 2);

    /* More decoys than trap blocks */
    assert_eq!(report.warnings, 1);

    for (class, capacity) in [(StorageClass::Rodata, 0x400), (StorageClass::Data, 0x200), (StorageClass::Bss, 0x200)] {
        let bytes: u64 = program.iter_globals().filter(|g| StorageClass::of(g) == Some(class)).map(|g| g.size() as u64).sum();
        assert!(bytes <= capacity);
        assert!(bytes > capacity / 2);
    }

    let Some(Symbol::Function(guard)) = program.symbol_by_name(GUARD_FUNCTION) else {
        panic!("Guard function is missing");
    };
    assert!(program.is_used(Symbol::Function(guard)));
    assert!(program.function(guard).unwrap().is_naked());
}

#[test]
fn test_layout_depends_only_on_seed() {
    let layout = |seed| {
        let report = Hardener::new(firmware(), all_enabled(seed)).unwrap().harden().unwrap();
        report.program.iter_globals().map(|g| (g.name().to_string(), g.size(), g.initializer().cloned())).collect::<Vec<_>>()
    };

    assert_eq!(layout(7), layout(7));
    assert_ne!(layout(7), layout(8));
}

#[test]
fn test_zero_guard_candidates_are_rejected() {
    let json = r#"{"enable_gdlr": true, "enable_global_guard": true, "num_guard_candidates": 0}"#;
    assert!(serde_json::from_str::<Options>(json).is_err());

    let json = r#"{"enable_gdlr": true, "enable_global_guard": true, "num_guard_candidates": 2, "max_rodata_size": 1024, "max_data_size": 512, "max_bss_size": 512}"#;
    let options: Options = serde_json::from_str(json).unwrap();
    let report = Hardener::new(firmware(), options).unwrap().harden().unwrap();
    assert!(report.program.symbol_by_name(GUARD_FUNCTION).is_some());
}
