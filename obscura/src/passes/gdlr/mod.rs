//! Global data layout randomization.
//!
//! Shuffles the global objects inside their storage class and fills the remaining
//! capacity of every class with decoy objects of random size and content.

mod decoy;
mod guard;

use std::fmt::{
    Display,
    Formatter,
};

use decoy::{
    plan_decoys,
    random_word,
    DecoyContent,
    DecoyPlan,
    TrapPool,
};
pub use decoy::DECOY_BLOCK_SIZE;
use guard::build_guard_cfg;
pub use guard::GUARD_FUNCTION;
use rand::{
    seq::SliceRandom,
    Rng,
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha20Rng;
use rustc_hash::FxHashMap;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

use crate::{
    ir::{
        AddrPart,
        Function,
        GlobalObject,
        HasId,
        Id,
        IrError,
        Linkage,
        Operand,
        Program,
        Symbol,
        CFG,
    },
    passes::Pass,
    Logger,
    Options,
};

/// Name prefix of all decoy objects
pub const DECOY_PREFIX: &str = "__obscura_decoy";

/// The region a global object is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    /// Constants
    Rodata,
    /// Writable objects with an initial value
    Data,
    /// Zero-initialized objects
    Bss,
}

impl StorageClass {
    /// All classes in output order
    pub const ALL: [StorageClass; 3] = [StorageClass::Rodata, StorageClass::Data, StorageClass::Bss];

    /// The storage class implied by the attributes of `global`. Declarations have none.
    pub fn of(global: &GlobalObject) -> Option<StorageClass> {
        let init = global.initializer()?;

        if global.is_constant() {
            Some(StorageClass::Rodata)
        } else if init.is_zero() {
            Some(StorageClass::Bss)
        } else {
            Some(StorageClass::Data)
        }
    }

    /// Prefix of the sections that belong to this class
    pub fn section_prefix(&self) -> &'static str {
        match self {
            StorageClass::Rodata => ".rodata",
            StorageClass::Data => ".data",
            StorageClass::Bss => ".bss",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }

    fn capacity(&self, options: &Options) -> u64 {
        match self {
            StorageClass::Rodata => options.max_rodata_size(),
            StorageClass::Data => options.max_data_size(),
            StorageClass::Bss => options.max_bss_size(),
        }
    }
}

impl Display for StorageClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageClass::Rodata => write!(f, "rodata"),
            StorageClass::Data => write!(f, "data"),
            StorageClass::Bss => write!(f, "bss"),
        }
    }
}

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum GdlrError {
    #[error("The {class} objects take up {used} bytes but only {capacity} bytes are available")]
    CapacityExceeded {
        class: StorageClass,
        used: u64,
        capacity: u64,
    },

    #[error("Trap block {1} of function {0} does not start with an etchable trap instruction")]
    InvalidTrapBlock(String, Id),

    #[error("No room for the global guard: data region would grow to {used} bytes but only {capacity} bytes are available")]
    GuardDoesNotFit {
        used: u64,
        capacity: u64,
    },

    #[error("The name of the global guard function is taken by another symbol")]
    GuardNameTaken,

    #[error("The global guard needs at least one candidate")]
    NoGuardCandidates,

    #[error("RNG address {0:#x} does not fit into 32 bits")]
    InvalidRngAddress(u64),

    #[error("Could not create a decoy: {0}")]
    InvalidDecoy(&'static str),

    #[error("{0}")]
    Ir(#[from] IrError),
}

/// Sizes of the storage classes and what the randomizer added to them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutStatistics {
    /// Bytes taken up by the original objects
    pub rodata_bytes: u64,
    pub data_bytes: u64,
    pub bss_bytes: u64,
    /// Pointer-sized decoy entries that were inserted
    pub decoy_words_rodata: u64,
    pub decoy_words_data: u64,
    pub decoy_words_bss: u64,
    pub traps_etched: u64,
    /// Globals that are not randomized because they are declarations or live in unexpected sections
    pub ignored_globals: u64,
}

impl LayoutStatistics {
    fn bytes_mut(&mut self, class: StorageClass) -> &mut u64 {
        match class {
            StorageClass::Rodata => &mut self.rodata_bytes,
            StorageClass::Data => &mut self.data_bytes,
            StorageClass::Bss => &mut self.bss_bytes,
        }
    }

    /// Bytes of the original objects in `class`
    pub fn bytes(&self, class: StorageClass) -> u64 {
        match class {
            StorageClass::Rodata => self.rodata_bytes,
            StorageClass::Data => self.data_bytes,
            StorageClass::Bss => self.bss_bytes,
        }
    }

    fn decoy_words_mut(&mut self, class: StorageClass) -> &mut u64 {
        match class {
            StorageClass::Rodata => &mut self.decoy_words_rodata,
            StorageClass::Data => &mut self.decoy_words_data,
            StorageClass::Bss => &mut self.decoy_words_bss,
        }
    }
}

/* Everything the pass is going to add, decided before the program is touched */
struct Layout {
    /// Pre-shuffle order of every class
    classes: [Vec<Id>; 3],
    /// Shuffled order of every class
    shuffled: [Vec<Id>; 3],
    /// Globals that keep their relative order in front of everything else
    excluded: Vec<Id>,
    decoys: Vec<DecoyPlan>,
    /// Indices into `decoys` that precede a global
    anchored: FxHashMap<Id, Vec<usize>>,
    guard: Option<GuardPlan>,
}

struct GuardPlan {
    /// Indices into `decoys`
    candidates: Vec<usize>,
    /// Index into `decoys` of a decoy that was created just for the guard
    fallback: Option<usize>,
    static_pick: usize,
}

/// Randomizes the layout of the global data regions.
///
/// Every class is shuffled separately and the unused part of its capacity is distributed
/// among its objects as decoys that are placed in front of them. Decoys are anchored
/// in trap blocks and optionally one of them becomes the global guard.
/// All randomness comes from a ChaCha20 generator seeded with the configured seed.
pub struct LayoutRandomizerPass {
    options: Options,
    statistics: LayoutStatistics,
}

impl LayoutRandomizerPass {
    pub fn new(options: &Options) -> Self {
        Self {
            options: options.clone(),
            statistics: LayoutStatistics::default(),
        }
    }

    /// The statistics of the last run
    pub fn statistics(&self) -> &LayoutStatistics {
        &self.statistics
    }

    fn classify(&mut self, program: &Program, logger: &Logger) -> ([Vec<Id>; 3], Vec<Id>) {
        let mut classes: [Vec<Id>; 3] = Default::default();
        let mut excluded = Vec::new();

        for global in program.iter_globals() {
            let Some(class) = StorageClass::of(global) else {
                logger.debug(format!("Ignoring external global @{}", global.name()));
                excluded.push(global.id());
                self.statistics.ignored_globals += 1;
                continue;
            };

            if let Some(section) = global.section() {
                if !section.starts_with(class.section_prefix()) {
                    logger.warning(format!("Ignoring {} global @{} in section {}", class, global.name(), section));
                    excluded.push(global.id());
                    self.statistics.ignored_globals += 1;
                    continue;
                }
            }

            classes[class.index()].push(global.id());
            *self.statistics.bytes_mut(class) += global.size() as u64;
        }

        (classes, excluded)
    }

    fn plan(&self, program: &Program, classes: [Vec<Id>; 3], excluded: Vec<Id>, logger: &Logger) -> Result<Layout, GdlrError> {
        let ptr = program.pointer_size() as u64;

        for class in StorageClass::ALL {
            let used = self.statistics.bytes(class);
            let capacity = class.capacity(&self.options);

            if used > capacity {
                return Err(GdlrError::CapacityExceeded {
                    class,
                    used,
                    capacity,
                });
            }
        }

        if self.options.enable_global_guard() {
            if self.options.num_guard_candidates() == 0 {
                return Err(GdlrError::NoGuardCandidates);
            }

            if let Some(symbol) = program.symbol_by_name(GUARD_FUNCTION) {
                if !matches!(symbol, Symbol::Function(_)) {
                    return Err(GdlrError::GuardNameTaken);
                }
            }
        }

        let mut pool = TrapPool::collect(program)?;
        let mut rng = ChaCha20Rng::seed_from_u64(self.options.gdlr_seed());

        let mut shuffled = classes.clone();
        for list in &mut shuffled {
            list.shuffle(&mut rng);
        }

        /* Distribute the free units of every class by random weights */
        let mut shares: FxHashMap<Id, u64> = FxHashMap::default();

        for class in StorageClass::ALL {
            let units = (class.capacity(&self.options) - self.statistics.bytes(class)) / ptr;
            let objects = &shuffled[class.index()];
            let weights: Vec<u64> = objects.iter().map(|_| rng.next_u32() as u64).collect();
            let sum: u128 = weights.iter().map(|w| *w as u128).sum();

            for (id, weight) in objects.iter().zip(weights) {
                let share = if sum == 0 { 0 } else { (weight as u128 * units as u128 / sum) as u64 };
                shares.insert(*id, share);
            }
        }

        let mut decoys = Vec::new();
        let mut anchored: FxHashMap<Id, Vec<usize>> = FxHashMap::default();

        for class in StorageClass::ALL {
            for id in &classes[class.index()] {
                let share = shares.get(id).copied().unwrap_or(0);
                let plans = plan_decoys(class, share, ptr as usize, self.options.enable_trap_decoys(), &mut pool, &mut rng, logger);
                let indices = (decoys.len()..decoys.len() + plans.len()).collect();
                decoys.extend(plans);
                anchored.insert(*id, indices);
            }
        }

        let guard = if self.options.enable_global_guard() { Some(self.plan_guard(&mut decoys, ptr as usize, &mut rng)?) } else { None };

        Ok(Layout {
            classes,
            shuffled,
            excluded,
            decoys,
            anchored,
            guard,
        })
    }

    fn plan_guard(&self, decoys: &mut Vec<DecoyPlan>, ptr: usize, rng: &mut ChaCha20Rng) -> Result<GuardPlan, GdlrError> {
        let eligible: Vec<usize> = decoys
            .iter()
            .enumerate()
            .filter(|(_, plan)| plan.class == StorageClass::Data && plan.size == DECOY_BLOCK_SIZE && !plan.content.is_zero())
            .map(|(idx, _)| idx)
            .collect();

        let mut fallback = None;

        let candidates = if eligible.is_empty() {
            /* The guard needs a decoy of its own */
            let decoy_bytes: u64 = decoys.iter().filter(|plan| plan.class == StorageClass::Data).map(|plan| plan.size as u64).sum();
            let used = self.statistics.data_bytes + decoy_bytes + DECOY_BLOCK_SIZE as u64;
            let capacity = self.options.max_data_size();

            if used > capacity {
                return Err(GdlrError::GuardDoesNotFit {
                    used,
                    capacity,
                });
            }

            decoys.push(DecoyPlan {
                class: StorageClass::Data,
                size: DECOY_BLOCK_SIZE,
                align: DECOY_BLOCK_SIZE,
                content: DecoyContent::Words((0..DECOY_BLOCK_SIZE / ptr).map(|_| random_word(rng, ptr)).collect()),
                etch: None,
            });
            fallback = Some(decoys.len() - 1);
            vec![decoys.len() - 1]
        } else {
            (0..self.options.num_guard_candidates()).map(|_| eligible[rng.gen_range(0..eligible.len())]).collect()
        };

        let runtime = self.options.rng_address().is_some() && candidates.len() > 1;
        let static_pick = if runtime { 0 } else { rng.gen_range(0..candidates.len()) };

        Ok(GuardPlan {
            candidates,
            fallback,
            static_pick,
        })
    }

    fn next_decoy_name(program: &Program, counter: &mut usize) -> String {
        loop {
            let name = format!("{}.{}", DECOY_PREFIX, *counter);
            *counter += 1;

            if program.symbol_by_name(&name).is_none() {
                return name;
            }
        }
    }

    fn add_decoy(&mut self, program: &mut Program, plan: DecoyPlan, counter: &mut usize) -> Result<Id, GdlrError> {
        let ptr = program.pointer_size();
        let name = Self::next_decoy_name(program, counter);
        let words = (plan.size / ptr) as u64;

        let global = GlobalObject::builder()
            .name(name)
            .size(plan.size)
            .align(plan.align)
            .constant(plan.class == StorageClass::Rodata)
            .initializer(plan.content.into_initializer())
            .linkage(Linkage::Internal)
            .build()
            .map_err(GdlrError::InvalidDecoy)?;
        let id = program.add_global(global)?;

        if let Some(global) = program.global_mut(id) {
            global.set_decoy(true);
        }

        *self.statistics.decoy_words_mut(plan.class) += words;

        /* Reference the decoy from the trap instruction so it survives dead code elimination */
        if let Some(trap) = plan.etch {
            let instr = program
                .function_mut(trap.function)
                .and_then(|func| func.cfg_mut())
                .and_then(|cfg| cfg.basic_block_mut(trap.bb))
                .and_then(|bb| bb.instr_mut(0));

            if let Some(instr) = instr {
                instr.set_operand(
                    0,
                    Operand::Symbol {
                        symbol: Symbol::Global(id),
                        offset: 0,
                        part: AddrPart::Lo16,
                    },
                );
                self.statistics.traps_etched += 1;
            }
        }

        Ok(id)
    }

    fn insert_guard_function(program: &mut Program, cfg: CFG) -> Result<Id, GdlrError> {
        if let Some(Symbol::Function(id)) = program.symbol_by_name(GUARD_FUNCTION) {
            if let Some(func) = program.function_mut(id) {
                func.set_cfg(cfg);
                func.set_naked(true);
                func.set_linkage(Linkage::LinkOnce);
                func.set_callee_saved(Vec::new());
            }
            return Ok(id);
        }

        let func = Function::builder()
            .name(GUARD_FUNCTION)
            .cfg(cfg)
            .naked(true)
            .linkage(Linkage::LinkOnce)
            .callee_saved(Vec::new())
            .allocated(true)
            .build()
            .map_err(GdlrError::InvalidDecoy)?;

        Ok(program.add_function(func)?)
    }

    fn apply(&mut self, program: &mut Program, layout: Layout, logger: &Logger) -> Result<(), GdlrError> {
        let mut counter = 0;
        let mut ids = Vec::with_capacity(layout.decoys.len());

        for plan in layout.decoys {
            ids.push(self.add_decoy(program, plan, &mut counter)?);
        }

        /* Decoys go directly in front of their anchor */
        let mut order = layout.excluded;

        for class in StorageClass::ALL {
            for id in &layout.shuffled[class.index()] {
                if let Some(indices) = layout.anchored.get(id) {
                    order.extend(indices.iter().map(|idx| ids[*idx]));
                }
                order.push(*id);
            }

            if class == StorageClass::Data {
                if let Some(fallback) = layout.guard.as_ref().and_then(|guard| guard.fallback) {
                    order.push(ids[fallback]);
                }
            }
        }

        program.reorder_globals(&order)?;

        for id in &ids {
            program.append_to_used(Symbol::Global(*id))?;
        }

        if let Some(guard) = layout.guard {
            let candidates: Vec<Id> = guard.candidates.iter().map(|idx| ids[*idx]).collect();
            let rng_address = self.options.rng_address().map(|address| address as u32);
            let cfg = build_guard_cfg(&candidates, rng_address, guard.static_pick);
            let func = Self::insert_guard_function(program, cfg)?;
            program.append_to_used(Symbol::Function(func))?;

            logger.info(format!("Created the global guard with {} candidates", candidates.len()));
        }

        logger.debug(format!("Randomized {} globals", layout.classes.iter().map(|c| c.len()).sum::<usize>()));
        Ok(())
    }
}

impl Pass for LayoutRandomizerPass {
    type Error = GdlrError;

    fn name(&self) -> String {
        "LayoutRandomizerPass".to_string()
    }

    fn run(&mut self, program: &mut Program, logger: &Logger) -> Result<bool, GdlrError> {
        self.statistics = LayoutStatistics::default();

        let (classes, excluded) = self.classify(program, logger);

        logger.summary(
            "Sizes of the original objects",
            &[("rodata", self.statistics.rodata_bytes), ("data", self.statistics.data_bytes), ("bss", self.statistics.bss_bytes)],
        );

        if !self.options.enable_gdlr() {
            return Ok(false);
        }

        if let Some(address) = self.options.rng_address() {
            if address > u32::MAX as u64 {
                return Err(GdlrError::InvalidRngAddress(address));
            }
        }

        let layout = self.plan(program, classes, excluded, logger)?;
        self.apply(program, layout, logger)?;

        logger.summary(
            "Inserted decoy words",
            &[
                ("rodata", self.statistics.decoy_words_rodata),
                ("data", self.statistics.decoy_words_data),
                ("bss", self.statistics.decoy_words_bss),
                ("etched traps", self.statistics.traps_etched),
            ],
        );

        Ok(true)
    }
}
