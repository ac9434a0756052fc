use rand::{
    Rng,
    RngCore,
};
use rand_chacha::ChaCha20Rng;

use crate::{
    ir::{
        BasicBlockPointer,
        HasId,
        Initializer,
        Operand,
        Pointer,
        Program,
    },
    passes::gdlr::{
        GdlrError,
        StorageClass,
    },
    Logger,
};

/// Size and alignment of a full decoy block
pub const DECOY_BLOCK_SIZE: usize = 32;

/// What a decoy object is filled with
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum DecoyContent {
    Zero,
    Traps(Vec<BasicBlockPointer>),
    Words(Vec<u64>),
}

impl DecoyContent {
    pub(super) fn is_zero(&self) -> bool {
        matches!(self, DecoyContent::Zero)
    }

    pub(super) fn into_initializer(self) -> Initializer {
        match self {
            DecoyContent::Zero => Initializer::Zero,
            DecoyContent::Traps(traps) => Initializer::Pointers(traps.into_iter().map(Pointer::BasicBlock).collect()),
            DecoyContent::Words(words) => Initializer::Pointers(words.into_iter().map(Pointer::Raw).collect()),
        }
    }
}

/// A decoy object that has not been added to the program yet
#[derive(Debug, Clone)]
pub(super) struct DecoyPlan {
    pub(super) class: StorageClass,
    pub(super) size: usize,
    pub(super) align: usize,
    pub(super) content: DecoyContent,
    /// The trap block that gets etched with the address of this decoy
    pub(super) etch: Option<BasicBlockPointer>,
}

/// A random pointer-sized value that has the thumb bit set
pub(super) fn random_word(rng: &mut ChaCha20Rng, ptr: usize) -> u64 {
    let word = rng.next_u64() | 1;

    if ptr < 8 {
        word & u32::MAX as u64
    } else {
        word
    }
}

/// The trap blocks of a program. Every trap block can be etched only once.
pub(super) struct TrapPool {
    all: Vec<BasicBlockPointer>,
    unetched: Vec<BasicBlockPointer>,
    exhaustion_reported: bool,
}

impl TrapPool {
    /// Collect all trap blocks. Trap blocks whose trap instruction already holds an address count as etched.
    pub(super) fn collect(program: &Program) -> Result<Self, GdlrError> {
        let mut all = Vec::new();
        let mut unetched = Vec::new();

        for func in program.iter_functions() {
            let Some(cfg) = func.cfg() else {
                continue;
            };

            for bb in cfg.iter_basic_blocks().filter(|bb| bb.is_trap()) {
                let pointer = BasicBlockPointer {
                    function: func.id(),
                    bb: bb.id(),
                };

                match bb.instrs().first().and_then(|instr| instr.operand(0)) {
                    Some(Operand::Imm(_)) => unetched.push(pointer.clone()),
                    Some(Operand::Symbol {
                        ..
                    }) => {},
                    _ => {
                        return Err(GdlrError::InvalidTrapBlock(func.name().to_string(), bb.id()));
                    },
                }

                all.push(pointer);
            }
        }

        Ok(Self {
            all,
            unetched,
            exhaustion_reported: false,
        })
    }

    pub(super) fn has_unetched(&self) -> bool {
        !self.unetched.is_empty()
    }

    pub(super) fn random_trap(&self, rng: &mut ChaCha20Rng) -> Option<BasicBlockPointer> {
        if self.all.is_empty() {
            return None;
        }

        Some(self.all[rng.gen_range(0..self.all.len())].clone())
    }

    /// Remove a random unetched trap block from the pool
    pub(super) fn take(&mut self, rng: &mut ChaCha20Rng, logger: &Logger) -> Option<BasicBlockPointer> {
        if self.unetched.is_empty() {
            if !self.all.is_empty() && !self.exhaustion_reported {
                logger.warning("All trap blocks etched");
                self.exhaustion_reported = true;
            }
            return None;
        }

        let idx = rng.gen_range(0..self.unetched.len());
        Some(self.unetched.swap_remove(idx))
    }
}

/// Split `units` pointer-sized decoy entries into 32-byte blocks plus one smaller remainder block
/// and decide their content.
pub(super) fn plan_decoys(
    class: StorageClass,
    units: u64,
    ptr: usize,
    trap_decoys: bool,
    pool: &mut TrapPool,
    rng: &mut ChaCha20Rng,
    logger: &Logger,
) -> Vec<DecoyPlan> {
    let mut plans = Vec::new();
    let mut remaining = units as usize * ptr;

    while remaining > 0 {
        let (size, align) = if remaining < DECOY_BLOCK_SIZE { (remaining, ptr) } else { (DECOY_BLOCK_SIZE, DECOY_BLOCK_SIZE) };
        let entries = size / ptr;

        let content = if class == StorageClass::Bss {
            DecoyContent::Zero
        } else if trap_decoys && pool.has_unetched() {
            DecoyContent::Traps((0..entries).filter_map(|_| pool.random_trap(rng)).collect())
        } else {
            DecoyContent::Words((0..entries).map(|_| random_word(rng, ptr)).collect())
        };

        let etch = pool.take(rng, logger);

        plans.push(DecoyPlan {
            class,
            size,
            align,
            content,
            etch,
        });

        remaining -= size;
    }

    plans
}
