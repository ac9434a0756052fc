use serde::{
    de::Error as _,
    Deserialize,
    Deserializer,
    Serialize,
};

const ZERO_GUARD_CANDIDATES: &str = "Number of global guard candidates must not be zero";

fn guard_candidates<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let num = u64::deserialize(deserializer)?;

    if num == 0 {
        return Err(D::Error::custom(ZERO_GUARD_CANDIDATES));
    }

    Ok(num)
}

/// Configuration of the hardening pipeline.
/// Use [`Options::builder`] to create it or deserialize it from any serde format.
/// Missing fields take their default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    enable_lgpromote: bool,
    enable_icall_limiter: bool,
    enable_gdlr: bool,
    enable_trap_decoys: bool,
    enable_global_guard: bool,
    gdlr_seed: u64,
    max_rodata_size: u64,
    max_data_size: u64,
    max_bss_size: u64,
    #[serde(deserialize_with = "guard_candidates")]
    num_guard_candidates: u64,
    rng_address: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_lgpromote: false,
            enable_icall_limiter: false,
            enable_gdlr: false,
            enable_trap_decoys: false,
            enable_global_guard: false,
            gdlr_seed: 0,
            max_rodata_size: 0x40000,
            max_data_size: 0x10000,
            max_bss_size: 0x10000,
            num_guard_candidates: 16,
            rng_address: None,
        }
    }
}

impl Options {
    /// Create an [`OptionsBuilder`] that starts from the default values
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder {
            options: Options::default(),
        }
    }

    pub fn enable_lgpromote(&self) -> bool {
        self.enable_lgpromote
    }

    pub fn enable_icall_limiter(&self) -> bool {
        self.enable_icall_limiter
    }

    pub fn enable_gdlr(&self) -> bool {
        self.enable_gdlr
    }

    pub fn enable_trap_decoys(&self) -> bool {
        self.enable_trap_decoys
    }

    pub fn enable_global_guard(&self) -> bool {
        self.enable_global_guard
    }

    pub fn gdlr_seed(&self) -> u64 {
        self.gdlr_seed
    }

    pub fn max_rodata_size(&self) -> u64 {
        self.max_rodata_size
    }

    pub fn max_data_size(&self) -> u64 {
        self.max_data_size
    }

    pub fn max_bss_size(&self) -> u64 {
        self.max_bss_size
    }

    pub fn num_guard_candidates(&self) -> u64 {
        self.num_guard_candidates
    }

    pub fn rng_address(&self) -> Option<u64> {
        self.rng_address
    }
}

/// Configures [`Options`]. Use [`Options::builder`] to create it.
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Move function-pointer-holding stack objects into globals (default: `false`)
    pub fn enable_lgpromote(mut self, flag: bool) -> Self {
        self.options.enable_lgpromote = flag;
        self
    }

    /// Restrict the registers of indirect calls (default: `false`)
    pub fn enable_icall_limiter(mut self, flag: bool) -> Self {
        self.options.enable_icall_limiter = flag;
        self
    }

    /// Shuffle the globals and fill the data regions with decoys (default: `false`)
    pub fn enable_gdlr(mut self, flag: bool) -> Self {
        self.options.enable_gdlr = flag;
        self
    }

    /// Fill decoys with addresses of trap blocks (default: `false`)
    pub fn enable_trap_decoys(mut self, flag: bool) -> Self {
        self.options.enable_trap_decoys = flag;
        self
    }

    /// Create the global guard accessor (default: `false`)
    pub fn enable_global_guard(mut self, flag: bool) -> Self {
        self.options.enable_global_guard = flag;
        self
    }

    /// Seed of the layout randomization (default: `0`)
    pub fn gdlr_seed(mut self, seed: u64) -> Self {
        self.options.gdlr_seed = seed;
        self
    }

    /// Capacity of the read-only data region in bytes (default: `0x40000`)
    pub fn max_rodata_size(mut self, size: u64) -> Self {
        self.options.max_rodata_size = size;
        self
    }

    /// Capacity of the data region in bytes (default: `0x10000`)
    pub fn max_data_size(mut self, size: u64) -> Self {
        self.options.max_data_size = size;
        self
    }

    /// Capacity of the zero-initialized region in bytes (default: `0x10000`)
    pub fn max_bss_size(mut self, size: u64) -> Self {
        self.options.max_bss_size = size;
        self
    }

    /// How many decoys are sampled as guard candidates (default: `16`)
    pub fn num_guard_candidates(mut self, num: u64) -> Self {
        self.options.num_guard_candidates = num;
        self
    }

    /// Address of a hardware random number generator that the guard accessor reads at runtime (default: none)
    pub fn rng_address(mut self, address: u64) -> Self {
        self.options.rng_address = Some(address);
        self
    }

    pub fn build(self) -> Result<Options, &'static str> {
        if self.options.num_guard_candidates == 0 {
            return Err(ZERO_GUARD_CANDIDATES);
        }

        Ok(self.options)
    }
}
