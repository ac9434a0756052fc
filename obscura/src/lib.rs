//! <h1 align="center"> obscura </h1><hr/>
//!
//! Hardening passes for Thumb-2 machine code that reduce what an attacker learns from leaked
//! control data.
//!
//! The crate operates on an in-memory [`ir::Program`]. A [`Hardener`] runs the passes in a fixed order:
//! 1. The control data leakage analysis measures how much code is locatable through leaked
//!    function pointers and spilled return addresses.
//! 2. Local-to-global promotion moves stack objects that hold function pointers into private globals.
//! 3. The indirect call limiter restricts the target registers of indirect calls.
//! 4. The global data layout randomizer shuffles the data regions and fills them with decoys.
//! 5. The leakage analysis runs again over the hardened code.
//!
//! Every pass can also be run on its own via [`Hardener::run_pass`].

mod hardener;
mod logger;

pub mod instrument;
pub mod ir;
pub mod options;
pub mod passes;

pub use hardener::{
    HardenError,
    Hardener,
    Report,
};
pub use logger::Logger;
pub use options::{
    Options,
    OptionsBuilder,
};
