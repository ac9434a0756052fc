use crate::{
    ir::Program,
    logger::Logger,
};

/// A pass in `obscura` is any type that implements this trait.
///
/// Passes can be used to inspect or modify the program.
pub trait Pass {
    /// The error that might be returned by the pass
    type Error: std::error::Error;

    /// The name of the pass (displayed on the terminal)
    fn name(&self) -> String;

    /// Run the pass.
    ///
    /// # Arguments
    /// 1. `program`: The program that contains all machine functions, globals and aliases
    /// 2. `logger`: A helper struct that can display log messages at different log levels
    ///
    /// Returns whether the program was modified.
    fn run(&mut self, program: &mut Program, logger: &Logger) -> Result<bool, Self::Error>;
}
