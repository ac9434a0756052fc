#[cfg(feature = "tui")]
use core::time::Duration;
use std::{
    borrow::Cow,
    cell::Cell,
    fmt::Display,
};

use colored::{
    ColoredString,
    Colorize,
};
use indicatif::{
    ProgressBar,
    ProgressStyle,
};

#[cfg(feature = "tui")]
const ANIMATION: &[&str; 9] = &[".  ", ".. ", "...", " ..", "  .", " ..", "...", "..", ""];

#[cfg(not(feature = "tui"))]
const ANIMATION: &[&str; 2] = &["...", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warning,
    Debug,
    Error,
}

impl Level {
    fn tag(&self) -> ColoredString {
        match self {
            Level::Info => "[obscura::INFO]".blue().bold(),
            Level::Warning => "[obscura::WARN]".yellow().bold(),
            Level::Debug => "[obscura::DEBUG]".black().on_white(),
            Level::Error => "[obscura::ERROR]".red().bold(),
        }
    }
}

/* "title: key=value key=value" */
fn format_summary<V: Display>(title: &str, entries: &[(&str, V)]) -> String {
    let mut line = format!("{}:", title);

    for (key, value) in entries {
        line.push_str(&format!(" {}={}", key, value));
    }

    line
}

/// Prints the messages of the hardening passes above a spinner that shows the running pass.
///
/// While a pass runs, its messages carry the name of the pass. Warnings are counted so that
/// the [`Hardener`](crate::Hardener) can report anomalies after the pipeline has finished.
pub struct Logger {
    bar: ProgressBar,
    running: bool,
    pass: Option<String>,
    warnings: Cell<usize>,
}

impl Logger {
    /// Create a logger with a (hidden until a title is set) spinner
    pub fn spinner() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{prefix:.magenta/red} {msg} {spinner}").unwrap().tick_strings(ANIMATION));
        bar.set_prefix("[obscura]");

        Self {
            bar,
            running: false,
            pass: None,
            warnings: Cell::new(0),
        }
    }

    pub(crate) fn set_prefix<S: Into<String>>(&mut self, pass: S) {
        self.pass = Some(pass.into());
    }

    pub(crate) fn clear_prefix(&mut self) {
        self.pass = None;
    }

    pub(crate) fn set_title(&mut self, title: impl Into<Cow<'static, str>>) {
        #[cfg(feature = "tui")]
        if !self.running {
            self.bar.enable_steady_tick(Duration::from_millis(100));
            self.running = true;
        }
        self.bar.set_message(title.into());
    }

    /// How many warnings were logged so far
    pub fn num_warnings(&self) -> usize {
        self.warnings.get()
    }

    fn emit<S: AsRef<str>>(&self, level: Level, msg: S) {
        if level == Level::Warning {
            self.warnings.set(self.warnings.get() + 1);
        }

        match &self.pass {
            Some(pass) => self.bar.println(format!("{} {} {}", level.tag(), format!("({})", pass).bold(), msg.as_ref())),
            None => self.bar.println(format!("{} {}", level.tag(), msg.as_ref())),
        }
    }

    /// Log a progress message
    pub fn info<S: AsRef<str>>(&self, msg: S) {
        self.emit(Level::Info, msg);
    }

    /// Log the statistics of a pass as `title: key=value ...`
    pub fn summary<V: Display>(&self, title: &str, entries: &[(&str, V)]) {
        self.emit(Level::Info, format_summary(title, entries));
    }

    /// Log an anomaly that does not stop the pipeline
    pub fn warning<S: AsRef<str>>(&self, msg: S) {
        self.emit(Level::Warning, msg);
    }

    /// Only printed in debug builds
    pub fn debug<S: AsRef<str>>(&self, _msg: S) {
        #[cfg(debug_assertions)]
        {
            self.emit(Level::Debug, _msg);
        }
    }

    #[allow(missing_docs)]
    pub fn error<S: AsRef<str>>(&self, msg: S) {
        self.emit(Level::Error, msg);
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if self.running {
            self.running = false;
            self.bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_format() {
        assert_eq!(format_summary("Decoy words", &[("rodata", 12u64), ("data", 0), ("bss", 3)]), "Decoy words: rodata=12 data=0 bss=3");
        assert_eq!(format_summary::<u64>("Nothing", &[]), "Nothing:");
    }

    #[test]
    fn test_warnings_are_counted() {
        let mut logger = Logger::spinner();
        logger.set_prefix("LayoutRandomizerPass");
        logger.info("info");
        logger.warning("first");
        logger.summary("Sizes", &[("data", 4u64)]);
        logger.warning("second");
        logger.error("error");
        logger.clear_prefix();

        assert_eq!(logger.num_warnings(), 2);
    }

    #[test]
    #[ignore]
    fn test_style() {
        let mut logger = Logger::spinner();
        logger.set_title("Hardening");
        logger.set_prefix("LayoutRandomizerPass");
        logger.info("info");
        logger.summary("Decoy words", &[("rodata", 12u64), ("data", 0), ("bss", 3)]);
        logger.warning("warning");
        logger.debug("debug");
        logger.error("error");

        std::thread::sleep(std::time::Duration::from_secs(5));
    }
}
