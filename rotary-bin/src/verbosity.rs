//! `-v`/`-q` flags controlling how much rotary logs.
//!
//! By default only warnings and errors are shown.
//! - `-q` shows errors only
//! - `-v` shows info, e.g. pool refreshes
//! - `-vv` shows debug, e.g. every admission and outcome
//! - `-vvv` shows trace

use log::LevelFilter;

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Verbosity {
    /// Pass many times for more log output
    #[arg(
        long,
        short = 'v',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "quiet",
    )]
    verbose: u8,

    /// Only log errors
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    quiet: bool,
}

impl Verbosity {
    /// Get the log level filter.
    pub(crate) const fn log_level_filter(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Error;
        }
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}
