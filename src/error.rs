//! Error kinds surfaced across the heap, GC and scheduler.
//!
//! The scheduler and semaphore cannot fail, and the GC itself never
//! fails (it logs and continues) -- only the heap and the metadata layer it
//! leans on return `Result`. Fatal invariant violations never flow through
//! this type: they go through [`fatal!`] and abort the process.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PentagonError {
    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("range violation: {0}")]
    RangeViolation(String),
}

impl PentagonError {
    /// Out-of-resources and not-found are conditions a caller can retry or
    /// route around (e.g. by requesting a GC cycle); invalid-argument and
    /// range-violation indicate a caller bug.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PentagonError::OutOfResources(_) | PentagonError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, PentagonError>;

/// Print a trace and abort the core. Used for heap invariant violations and
/// shadow-frame mismatches -- these are bugs, not recoverable
/// errors, so there is no `Result` path for them.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!("fatal: {}", format!($($arg)*));
        eprintln!("pentagon: fatal: {}", format!($($arg)*));
        eprintln!("{:?}", std::backtrace::Backtrace::capture());
        std::process::abort();
    }};
}
