//! Thin wrappers around the `log` facade, gated on [`Config::verbose`].
//!
//! The crate never installs a logger itself -- a hosting binary wires up
//! `env_logger` or whatever subscriber it likes, the same way any library
//! built against `log` does. These macros exist only so call sites read the
//! way a plain `if verbose { log::debug!(...) }` would, without paying for
//! the `format!` unless the message would actually be emitted.

#[macro_export]
macro_rules! log_if {
    ($verbose:expr, $($arg:tt)*) => {
        if $verbose {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! logln_if {
    ($verbose:expr, $($arg:tt)*) => {
        if $verbose {
            log::debug!($($arg)*);
        }
    };
}
