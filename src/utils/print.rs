//! Logging macros that prefix every line with the process identity.

use std::sync::OnceLock;

use env_logger::Env;

/// Identity of this process (e.g., a replica address), printed in front of
/// every log line. Set once by `logger_init()`.
pub static ME: OnceLock<String> = OnceLock::new();

/// Returns the logging prefix, or `-` before `logger_init()` ran.
#[doc(hidden)]
pub fn me_prefix() -> &'static str {
    ME.get().map_or("-", |me| me.as_str())
}

/// Log a message at `$lvl` with the parenthesized identity prefix. The
/// per-level `pf_*!` macros below expand to this.
///
/// Example:
/// ```no_compile
/// pf_log!(log::Level::Info, "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_log {
    ($lvl:expr, $($fmt_args:tt)*) => {
        log::log!(
            $lvl,
            "({}) {}",
            $crate::utils::me_prefix(),
            format_args!($($fmt_args)*)
        )
    };
}

#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Trace, $($fmt_args)*) };
}

#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Debug, $($fmt_args)*) };
}

#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Info, $($fmt_args)*) };
}

#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Warn, $($fmt_args)*) };
}

#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => { $crate::pf_log!(log::Level::Error, $($fmt_args)*) };
}

/// Records `me` as this process's logging identity and installs
/// `env_logger`, filtered by the `CBTX_LOG` variable (default `info`). Only
/// the first call has any effect.
pub fn logger_init(me: impl ToString) {
    if ME.set(me.to_string()).is_err() {
        return;
    }
    let env = Env::new().filter_or("CBTX_LOG", "info");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .try_init();
}

/// `pf_error!` the message, then evaluate to `Err(CbtxError)` carrying it.
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::CbtxError::msg(format!($($fmt_args)*)))
        }
    };
}
