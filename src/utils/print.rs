//! Logging helpers: a process-wide identity label prefixed onto every log
//! line, and macros mirroring the standard `log` levels.

use std::sync::RwLock;

use lazy_static::lazy_static;

lazy_static! {
    /// Label identifying this process in log output, e.g. "127.0.0.1:6001".
    /// Set once at startup by [`logger_init`].
    pub static ref ME: RwLock<String> = RwLock::new("-".into());
}

/// Installs `env_logger` and sets the [`ME`] label. Safe to call more than
/// once (e.g. from multiple `#[tokio::test]`s); later calls only update the
/// label.
pub fn logger_init(label: impl Into<String>) {
    *ME.write().unwrap() = label.into();
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init();
}

macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!("{} {}", *$crate::utils::ME.read().unwrap(), format!($($arg)*))
    };
}

macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!("{} {}", *$crate::utils::ME.read().unwrap(), format!($($arg)*))
    };
}

macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!("{} {}", *$crate::utils::ME.read().unwrap(), format!($($arg)*))
    };
}

macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!("{} {}", *$crate::utils::ME.read().unwrap(), format!($($arg)*))
    };
}

macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!("{} {}", *$crate::utils::ME.read().unwrap(), format!($($arg)*))
    };
}

/// Logs at error level and builds a [`RingVoteError`](crate::utils::RingVoteError)
/// in one expression, so call sites read
/// `return logged_err!("bad option index {}", idx);` without repeating the
/// message.
macro_rules! logged_err {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        pf_error!("{}", msg);
        Err($crate::utils::RingVoteError::msg(msg))
    }};
}
