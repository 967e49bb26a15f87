//! Crate-wide error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use tokio::sync::mpsc;

/// Customized error type for cbtx.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CbtxError {
    /// Generic failure carrying the source error's string representation,
    /// e.g., storage backend or transport failures.
    Msg(String),

    /// Operation invoked on a transaction that has already been committed
    /// or aborted.
    TxnClosed,
}

impl CbtxError {
    pub fn msg(msg: impl ToString) -> Self {
        CbtxError::Msg(msg.to_string())
    }
}

impl fmt::Display for CbtxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CbtxError::Msg(msg) => write!(f, "{}", msg), // no literal quotes
            CbtxError::TxnClosed => write!(f, "transaction already closed"),
        }
    }
}

impl error::Error for CbtxError {}

// Errors from the libraries we call with `?` are kept as their display
// string; callers only ever log or compare them.
macro_rules! impl_from_error {
    ($($error:ty),+ $(,)?) => {$(
        impl From<$error> for CbtxError {
            fn from(e: $error) -> Self {
                CbtxError::Msg(e.to_string())
            }
        }
    )+};
}

impl_from_error!(
    io::Error,
    string::FromUtf8Error,
    num::ParseIntError,
    net::AddrParseError,
    rmp_serde::encode::Error,
    rmp_serde::decode::Error,
    toml::ser::Error,
    toml::de::Error,
    tokio::task::JoinError,
);

impl<T> From<mpsc::error::SendError<T>> for CbtxError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        CbtxError::Msg(e.to_string())
    }
}
