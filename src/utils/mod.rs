//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::CbtxError;
pub use print::{logger_init, me_prefix, ME};

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write_all, tcp_bind_with_retry,
    tcp_connect_with_retry,
};
