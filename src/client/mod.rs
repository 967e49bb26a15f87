//! Client side: logical clock and transactions.

mod clock;
mod transaction;

pub use clock::LogicalClock;
pub use transaction::Transaction;
