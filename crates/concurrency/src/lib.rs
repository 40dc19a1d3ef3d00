//! Transaction management: timestamp allocation, the active-transaction
//! table, and the commit protocol (WAL append before catalog visibility).

pub mod manager;
pub mod txn;

pub use manager::{TxnManager, TxnStats};
pub use txn::Txn;
