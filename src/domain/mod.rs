//! Domain model: fee pricing, transaction and batch records, and the ports the
//! queue talks to storage and the ledger through.

pub mod batch;
pub mod fee;
pub mod ports;
pub mod submission;
pub mod transaction;
