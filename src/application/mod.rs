//! Application layer orchestrating the queue.
//!
//! `SettlementEngine` is the entry point. It owns the `BatchAssembler`, which
//! groups queued transactions per priority, and the `RetryController`, which
//! decides what happens to failed members after a submission.

pub mod assembler;
pub mod engine;
pub mod retry;
