use super::batch::{Batch, BatchStatus};
use super::submission::{Submission, SubmissionOutcome};
use super::transaction::{Transaction, TransactionStatus};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn store(&self, tx: Transaction) -> Result<()>;
    async fn get(&self, tx_id: Uuid) -> Result<Option<Transaction>>;
    /// Oldest first.
    async fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>>;
    async fn get_all(&self) -> Result<Vec<Transaction>>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn store(&self, batch: Batch) -> Result<()>;
    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>>;
    /// Oldest first.
    async fn list_by_status(&self, status: BatchStatus, limit: usize, offset: usize) -> Result<Vec<Batch>>;
    async fn get_all(&self) -> Result<Vec<Batch>>;
}

/// Hands priced batches to the ledger.
///
/// Called from a detached task, so implementations may take as long as the
/// network needs; the queue never waits on it while holding a bucket.
#[async_trait]
pub trait SubmissionGateway: Send + Sync {
    async fn submit(&self, submission: &Submission) -> SubmissionOutcome;
}

pub type TransactionStoreRef = Arc<dyn TransactionStore>;
pub type BatchStoreRef = Arc<dyn BatchStore>;
pub type SubmissionGatewayRef = Arc<dyn SubmissionGateway>;
pub type TransactionStoreFactory = Box<dyn Fn() -> TransactionStoreRef + Send + Sync>;
