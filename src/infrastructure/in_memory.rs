use crate::domain::batch::{Batch, BatchStatus};
use crate::domain::ports::{BatchStore, TransactionStore};
use crate::domain::transaction::{Transaction, TransactionStatus};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A thread-safe in-memory store for transactions.
///
/// Uses `Arc<RwLock<HashMap<Uuid, Transaction>>>` to allow shared concurrent access.
/// Ideal for testing or single-process runs where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<Uuid, Transaction>>>,
}

impl InMemoryTransactionStore {
    /// Creates a new, empty in-memory transaction store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn store(&self, tx: Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn get(&self, tx_id: Uuid) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(&tx_id).cloned())
    }

    async fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        let mut matching: Vec<Transaction> = transactions
            .values()
            .filter(|tx| tx.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_all(&self) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        let mut all: Vec<Transaction> = transactions.values().cloned().collect();
        all.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(all)
    }
}

/// A thread-safe in-memory store for batches.
#[derive(Default, Clone)]
pub struct InMemoryBatchStore {
    batches: Arc<RwLock<HashMap<Uuid, Batch>>>,
}

impl InMemoryBatchStore {
    /// Creates a new, empty in-memory batch store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn store(&self, batch: Batch) -> Result<()> {
        let mut batches = self.batches.write().await;
        batches.insert(batch.id, batch);
        Ok(())
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let batches = self.batches.read().await;
        Ok(batches.get(&batch_id).cloned())
    }

    async fn list_by_status(&self, status: BatchStatus, limit: usize, offset: usize) -> Result<Vec<Batch>> {
        let batches = self.batches.read().await;
        let mut matching: Vec<Batch> = batches
            .values()
            .filter(|batch| batch.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|batch| (batch.opened_at, batch.id));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_all(&self) -> Result<Vec<Batch>> {
        let batches = self.batches.read().await;
        let mut all: Vec<Batch> = batches.values().cloned().collect();
        all.sort_by_key(|batch| (batch.opened_at, batch.id));
        Ok(all)
    }
}
