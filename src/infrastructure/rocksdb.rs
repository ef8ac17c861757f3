use crate::domain::batch::{Batch, BatchStatus};
use crate::domain::ports::{BatchStore, TransactionStore};
use crate::domain::transaction::{Transaction, TransactionStatus};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Column Family for storing transaction records.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for storing batch records.
pub const CF_BATCHES: &str = "batches";

/// A persistent store implementation using RocksDB.
///
/// Handles storage for both `Transaction` and `Batch` records using separate
/// Column Families, keyed by the record's UUID bytes with JSON values.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families ("transactions" and "batches") exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_transactions = ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Options::default());
        let cf_batches = ColumnFamilyDescriptor::new(CF_BATCHES, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_transactions, cf_batches])?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(&self, cf_name: &str, id: Uuid, record: &T) -> Result<()> {
        let cf = self.handle(cf_name)?;
        let value = serde_json::to_vec(record).map_err(|e| {
            QueueError::InternalError(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Serialization error: {}", e),
            )))
        })?;
        self.db.put_cf(&cf, id.as_bytes(), value)?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, cf_name: &str, id: Uuid) -> Result<Option<T>> {
        let cf = self.handle(cf_name)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.handle(cf_name)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = item.map_err(|e| {
                QueueError::InternalError(Box::new(std::io::Error::other(format!(
                    "RocksDB iteration error: {}",
                    e
                ))))
            })?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    fn handle(&self, cf_name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(cf_name).ok_or_else(|| {
            QueueError::InternalError(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                cf_name
            ))))
        })
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        QueueError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Deserialization error: {}", e),
        )))
    })
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn store(&self, tx: Transaction) -> Result<()> {
        self.put(CF_TRANSACTIONS, tx.id, &tx)
    }

    async fn get(&self, tx_id: Uuid) -> Result<Option<Transaction>> {
        self.fetch(CF_TRANSACTIONS, tx_id)
    }

    async fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        let mut matching: Vec<Transaction> = self
            .scan::<Transaction>(CF_TRANSACTIONS)?
            .into_iter()
            .filter(|tx| tx.status == status)
            .collect();
        matching.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_all(&self) -> Result<Vec<Transaction>> {
        let mut all: Vec<Transaction> = self.scan(CF_TRANSACTIONS)?;
        all.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(all)
    }
}

#[async_trait]
impl BatchStore for RocksDBStore {
    async fn store(&self, batch: Batch) -> Result<()> {
        self.put(CF_BATCHES, batch.id, &batch)
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        self.fetch(CF_BATCHES, batch_id)
    }

    async fn list_by_status(&self, status: BatchStatus, limit: usize, offset: usize) -> Result<Vec<Batch>> {
        let mut matching: Vec<Batch> = self
            .scan::<Batch>(CF_BATCHES)?
            .into_iter()
            .filter(|batch| batch.status == status)
            .collect();
        matching.sort_by_key(|batch| (batch.opened_at, batch.id));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_all(&self) -> Result<Vec<Batch>> {
        let mut all: Vec<Batch> = self.scan(CF_BATCHES)?;
        all.sort_by_key(|batch| (batch.opened_at, batch.id));
        Ok(all)
    }
}
