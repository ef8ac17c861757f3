use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Fee {fee} outside allowed range [{min}, {max}]")]
    FeeOutOfRange {
        fee: Decimal,
        min: Decimal,
        max: Decimal,
    },
    #[error("Closing batch {batch_id} failed: {source}")]
    BatchClosureFailed {
        batch_id: Uuid,
        #[source]
        source: Box<QueueError>,
    },
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
    #[error("Transaction {0} not found")]
    TransactionNotFound(Uuid),
    #[error("Batch {0} not found")]
    BatchNotFound(Uuid),
    #[error("Cannot move {entity} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
