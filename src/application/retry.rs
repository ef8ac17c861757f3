use crate::domain::fee::FeeModel;
use crate::domain::ports::TransactionStoreRef;
use crate::domain::transaction::{Transaction, TransactionStatus};
use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to a transaction after a reported failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back in `queued` with an escalated fee; the caller re-enqueues it.
    Requeued(Transaction),
    /// Retry budget used up; the transaction stays `failed`.
    Exhausted(Transaction),
    /// Non-recoverable failure; the transaction stays `failed`.
    Failed(Transaction),
    /// The same failure was already handled.
    Duplicate,
}

/// Decides whether failed transactions get another attempt and at what fee.
///
/// A failure counts only while the stored transaction is still `processing`
/// at the reported retry count, so a re-delivered outcome never consumes a
/// second retry. Failures being handled right now are claimed by
/// `(transaction id, retry count)` and released once the outcome is stored.
pub struct RetryController {
    fees: Arc<FeeModel>,
    transactions: TransactionStoreRef,
    in_progress: Mutex<HashSet<(Uuid, u32)>>,
}

impl RetryController {
    pub fn new(fees: Arc<FeeModel>, transactions: TransactionStoreRef) -> Self {
        Self {
            fees,
            transactions,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Only `failed` transactions with budget left are retryable.
    pub fn can_retry(tx: &Transaction) -> bool {
        tx.status == TransactionStatus::Failed && tx.retry_count < tx.max_retries
    }

    /// Records a failed submission of `tx` and decides whether it gets
    /// another attempt.
    ///
    /// # Arguments
    ///
    /// * `tx` - The transaction as it was handed to the gateway.
    /// * `failure` - What the gateway reported, usually
    ///   [`QueueError::SubmissionFailed`]; its message becomes `last_error`.
    /// * `recoverable` - Whether the failure may succeed on a later attempt.
    /// * `network_load` - Used to price the retry when no original fee is known.
    /// * `now` - Timestamp for every transition.
    pub async fn handle_failure(
        &self,
        tx: Transaction,
        failure: &QueueError,
        recoverable: bool,
        network_load: Decimal,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        let key = (tx.id, tx.retry_count);
        if !self.in_progress.lock().await.insert(key) {
            debug!(transaction_id = %tx.id, retry_count = tx.retry_count, "failure already being handled");
            return Ok(RetryDecision::Duplicate);
        }
        let decision = self
            .decide(tx, failure, recoverable, network_load, now)
            .await;
        self.in_progress.lock().await.remove(&key);
        decision
    }

    async fn decide(
        &self,
        mut tx: Transaction,
        failure: &QueueError,
        recoverable: bool,
        network_load: Decimal,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        let in_flight = self.transactions.get(tx.id).await?.is_some_and(|stored| {
            stored.status == TransactionStatus::Processing && stored.retry_count == tx.retry_count
        });
        if !in_flight {
            debug!(transaction_id = %tx.id, retry_count = tx.retry_count, "failure already handled");
            return Ok(RetryDecision::Duplicate);
        }

        tx.fail(failure.to_string(), now)?;
        if !recoverable {
            warn!(transaction_id = %tx.id, error = %failure, "non-recoverable failure");
            return self.settle_failed(tx).await.map(RetryDecision::Failed);
        }
        if !Self::can_retry(&tx) {
            tx.last_error = Some(
                QueueError::RetryExhausted {
                    attempts: tx.retry_count,
                    last_error: failure.to_string(),
                }
                .to_string(),
            );
            warn!(transaction_id = %tx.id, attempts = tx.retry_count, "retries exhausted");
            return self.settle_failed(tx).await.map(RetryDecision::Exhausted);
        }

        let attempt = tx.retry_count + 1;
        let fee = match self
            .fees
            .retry_fee(tx.original_fee.or(tx.fee), attempt, &tx, network_load)
        {
            Ok(fee) => fee,
            Err(err) => {
                warn!(transaction_id = %tx.id, error = %err, "retry fee rejected");
                tx.last_error = Some(err.to_string());
                return self.settle_failed(tx).await.map(RetryDecision::Failed);
            }
        };

        tx.increment_retry(now)?;
        if tx.status == TransactionStatus::Failed {
            warn!(transaction_id = %tx.id, attempts = tx.retry_count, "retries exhausted");
            return self.settle_failed(tx).await.map(RetryDecision::Exhausted);
        }

        tx.fee = Some(fee);
        tx.mark_queued(now)?;
        self.transactions.store(tx.clone()).await?;
        info!(
            transaction_id = %tx.id,
            attempt = tx.retry_count,
            fee = %fee,
            error = %failure,
            "retry scheduled"
        );
        Ok(RetryDecision::Requeued(tx))
    }

    async fn settle_failed(&self, tx: Transaction) -> Result<Transaction> {
        self.transactions.store(tx.clone()).await?;
        Ok(tx)
    }
}
