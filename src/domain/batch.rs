use crate::domain::fee::Fee;
use crate::domain::transaction::Priority;
use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Open and admitting transactions.
    Pending,
    /// Closed, being priced.
    Batching,
    Batched,
    Processing,
    Submitted,
    Confirmed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Batching => "batching",
            BatchStatus::Batched => "batched",
            BatchStatus::Processing => "processing",
            BatchStatus::Submitted => "submitted",
            BatchStatus::Confirmed => "confirmed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Submitted | BatchStatus::Confirmed | BatchStatus::Failed
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    /// Shared submission window for batchable transactions.
    Pooled,
    /// A batch of one for transactions that must submit alone.
    Singleton,
}

/// A group of transactions priced and submitted together.
///
/// The batch owns the ordered list of member ids; members only point back to
/// it by id. Outcome counters stay at zero until the batch reaches a terminal
/// status.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub kind: BatchKind,
    pub status: BatchStatus,
    pub priority: Priority,
    pub max_transactions: usize,
    pub min_transactions: usize,
    pub transaction_ids: Vec<Uuid>,
    pub transaction_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Sum of member fees before optimization.
    pub total_fee: Fee,
    pub optimized_fee: Fee,
    pub fee_savings: Fee,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn open(
        priority: Priority,
        max_transactions: usize,
        min_transactions: usize,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: BatchKind::Pooled,
            status: BatchStatus::Pending,
            priority,
            max_transactions,
            min_transactions,
            transaction_ids: Vec::with_capacity(max_transactions),
            transaction_count: 0,
            success_count: 0,
            failure_count: 0,
            total_fee: Fee::ZERO,
            optimized_fee: Fee::ZERO,
            fee_savings: Fee::ZERO,
            retry_count: 0,
            max_retries,
            last_error: None,
            opened_at: now,
            closed_at: None,
            submitted_at: None,
            completed_at: None,
        }
    }

    pub fn singleton(priority: Priority, transaction_id: Uuid, max_retries: u32, now: DateTime<Utc>) -> Self {
        let mut batch = Self::open(priority, 1, 1, max_retries, now);
        batch.kind = BatchKind::Singleton;
        batch.transaction_ids.push(transaction_id);
        batch.transaction_count = 1;
        batch
    }

    pub fn is_open(&self) -> bool {
        self.status == BatchStatus::Pending
    }

    pub fn is_full(&self) -> bool {
        self.transaction_count >= self.max_transactions
    }

    pub fn is_empty(&self) -> bool {
        self.transaction_count == 0
    }

    pub fn meets_minimum(&self) -> bool {
        self.transaction_count >= self.min_transactions
    }

    pub fn contains(&self, transaction_id: Uuid) -> bool {
        self.transaction_ids.contains(&transaction_id)
    }

    /// True once `max_wait` has passed since the batch opened.
    pub fn wait_elapsed(&self, now: DateTime<Utc>, max_wait: Duration) -> bool {
        match (now - self.opened_at).to_std() {
            Ok(waited) => waited >= max_wait,
            Err(_) => false,
        }
    }

    pub fn admit(&mut self, transaction_id: Uuid) -> Result<()> {
        if !self.is_open() || self.is_full() {
            return Err(QueueError::InvalidTransition {
                entity: "batch",
                from: self.status.to_string(),
                to: "admit".to_string(),
            });
        }
        self.transaction_ids.push(transaction_id);
        self.transaction_count = self.transaction_ids.len();
        Ok(())
    }

    /// Drops a member while the batch is still open or closing.
    pub fn remove(&mut self, transaction_id: Uuid) -> bool {
        let before = self.transaction_ids.len();
        self.transaction_ids.retain(|id| *id != transaction_id);
        self.transaction_count = self.transaction_ids.len();
        before != self.transaction_count
    }

    pub fn begin_closing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(BatchStatus::Batching)?;
        self.closed_at = Some(now);
        Ok(())
    }

    /// Records the priced totals; savings never go negative.
    pub fn apply_pricing(&mut self, total_fee: Fee, optimized_fee: Fee) -> Result<()> {
        self.transition(BatchStatus::Batched)?;
        self.total_fee = total_fee;
        self.optimized_fee = optimized_fee;
        self.fee_savings = total_fee.saturating_sub(optimized_fee);
        Ok(())
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(BatchStatus::Processing)?;
        self.submitted_at = Some(now);
        Ok(())
    }

    /// Whole-batch resubmission after a submission call failure.
    ///
    /// Returns `false` once the batch has used its own retry budget.
    pub fn increment_retry(&mut self, error: impl Into<String>) -> bool {
        self.last_error = Some(error.into());
        if self.retry_count >= self.max_retries {
            return false;
        }
        self.retry_count += 1;
        true
    }

    /// Settles the batch once every member outcome is known.
    pub fn record_outcome(&mut self, success_count: usize, failure_count: usize, now: DateTime<Utc>) -> Result<()> {
        let status = if success_count == 0 && failure_count > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Submitted
        };
        self.transition(status)?;
        self.success_count = success_count;
        self.failure_count = failure_count;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_confirmed(&mut self) -> Result<()> {
        self.transition(BatchStatus::Confirmed)
    }

    /// Abandons a batch that never reached submission.
    pub fn abort(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = BatchStatus::Failed;
        self.last_error = Some(error.into());
        self.completed_at = Some(now);
    }

    fn transition(&mut self, to: BatchStatus) -> Result<()> {
        use BatchStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Pending, Batching)
                | (Batching, Batched)
                | (Pending, Batched)
                | (Batched, Processing)
                | (Processing, Submitted)
                | (Processing, Failed)
                | (Submitted, Confirmed)
        );
        if !allowed {
            return Err(QueueError::InvalidTransition {
                entity: "batch",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_batch() -> Batch {
        Batch::open(Priority::Normal, 3, 2, 3, Utc::now())
    }

    #[test]
    fn test_admit_until_full() {
        let mut batch = open_batch();
        for _ in 0..3 {
            batch.admit(Uuid::new_v4()).unwrap();
        }
        assert!(batch.is_full());
        assert_eq!(batch.transaction_count, 3);
        assert!(batch.admit(Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_no_admission_after_closure() {
        let mut batch = open_batch();
        batch.admit(Uuid::new_v4()).unwrap();
        batch.begin_closing(Utc::now()).unwrap();
        assert!(batch.admit(Uuid::new_v4()).is_err());
        assert!(batch.begin_closing(Utc::now()).is_err());
    }

    #[test]
    fn test_minimum_size() {
        let mut batch = open_batch();
        batch.admit(Uuid::new_v4()).unwrap();
        assert!(!batch.meets_minimum());
        batch.admit(Uuid::new_v4()).unwrap();
        assert!(batch.meets_minimum());
    }

    #[test]
    fn test_wait_elapsed() {
        let opened = Utc::now();
        let batch = Batch::open(Priority::Low, 10, 2, 3, opened);
        let max_wait = Duration::from_secs(30);
        assert!(!batch.wait_elapsed(opened + chrono::Duration::seconds(29), max_wait));
        assert!(batch.wait_elapsed(opened + chrono::Duration::seconds(30), max_wait));
        assert!(!batch.wait_elapsed(opened - chrono::Duration::seconds(1), max_wait));
    }

    #[test]
    fn test_fee_savings_never_negative() {
        let mut batch = open_batch();
        batch.admit(Uuid::new_v4()).unwrap();
        batch.begin_closing(Utc::now()).unwrap();
        batch
            .apply_pricing(Fee::new(dec!(10)), Fee::new(dec!(12)))
            .unwrap();
        assert_eq!(batch.fee_savings, Fee::ZERO);

        let mut batch = open_batch();
        batch.begin_closing(Utc::now()).unwrap();
        batch
            .apply_pricing(Fee::new(dec!(130)), Fee::new(dec!(120)))
            .unwrap();
        assert_eq!(batch.fee_savings, Fee::new(dec!(10)));
    }

    #[test]
    fn test_counters_only_set_on_terminal_status() {
        let now = Utc::now();
        let mut batch = open_batch();
        batch.admit(Uuid::new_v4()).unwrap();
        batch.admit(Uuid::new_v4()).unwrap();
        batch.begin_closing(now).unwrap();
        batch.apply_pricing(Fee::new(dec!(20)), Fee::new(dec!(20))).unwrap();
        batch.mark_processing(now).unwrap();
        assert_eq!(batch.success_count + batch.failure_count, 0);

        batch.record_outcome(1, 1, now).unwrap();
        assert_eq!(batch.status, BatchStatus::Submitted);
        assert_eq!(
            batch.transaction_count,
            batch.success_count + batch.failure_count
        );
    }

    #[test]
    fn test_all_failures_fail_the_batch() {
        let now = Utc::now();
        let mut batch = Batch::singleton(Priority::High, Uuid::new_v4(), 3, now);
        batch.apply_pricing(Fee::new(dec!(23)), Fee::new(dec!(23))).unwrap();
        batch.mark_processing(now).unwrap();
        batch.record_outcome(0, 1, now).unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
    }

    #[test]
    fn test_batch_retry_budget() {
        let mut batch = Batch::open(Priority::Normal, 10, 2, 2, Utc::now());
        assert!(batch.increment_retry("connection reset"));
        assert!(batch.increment_retry("connection reset"));
        assert!(!batch.increment_retry("connection reset"));
        assert_eq!(batch.retry_count, 2);
        assert_eq!(batch.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_remove_member() {
        let mut batch = open_batch();
        let id = Uuid::new_v4();
        batch.admit(id).unwrap();
        assert!(batch.remove(id));
        assert!(!batch.remove(id));
        assert!(batch.is_empty());
    }
}
