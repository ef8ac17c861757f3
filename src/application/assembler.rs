use crate::config::BatchSettings;
use crate::domain::batch::Batch;
use crate::domain::fee::{Fee, FeeModel};
use crate::domain::ports::{BatchStoreRef, TransactionStoreRef};
use crate::domain::submission::Submission;
use crate::domain::transaction::{Priority, Transaction, TransactionStatus, TransactionType};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives priced, `processing` submissions from the assembler.
///
/// Called while the bucket is still locked, so implementations must hand the
/// work off (e.g. spawn it) rather than wait for the ledger.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, submission: Submission);
}

/// Per-priority state: the FIFO of queued ids and the open batch.
#[derive(Default)]
struct Bucket {
    queue: VecDeque<Uuid>,
    open: Option<Batch>,
}

enum Admission {
    Admitted,
    Deferred,
    Skipped,
}

/// Groups queued transactions into batches, one open batch per priority.
///
/// Each priority level has its own lock, so low, normal, high and critical
/// batches fill independently while admission, closure and cancellation
/// within one level are serialized.
pub struct BatchAssembler {
    buckets: [Mutex<Bucket>; 4],
    fees: Arc<FeeModel>,
    settings: BatchSettings,
    transactions: TransactionStoreRef,
    batches: BatchStoreRef,
}

impl BatchAssembler {
    /// Creates an assembler with empty buckets and no open batches.
    ///
    /// # Arguments
    ///
    /// * `fees` - Prices members when a batch closes.
    /// * `settings` - Capacity, minimum size, wait time and batch retry budget.
    /// * `transactions` - The store every member transition is written to.
    /// * `batches` - The store open, closed and aborted batches are written to.
    pub fn new(
        fees: Arc<FeeModel>,
        settings: BatchSettings,
        transactions: TransactionStoreRef,
        batches: BatchStoreRef,
    ) -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(Bucket::default())),
            fees,
            settings,
            transactions,
            batches,
        }
    }

    /// Appends a `queued` transaction to the back of its priority bucket.
    pub async fn push(&self, tx: &Transaction) {
        let mut bucket = self.bucket(tx.priority).lock().await;
        bucket.queue.push_back(tx.id);
    }

    /// Transactions waiting for admission across all priorities.
    pub async fn queued_len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.lock().await.queue.len();
        }
        total
    }

    /// Priorities that currently have an open batch.
    pub async fn open_batches(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            if bucket.lock().await.open.is_some() {
                total += 1;
            }
        }
        total
    }

    /// Admits every due transaction waiting in the `priority` bucket.
    ///
    /// Batches reaching capacity are closed and dispatched on the spot.
    /// Returns the number of transactions admitted.
    pub async fn drain(
        &self,
        priority: Priority,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
    ) -> Result<usize> {
        let mut bucket = self.bucket(priority).lock().await;
        let mut deferred = VecDeque::new();
        let mut admitted = 0;
        let mut outcome = Ok(());

        while let Some(id) = bucket.queue.pop_front() {
            match self
                .admit_one(&mut bucket, id, now, network_load, dispatcher)
                .await
            {
                Ok(Admission::Admitted) => admitted += 1,
                Ok(Admission::Deferred) => deferred.push_back(id),
                Ok(Admission::Skipped) => {}
                // The aborted closure already put `id` back.
                Err(err @ QueueError::BatchClosureFailed { .. }) => {
                    outcome = Err(err);
                    break;
                }
                Err(err) => {
                    bucket.queue.push_front(id);
                    outcome = Err(err);
                    break;
                }
            }
        }

        while let Some(id) = deferred.pop_back() {
            bucket.queue.push_front(id);
        }
        outcome.map(|_| admitted)
    }

    /// Closes open batches that have waited at least `max_wait`.
    pub async fn close_expired(
        &self,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
    ) -> Result<usize> {
        let max_wait = self.settings.max_wait();
        self.close_where(now, network_load, dispatcher, |batch| {
            batch.wait_elapsed(now, max_wait)
        })
        .await
    }

    /// Closes every open batch regardless of size or age.
    pub async fn flush(
        &self,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
    ) -> Result<usize> {
        self.close_where(now, network_load, dispatcher, |_| true).await
    }

    /// Cancels a transaction that has not reached submission yet.
    ///
    /// Runs under the bucket lock so a concurrent closure can neither admit
    /// the transaction after the cancellation nor submit it.
    pub async fn cancel(&self, tx_id: Uuid, now: DateTime<Utc>) -> Result<Transaction> {
        let priority = self
            .transactions
            .get(tx_id)
            .await?
            .ok_or(QueueError::TransactionNotFound(tx_id))?
            .priority;

        let mut bucket = self.bucket(priority).lock().await;
        let mut tx = self
            .transactions
            .get(tx_id)
            .await?
            .ok_or(QueueError::TransactionNotFound(tx_id))?;
        tx.cancel(now)?;

        let mut emptied = false;
        if let Some(batch) = bucket.open.as_mut()
            && batch.remove(tx_id)
        {
            if batch.is_empty() {
                emptied = true;
            } else {
                self.batches.store(batch.clone()).await?;
            }
        }
        if emptied && let Some(mut batch) = bucket.open.take() {
            batch.abort("All members cancelled", now);
            self.batches.store(batch).await?;
        }
        bucket.queue.retain(|id| *id != tx_id);

        self.transactions.store(tx.clone()).await?;
        info!(transaction_id = %tx_id, priority = %priority, "transaction cancelled");
        Ok(tx)
    }

    fn bucket(&self, priority: Priority) -> &Mutex<Bucket> {
        &self.buckets[priority.index()]
    }

    async fn close_where<F>(
        &self,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
        should_close: F,
    ) -> Result<usize>
    where
        F: Fn(&Batch) -> bool,
    {
        let mut closed = 0;
        let mut first_error = None;

        for priority in Priority::ALL {
            let mut bucket = self.bucket(priority).lock().await;
            if !bucket.open.as_ref().is_some_and(&should_close) {
                continue;
            }
            let Some(batch) = bucket.open.take() else {
                continue;
            };
            if !batch.meets_minimum() {
                debug!(
                    batch_id = %batch.id,
                    size = batch.transaction_count,
                    min = batch.min_transactions,
                    "closing batch below minimum size"
                );
            }
            match self
                .close(&mut bucket, batch, now, network_load, dispatcher)
                .await
            {
                Ok(()) => closed += 1,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(closed),
        }
    }

    async fn admit_one(
        &self,
        bucket: &mut Bucket,
        id: Uuid,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
    ) -> Result<Admission> {
        let Some(mut tx) = self.transactions.get(id).await? else {
            warn!(transaction_id = %id, "queued transaction missing from store");
            return Ok(Admission::Skipped);
        };
        if tx.status != TransactionStatus::Queued {
            debug!(transaction_id = %id, status = %tx.status, "skipping transaction no longer queued");
            return Ok(Admission::Skipped);
        }
        if tx.check_expiry(now) {
            self.transactions.store(tx).await?;
            info!(transaction_id = %id, "transaction expired before batching");
            return Ok(Admission::Skipped);
        }
        if !tx.is_due(now) {
            return Ok(Admission::Deferred);
        }
        if tx.transaction_type == TransactionType::WalletSetup {
            self.submit_singleton(bucket, tx, now, network_load, dispatcher)
                .await?;
            return Ok(Admission::Admitted);
        }

        let settings = &self.settings;
        let batch = bucket.open.get_or_insert_with(|| {
            Batch::open(
                tx.priority,
                settings.max_transactions,
                settings.min_transactions,
                settings.max_retries,
                now,
            )
        });
        tx.begin_batching(batch.id, now)?;
        self.transactions.store(tx).await?;
        batch.admit(id)?;
        self.batches.store(batch.clone()).await?;
        debug!(transaction_id = %id, batch_id = %batch.id, size = batch.transaction_count, "transaction admitted");

        if batch.is_full()
            && let Some(full) = bucket.open.take()
        {
            self.close(bucket, full, now, network_load, dispatcher)
                .await?;
        }
        Ok(Admission::Admitted)
    }

    /// Prices a closed batch and hands it off.
    ///
    /// Any failure once the batch has left the bucket aborts the whole
    /// closure: see [`BatchAssembler::abort_closure`].
    async fn close(
        &self,
        bucket: &mut Bucket,
        mut batch: Batch,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
    ) -> Result<()> {
        let order = batch.transaction_ids.clone();
        let mut snapshots = Vec::with_capacity(order.len());
        match self
            .try_close(&mut batch, &mut snapshots, now, network_load, dispatcher)
            .await
        {
            Ok(()) => Ok(()),
            Err(source) => Err(self
                .abort_closure(bucket, batch, &order, &snapshots, source, now)
                .await),
        }
    }

    /// Members are recorded in `snapshots` as read, before any fee is applied.
    async fn try_close(
        &self,
        batch: &mut Batch,
        snapshots: &mut Vec<Transaction>,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
    ) -> Result<()> {
        batch.begin_closing(now)?;

        for id in batch.transaction_ids.clone() {
            match self.transactions.get(id).await? {
                Some(mut tx) if tx.status == TransactionStatus::Batching => {
                    if tx.check_expiry(now) {
                        info!(transaction_id = %id, batch_id = %batch.id, "member expired while batching");
                        self.transactions.store(tx).await?;
                        batch.remove(id);
                    } else {
                        snapshots.push(tx);
                    }
                }
                _ => {
                    batch.remove(id);
                }
            }
        }

        if snapshots.is_empty() {
            batch.abort("No eligible members at closure", now);
            self.batches.store(batch.clone()).await?;
            return Ok(());
        }

        let fees = self.price(&snapshots[..], network_load)?;
        let mut members = snapshots.clone();
        let total_fee: Fee = fees.iter().map(|(individual, _)| *individual).sum();
        let optimized_fee: Fee = fees.iter().map(|(_, optimized)| *optimized).sum();
        for (tx, (individual, optimized)) in members.iter_mut().zip(&fees) {
            tx.mark_batched(*individual, *optimized, now)?;
        }
        batch.apply_pricing(total_fee, optimized_fee)?;

        info!(
            batch_id = %batch.id,
            priority = %batch.priority,
            size = batch.transaction_count,
            total_fee = %batch.total_fee,
            optimized_fee = %batch.optimized_fee,
            savings = %batch.fee_savings,
            "batch closed"
        );
        self.hand_off(batch, members, now, dispatcher).await
    }

    async fn submit_singleton(
        &self,
        bucket: &mut Bucket,
        tx: Transaction,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
    ) -> Result<()> {
        let mut batch = Batch::singleton(tx.priority, tx.id, self.settings.max_retries, now);
        let order = [tx.id];
        let snapshot = [tx.clone()];
        match self
            .try_singleton(&mut batch, tx, now, network_load, dispatcher)
            .await
        {
            Ok(()) => Ok(()),
            Err(source) => Err(self
                .abort_closure(bucket, batch, &order, &snapshot, source, now)
                .await),
        }
    }

    async fn try_singleton(
        &self,
        batch: &mut Batch,
        mut tx: Transaction,
        now: DateTime<Utc>,
        network_load: Decimal,
        dispatcher: &dyn Dispatch,
    ) -> Result<()> {
        let fee = self.fees.transaction_fee(&tx, network_load)?;
        tx.assign_singleton(batch.id, fee, now)?;
        batch.closed_at = Some(now);
        batch.apply_pricing(fee, fee)?;
        debug!(transaction_id = %tx.id, batch_id = %batch.id, fee = %fee, "singleton priced");
        self.hand_off(batch, vec![tx], now, dispatcher).await
    }

    async fn hand_off(
        &self,
        batch: &mut Batch,
        mut members: Vec<Transaction>,
        now: DateTime<Utc>,
        dispatcher: &dyn Dispatch,
    ) -> Result<()> {
        batch.mark_processing(now)?;
        for tx in members.iter_mut() {
            tx.mark_processing(now)?;
            self.transactions.store(tx.clone()).await?;
        }
        self.batches.store(batch.clone()).await?;

        dispatcher
            .dispatch(Submission {
                batch: batch.clone(),
                transactions: members,
            })
            .await;
        Ok(())
    }

    /// Undoes a closure that failed before dispatch.
    ///
    /// Every member still owned by the batch is restored from its pre-pricing
    /// snapshot (or reloaded, if closure never got to read it) as `queued`
    /// and put back at the front of the bucket in its original order. Members
    /// that expired or were cancelled meanwhile stay where they are. The batch
    /// is stored as `failed`.
    async fn abort_closure(
        &self,
        bucket: &mut Bucket,
        mut batch: Batch,
        order: &[Uuid],
        snapshots: &[Transaction],
        source: QueueError,
        now: DateTime<Utc>,
    ) -> QueueError {
        for id in order.iter().rev() {
            let current = match snapshots.iter().find(|tx| tx.id == *id) {
                Some(tx) => Ok(Some(tx.clone())),
                None => self.transactions.get(*id).await,
            };
            match current {
                Ok(Some(tx))
                    if matches!(
                        tx.status,
                        TransactionStatus::Batching | TransactionStatus::Queued
                    ) =>
                {
                    if let Err(err) = self.requeue_member(tx, now).await {
                        error!(transaction_id = %id, error = %err, "failed to restore member of aborted batch");
                    }
                    bucket.queue.push_front(*id);
                }
                Ok(_) => {}
                Err(err) => {
                    error!(transaction_id = %id, error = %err, "failed to reload member of aborted batch");
                    bucket.queue.push_front(*id);
                }
            }
        }

        batch.abort(source.to_string(), now);
        if let Err(err) = self.batches.store(batch.clone()).await {
            error!(batch_id = %batch.id, error = %err, "failed to record aborted batch");
        }
        error!(batch_id = %batch.id, error = %source, "batch closure aborted, members re-queued");
        QueueError::BatchClosureFailed {
            batch_id: batch.id,
            source: Box::new(source),
        }
    }

    async fn requeue_member(&self, mut tx: Transaction, now: DateTime<Utc>) -> Result<()> {
        if tx.status == TransactionStatus::Batching {
            tx.revert_to_queued(now)?;
        }
        self.transactions.store(tx).await
    }

    /// Individual and optimized fee per member; nothing is committed here.
    fn price(&self, members: &[Transaction], network_load: Decimal) -> Result<Vec<(Fee, Fee)>> {
        let size = members.len();
        members
            .iter()
            .map(|tx| {
                let individual = self.fees.transaction_fee(tx, network_load)?;
                let optimized = self
                    .fees
                    .batch_optimized_fee(individual, size, tx.priority)?;
                Ok((individual, optimized))
            })
            .collect()
    }
}
