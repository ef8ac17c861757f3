use crate::application::assembler::{BatchAssembler, Dispatch};
use crate::application::retry::{RetryController, RetryDecision};
use crate::config::QueueConfig;
use crate::domain::batch::{Batch, BatchStatus};
use crate::domain::fee::{Fee, FeeModel};
use crate::domain::ports::{BatchStoreRef, SubmissionGatewayRef, TransactionStoreRef};
use crate::domain::submission::{Submission, SubmissionOutcome, SubmissionResult};
use crate::domain::transaction::{EnqueueRequest, Priority, Transaction, TransactionStatus};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_transactions: usize,
    pub transactions_by_status: BTreeMap<TransactionStatus, usize>,
    pub total_batches: usize,
    pub batches_by_status: BTreeMap<BatchStatus, usize>,
    pub open_batches: usize,
    pub waiting_in_queue: usize,
    pub total_fee_savings: Fee,
    /// Mean milliseconds from creation to submission over submitted or
    /// confirmed transactions.
    pub average_processing_ms: Option<i64>,
}

impl QueueStats {
    pub fn transactions_in(&self, status: TransactionStatus) -> usize {
        self.transactions_by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn batches_in(&self, status: BatchStatus) -> usize {
        self.batches_by_status.get(&status).copied().unwrap_or(0)
    }
}

/// The settlement queue: intake, batching, submission and retry.
///
/// Cheap to clone; every clone drives the same queue. Submissions run on
/// detached tasks, so callers that need every outcome recorded should
/// `settle` (or `drain_until_idle`) before reading results.
#[derive(Clone)]
pub struct SettlementEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<QueueConfig>,
    assembler: BatchAssembler,
    retry: RetryController,
    gateway: SubmissionGatewayRef,
    transactions: TransactionStoreRef,
    batches: BatchStoreRef,
    network_load: RwLock<Decimal>,
    in_flight: Mutex<JoinSet<()>>,
    wake: Notify,
}

impl SettlementEngine {
    /// Creates a new `SettlementEngine` with an idle network and no workers.
    ///
    /// Call [`SettlementEngine::start`] for background batching, or drive the
    /// queue by hand with `process_queued`, `flush_batches` and `settle`.
    ///
    /// # Arguments
    ///
    /// * `config` - Fee schedule, batching limits and retry policy.
    /// * `transactions` - The store for transaction records.
    /// * `batches` - The store for batch records.
    /// * `gateway` - Where closed batches are submitted.
    pub fn new(
        config: QueueConfig,
        transactions: TransactionStoreRef,
        batches: BatchStoreRef,
        gateway: SubmissionGatewayRef,
    ) -> Self {
        let config = Arc::new(config);
        let fees = Arc::new(FeeModel::new(config.fees.clone()));
        let assembler = BatchAssembler::new(
            fees.clone(),
            config.batching.clone(),
            transactions.clone(),
            batches.clone(),
        );
        let retry = RetryController::new(fees, transactions.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                assembler,
                retry,
                gateway,
                transactions,
                batches,
                network_load: RwLock::new(Decimal::ZERO),
                in_flight: Mutex::new(JoinSet::new()),
                wake: Notify::new(),
            }),
        }
    }

    /// Validates and queues a new transaction.
    ///
    /// The record is persisted as `pending` first and returned in `queued`
    /// status once it is waiting in its priority bucket.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Transaction> {
        request.validate_currency(&self.inner.config.supported_currencies)?;
        let now = Utc::now();
        let mut tx = Transaction::new(request, self.inner.config.retry.max_retries, now)?;
        self.inner.transactions.store(tx.clone()).await?;

        tx.mark_queued(now)?;
        self.inner.transactions.store(tx.clone()).await?;
        self.inner.assembler.push(&tx).await;
        self.inner.wake.notify_one();

        info!(
            transaction_id = %tx.id,
            transaction_type = %tx.transaction_type,
            priority = %tx.priority,
            amount = %tx.amount,
            currency = %tx.currency,
            "transaction queued"
        );
        Ok(tx)
    }

    /// Fetches a transaction by id.
    ///
    /// Fails with `TransactionNotFound` for an unknown id.
    pub async fn get_transaction(&self, id: Uuid) -> Result<Transaction> {
        self.inner
            .transactions
            .get(id)
            .await?
            .ok_or(QueueError::TransactionNotFound(id))
    }

    /// One page of transactions in `status`, oldest first.
    ///
    /// # Arguments
    ///
    /// * `status` - The status to filter on.
    /// * `limit` - Maximum number of records returned.
    /// * `offset` - Number of matching records to skip.
    pub async fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        self.inner
            .transactions
            .list_by_status(status, limit, offset)
            .await
    }

    /// Every transaction ever enqueued, oldest first.
    pub async fn all_transactions(&self) -> Result<Vec<Transaction>> {
        self.inner.transactions.get_all().await
    }

    /// Fetches a batch by id, failing with `BatchNotFound` when unknown.
    pub async fn get_batch(&self, id: Uuid) -> Result<Batch> {
        self.inner
            .batches
            .get(id)
            .await?
            .ok_or(QueueError::BatchNotFound(id))
    }

    /// One page of batches in `status`, oldest first.
    pub async fn list_batches_by_status(
        &self,
        status: BatchStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Batch>> {
        self.inner.batches.list_by_status(status, limit, offset).await
    }

    /// Counts by status, queue depth and realised fee savings.
    ///
    /// Savings only count batches that reached the ledger (`submitted` or
    /// `confirmed`).
    pub async fn get_stats(&self) -> Result<QueueStats> {
        let transactions = self.inner.transactions.get_all().await?;
        let batches = self.inner.batches.get_all().await?;

        let mut transactions_by_status = BTreeMap::new();
        let mut processing_ms = Vec::new();
        for tx in &transactions {
            *transactions_by_status.entry(tx.status).or_insert(0) += 1;
            if let Some(submitted_at) = tx.submitted_at {
                processing_ms.push((submitted_at - tx.created_at).num_milliseconds());
            }
        }

        let mut batches_by_status = BTreeMap::new();
        for batch in &batches {
            *batches_by_status.entry(batch.status).or_insert(0) += 1;
        }
        let total_fee_savings: Fee = batches
            .iter()
            .filter(|batch| {
                matches!(
                    batch.status,
                    BatchStatus::Submitted | BatchStatus::Confirmed
                )
            })
            .map(|batch| batch.fee_savings)
            .sum();

        let average_processing_ms = if processing_ms.is_empty() {
            None
        } else {
            Some(processing_ms.iter().sum::<i64>() / processing_ms.len() as i64)
        };

        Ok(QueueStats {
            total_transactions: transactions.len(),
            transactions_by_status,
            total_batches: batches.len(),
            batches_by_status,
            open_batches: self.inner.assembler.open_batches().await,
            waiting_in_queue: self.inner.assembler.queued_len().await,
            total_fee_savings,
            average_processing_ms,
        })
    }

    /// Sets the congestion factor used for every subsequent fee quote.
    /// Negative values are treated as zero.
    pub async fn set_network_load(&self, load: Decimal) {
        let load = load.max(Decimal::ZERO);
        *self.inner.network_load.write().await = load;
        info!(network_load = %load, "network load updated");
    }

    /// The congestion factor currently applied to fee quotes.
    pub async fn network_load(&self) -> Decimal {
        *self.inner.network_load.read().await
    }

    /// Moves due transactions into batches, critical priority first.
    ///
    /// Returns how many transactions were admitted.
    pub async fn process_queued(&self) -> Result<usize> {
        let now = Utc::now();
        let load = self.network_load().await;
        let dispatcher = self.dispatcher();
        let mut admitted = 0;
        let mut first_error = None;
        for priority in Priority::ALL {
            match self
                .inner
                .assembler
                .drain(priority, now, load, &dispatcher)
                .await
            {
                Ok(count) => admitted += count,
                Err(err) => {
                    error!(priority = %priority, error = %err, "draining queue failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(admitted),
        }
    }

    /// Closes batches whose wait time has elapsed.
    pub async fn close_expired_batches(&self) -> Result<usize> {
        self.close_expired_batches_at(Utc::now()).await
    }

    /// Same as [`SettlementEngine::close_expired_batches`] against a given clock.
    pub async fn close_expired_batches_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let load = self.network_load().await;
        self.inner
            .assembler
            .close_expired(now, load, &self.dispatcher())
            .await
    }

    /// Admits whatever is due, then closes every open batch.
    pub async fn flush_batches(&self) -> Result<usize> {
        self.process_queued().await?;
        let load = self.network_load().await;
        let closed = self
            .inner
            .assembler
            .flush(Utc::now(), load, &self.dispatcher())
            .await?;
        if closed > 0 {
            info!(closed, "open batches flushed");
        }
        Ok(closed)
    }

    /// Cancels a transaction that has not been handed to the gateway yet.
    ///
    /// A member of an open batch leaves it; an open batch left empty is
    /// aborted. Fails with `InvalidTransition` once submission has started.
    pub async fn cancel_transaction(&self, id: Uuid) -> Result<Transaction> {
        self.inner.assembler.cancel(id, Utc::now()).await
    }

    /// Records ledger finality for a submitted transaction.
    ///
    /// The batch becomes `confirmed` once every member it submitted is.
    pub async fn confirm_transaction(&self, id: Uuid) -> Result<Transaction> {
        let now = Utc::now();
        let mut tx = self.get_transaction(id).await?;
        tx.confirm(now)?;
        self.inner.transactions.store(tx.clone()).await?;
        info!(transaction_id = %id, "transaction confirmed");

        if let Some(batch_id) = tx.last_batch_id
            && let Some(mut batch) = self.inner.batches.get(batch_id).await?
            && batch.status == BatchStatus::Submitted
        {
            let mut confirmed = 0;
            for member_id in &batch.transaction_ids {
                if let Some(member) = self.inner.transactions.get(*member_id).await?
                    && member.status == TransactionStatus::Confirmed
                    && member.last_batch_id == Some(batch.id)
                {
                    confirmed += 1;
                }
            }
            if confirmed >= batch.success_count {
                batch.mark_confirmed()?;
                self.inner.batches.store(batch).await?;
                info!(batch_id = %batch_id, "batch confirmed");
            }
        }
        Ok(tx)
    }

    /// Waits for every in-flight submission to report back.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.inner.in_flight.lock().await);
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "submission task panicked");
                }
            }
        }
    }

    /// Runs the queue to a standstill: admits, flushes, waits for outcomes
    /// and repeats while retries keep producing work.
    ///
    /// Transactions scheduled for later stay queued.
    pub async fn drain_until_idle(&self) -> Result<()> {
        loop {
            let admitted = self.process_queued().await?;
            let closed = self.flush_batches().await?;
            self.settle().await;
            if admitted == 0 && closed == 0 {
                return Ok(());
            }
        }
    }

    /// Spawns the batching workers and the wait-time ticker.
    pub fn start(&self) -> EngineHandle {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.inner.config.workers + 1);

        for worker in 0..self.inner.config.workers.max(1) {
            let engine = self.clone();
            let mut stop = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                debug!(worker, "batching worker started");
                loop {
                    tokio::select! {
                        _ = engine.inner.wake.notified() => {}
                        _ = stop.changed() => break,
                    }
                    if let Err(err) = engine.process_queued().await {
                        error!(worker, error = %err, "batching pass failed");
                    }
                }
                debug!(worker, "batching worker stopped");
            }));
        }

        let engine = self.clone();
        let mut stop = shutdown.subscribe();
        let period = self.inner.config.tick_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Scheduled transactions become due on the clock, not on enqueue.
                        if let Err(err) = engine.process_queued().await {
                            error!(error = %err, "scheduled batching pass failed");
                        }
                        if let Err(err) = engine.close_expired_batches().await {
                            error!(error = %err, "closing expired batches failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        info!(workers = self.inner.config.workers.max(1), "settlement engine started");
        EngineHandle {
            engine: self.clone(),
            shutdown,
            tasks,
        }
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            inner: self.inner.clone(),
        }
    }
}

/// Running background tasks of a started engine.
pub struct EngineHandle {
    engine: SettlementEngine,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// The engine the background tasks are driving.
    pub fn engine(&self) -> &SettlementEngine {
        &self.engine
    }

    /// Stops the workers, then flushes and settles everything still pending.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "background task panicked");
            }
        }
        self.engine.drain_until_idle().await?;
        info!("settlement engine stopped");
        Ok(())
    }
}

struct Dispatcher {
    inner: Arc<Inner>,
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, submission: Submission) {
        let inner = self.inner.clone();
        let mut in_flight = self.inner.in_flight.lock().await;
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move { inner.run_submission(submission).await });
    }
}

impl Inner {
    async fn run_submission(&self, mut submission: Submission) {
        loop {
            let batch_id = submission.batch_id();
            debug!(batch_id = %batch_id, attempt = submission.batch.retry_count, "submitting batch");
            let outcome = self.gateway.submit(&submission).await;
            match self.handle_outcome(&submission, outcome).await {
                Ok(Some(resubmission)) => {
                    tokio::time::sleep(self.config.batching.retry_backoff()).await;
                    submission = resubmission;
                }
                Ok(None) => return,
                Err(err) => {
                    error!(batch_id = %batch_id, error = %err, "recording submission outcome failed");
                    return;
                }
            }
        }
    }

    /// Applies a gateway outcome; returns the submission to resend when the
    /// whole call failed and the batch still has retry budget.
    async fn handle_outcome(
        &self,
        submission: &Submission,
        outcome: SubmissionOutcome,
    ) -> Result<Option<Submission>> {
        let now = Utc::now();
        let batch_id = submission.batch_id();
        let mut batch = self
            .batches
            .get(batch_id)
            .await?
            .ok_or(QueueError::BatchNotFound(batch_id))?;
        if batch.status != BatchStatus::Processing {
            warn!(batch_id = %batch_id, status = %batch.status, "ignoring outcome for settled batch");
            return Ok(None);
        }

        if outcome.is_batch_level_failure() {
            let error = outcome.batch_error.clone().unwrap_or_default();
            if batch.increment_retry(error.as_str()) {
                warn!(batch_id = %batch_id, attempt = batch.retry_count, error = %error, "batch submission failed, resubmitting");
                self.batches.store(batch.clone()).await?;
                return Ok(Some(Submission {
                    batch,
                    transactions: submission.transactions.clone(),
                }));
            }
            warn!(batch_id = %batch_id, error = %error, "batch retries exhausted, retrying members individually");
        }

        let load = *self.network_load.read().await;
        let fallback_error = outcome
            .batch_error
            .clone()
            .unwrap_or_else(|| "No outcome reported for transaction".to_string());
        let mut success_count = 0;
        let mut failure_count = 0;
        let mut requeued = 0;

        for member in &submission.transactions {
            let Some(mut tx) = self.transactions.get(member.id).await? else {
                failure_count += 1;
                continue;
            };
            if tx.status != TransactionStatus::Processing {
                warn!(transaction_id = %tx.id, status = %tx.status, "ignoring outcome for transaction not in flight");
                failure_count += 1;
                continue;
            }
            let (error, recoverable) = match outcome.result_for(tx.id) {
                Some(SubmissionResult::Submitted { ledger_hash }) => {
                    tx.mark_submitted(ledger_hash.clone(), now)?;
                    self.transactions.store(tx).await?;
                    success_count += 1;
                    continue;
                }
                Some(SubmissionResult::Failed { error, recoverable }) => {
                    (error.clone(), *recoverable)
                }
                None => (fallback_error.clone(), true),
            };

            failure_count += 1;
            let failure = QueueError::SubmissionFailed(error);
            if let RetryDecision::Requeued(retried) = self
                .retry
                .handle_failure(tx, &failure, recoverable, load, now)
                .await?
            {
                self.assembler.push(&retried).await;
                requeued += 1;
            }
        }

        batch.record_outcome(success_count, failure_count, now)?;
        if success_count == 0 {
            batch.last_error = Some(fallback_error);
        }
        self.batches.store(batch).await?;
        if requeued > 0 {
            self.wake.notify_one();
        }

        info!(
            batch_id = %batch_id,
            succeeded = success_count,
            failed = failure_count,
            requeued,
            "batch outcome recorded"
        );
        Ok(None)
    }
}
