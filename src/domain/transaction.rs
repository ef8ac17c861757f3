use crate::domain::fee::{Amount, Fee};
use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current schema version of [`Metadata`].
pub const METADATA_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    EscrowCreate,
    EscrowFinish,
    EscrowCancel,
    Payment,
    WalletSetup,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::EscrowCreate => "escrow_create",
            TransactionType::EscrowFinish => "escrow_finish",
            TransactionType::EscrowCancel => "escrow_cancel",
            TransactionType::Payment => "payment",
            TransactionType::WalletSetup => "wallet_setup",
        }
    }

    pub fn is_escrow(&self) -> bool {
        matches!(
            self,
            TransactionType::EscrowCreate
                | TransactionType::EscrowFinish
                | TransactionType::EscrowCancel
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "escrow_create" => Ok(TransactionType::EscrowCreate),
            "escrow_finish" => Ok(TransactionType::EscrowFinish),
            "escrow_cancel" => Ok(TransactionType::EscrowCancel),
            "payment" => Ok(TransactionType::Payment),
            "wallet_setup" => Ok(TransactionType::WalletSetup),
            other => Err(QueueError::InvalidTransaction(format!(
                "Unsupported transaction type '{other}'"
            ))),
        }
    }
}

#[derive(
    Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Drain order used by the assembler: most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(QueueError::InvalidTransaction(format!(
                "Unsupported priority '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Queued,
    Batching,
    Batched,
    Processing,
    Submitted,
    Confirmed,
    Failed,
    Cancelled,
    Expired,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Queued => "queued",
            TransactionStatus::Batching => "batching",
            TransactionStatus::Batched => "batched",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Submitted => "submitted",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed
                | TransactionStatus::Failed
                | TransactionStatus::Cancelled
                | TransactionStatus::Expired
        )
    }

    /// States in which an external cancellation is still honoured.
    pub fn is_pre_submission(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending
                | TransactionStatus::Queued
                | TransactionStatus::Batching
                | TransactionStatus::Batched
        )
    }

    /// States in which the transaction carries a batch reference.
    pub fn holds_batch(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Batching | TransactionStatus::Batched | TransactionStatus::Processing
        )
    }

    pub fn can_transition_to(&self, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (*self, to) {
            (Pending, Queued)
            | (Queued, Batching)
            | (Queued, Batched)
            | (Batching, Batched)
            | (Batching, Queued)
            | (Batched, Processing)
            | (Processing, Submitted)
            | (Submitted, Confirmed)
            | (Failed, Pending) => true,
            (from, Cancelled) => from.is_pre_submission(),
            (from, Failed) | (from, Expired) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        let status = match s.trim().to_ascii_lowercase().as_str() {
            "pending" => TransactionStatus::Pending,
            "queued" => TransactionStatus::Queued,
            "batching" => TransactionStatus::Batching,
            "batched" => TransactionStatus::Batched,
            "processing" => TransactionStatus::Processing,
            "submitted" => TransactionStatus::Submitted,
            "confirmed" => TransactionStatus::Confirmed,
            "failed" => TransactionStatus::Failed,
            "cancelled" => TransactionStatus::Cancelled,
            "expired" => TransactionStatus::Expired,
            other => {
                return Err(QueueError::InvalidTransaction(format!(
                    "Unknown transaction status '{other}'"
                )));
            }
        };
        Ok(status)
    }
}

/// Escrow parameters forwarded to the ledger untouched.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct EscrowMetadata {
    pub condition: Option<String>,
    pub finish_after: Option<DateTime<Utc>>,
    pub cancel_after: Option<DateTime<Utc>>,
    pub offer_sequence: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct PaymentMetadata {
    pub destination_tag: Option<u32>,
    pub memo: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct WalletSetupMetadata {
    pub requires_activation: bool,
}

/// Known metadata shapes, one per transaction family.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataBody {
    #[default]
    None,
    Escrow(EscrowMetadata),
    Payment(PaymentMetadata),
    WalletSetup(WalletSetupMetadata),
}

/// Versioned envelope around [`MetadataBody`].
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Metadata {
    pub version: u16,
    #[serde(flatten)]
    pub body: MetadataBody,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new(MetadataBody::None)
    }
}

impl Metadata {
    pub fn new(body: MetadataBody) -> Self {
        Self {
            version: METADATA_VERSION,
            body,
        }
    }

    fn validate_for(&self, transaction_type: TransactionType) -> Result<()> {
        if self.version > METADATA_VERSION {
            return Err(QueueError::InvalidTransaction(format!(
                "Unsupported metadata version {}",
                self.version
            )));
        }
        match &self.body {
            MetadataBody::None => Ok(()),
            MetadataBody::Escrow(escrow) if transaction_type.is_escrow() => {
                if let (Some(finish), Some(cancel)) = (escrow.finish_after, escrow.cancel_after)
                    && cancel <= finish
                {
                    return Err(QueueError::InvalidTransaction(
                        "Escrow cancel_after must be later than finish_after".to_string(),
                    ));
                }
                Ok(())
            }
            MetadataBody::Payment(_) if transaction_type == TransactionType::Payment => Ok(()),
            MetadataBody::WalletSetup(_) if transaction_type == TransactionType::WalletSetup => {
                Ok(())
            }
            _ => Err(QueueError::InvalidTransaction(format!(
                "Metadata does not apply to {transaction_type} transactions"
            ))),
        }
    }
}

/// Caller supplied fields of a new transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub transaction_type: TransactionType,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub currency: String,
    pub enterprise_id: String,
    pub user_id: String,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub metadata: Metadata,
}

impl EnqueueRequest {
    pub fn new(
        transaction_type: TransactionType,
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
        enterprise_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            transaction_type,
            from_address: from_address.into(),
            to_address: to_address.into(),
            amount,
            currency: currency.into(),
            enterprise_id: enterprise_id.into(),
            user_id: user_id.into(),
            priority: Priority::Normal,
            scheduled_at: None,
            expires_at: None,
            max_retries: None,
            metadata: Metadata::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_schedule(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_metadata(mut self, body: MetadataBody) -> Self {
        self.metadata = Metadata::new(body);
        self
    }

    /// Checks the currency against the configured currency table.
    pub fn validate_currency(&self, supported: &BTreeSet<String>) -> Result<()> {
        if supported.contains(&self.currency.to_ascii_uppercase()) {
            Ok(())
        } else {
            Err(QueueError::InvalidTransaction(format!(
                "Unsupported currency '{}'",
                self.currency
            )))
        }
    }
}

/// A ledger-bound unit of work and its lifecycle bookkeeping.
///
/// Status changes go through the transition methods below, which enforce the
/// state machine and keep `batch_id` set only while the transaction is held by
/// a batch.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub priority: Priority,
    pub from_address: String,
    pub to_address: String,
    pub amount: Amount,
    pub currency: String,
    pub enterprise_id: String,
    pub user_id: String,
    /// Fee the transaction will pay (its optimized share once batched).
    pub fee: Option<Fee>,
    /// First individual fee quoted, the base for retry escalation.
    pub original_fee: Option<Fee>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub batch_id: Option<Uuid>,
    /// Batch of the most recent submission attempt, kept after `batch_id` clears.
    pub last_batch_id: Option<Uuid>,
    pub ledger_hash: Option<String>,
    pub last_error: Option<String>,
    pub metadata: Metadata,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Builds a `pending` transaction after checking its shape.
    pub fn new(request: EnqueueRequest, default_max_retries: u32, now: DateTime<Utc>) -> Result<Self> {
        if request.from_address.trim().is_empty() || request.to_address.trim().is_empty() {
            return Err(QueueError::InvalidTransaction(
                "Source and destination addresses are required".to_string(),
            ));
        }
        let amount = Amount::new(request.amount)?;
        request.metadata.validate_for(request.transaction_type)?;

        Ok(Self {
            id: Uuid::new_v4(),
            transaction_type: request.transaction_type,
            status: TransactionStatus::Pending,
            priority: request.priority,
            from_address: request.from_address.trim().to_string(),
            to_address: request.to_address.trim().to_string(),
            amount,
            currency: request.currency.to_ascii_uppercase(),
            enterprise_id: request.enterprise_id,
            user_id: request.user_id,
            fee: None,
            original_fee: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            batch_id: None,
            last_batch_id: None,
            ledger_hash: None,
            last_error: None,
            metadata: request.metadata,
            scheduled_at: request.scheduled_at,
            expires_at: request.expires_at,
            created_at: now,
            updated_at: now,
            queued_at: None,
            submitted_at: None,
            confirmed_at: None,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|scheduled_at| scheduled_at <= now)
    }

    /// Whether the transaction may join a shared batch right now.
    pub fn can_batch(&self, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::Queued
            && self.transaction_type != TransactionType::WalletSetup
            && !self.is_expired(now)
    }

    /// Marks a live transaction whose deadline passed as `expired`.
    ///
    /// Returns `true` when the transaction is (now) expired.
    pub fn check_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == TransactionStatus::Expired {
            return true;
        }
        if self.status.is_terminal() || !self.is_expired(now) {
            return false;
        }
        let expires_at = self.expires_at.unwrap_or(now);
        self.force_status(TransactionStatus::Expired, now);
        self.last_error = Some(format!("Expired at {}", expires_at.to_rfc3339()));
        true
    }

    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Queued, now)?;
        self.queued_at = Some(now);
        Ok(())
    }

    pub fn begin_batching(&mut self, batch_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if !self.can_batch(now) {
            return Err(self.invalid(TransactionStatus::Batching));
        }
        self.transition(TransactionStatus::Batching, now)?;
        self.batch_id = Some(batch_id);
        Ok(())
    }

    /// Takes a `queued` transaction straight into a batch of one.
    pub fn assign_singleton(&mut self, batch_id: Uuid, fee: Fee, now: DateTime<Utc>) -> Result<()> {
        if self.status != TransactionStatus::Queued || self.is_expired(now) {
            return Err(self.invalid(TransactionStatus::Batched));
        }
        self.transition(TransactionStatus::Batched, now)?;
        self.batch_id = Some(batch_id);
        self.apply_fee(fee, fee);
        Ok(())
    }

    pub fn mark_batched(&mut self, individual_fee: Fee, optimized_fee: Fee, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Batched, now)?;
        self.apply_fee(individual_fee, optimized_fee);
        Ok(())
    }

    pub fn revert_to_queued(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Queued, now)
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Processing, now)?;
        self.last_batch_id = self.batch_id;
        Ok(())
    }

    pub fn mark_submitted(&mut self, ledger_hash: String, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Submitted, now)?;
        self.ledger_hash = Some(ledger_hash);
        self.submitted_at = Some(now);
        Ok(())
    }

    pub fn confirm(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Confirmed, now)?;
        self.confirmed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status != TransactionStatus::Failed {
            self.transition(TransactionStatus::Failed, now)?;
        }
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TransactionStatus::Cancelled, now)?;
        self.last_error = Some("Cancelled by request".to_string());
        Ok(())
    }

    /// Records one more failed attempt.
    ///
    /// Reaching `max_retries` leaves the transaction terminally `failed`;
    /// otherwise it goes back to `pending` to re-enter the queue. Callers must
    /// invoke this at most once per failure event.
    pub fn increment_retry(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.retry_count >= self.max_retries {
            return Err(QueueError::RetryExhausted {
                attempts: self.retry_count,
                last_error: self.last_error.clone().unwrap_or_default(),
            });
        }
        if self.status != TransactionStatus::Failed {
            self.transition(TransactionStatus::Failed, now)?;
        }
        self.retry_count += 1;
        if self.retry_count >= self.max_retries {
            let exhausted = QueueError::RetryExhausted {
                attempts: self.retry_count,
                last_error: self.last_error.clone().unwrap_or_default(),
            };
            self.last_error = Some(exhausted.to_string());
            self.updated_at = now;
            return Ok(());
        }
        self.transition(TransactionStatus::Pending, now)
    }

    fn apply_fee(&mut self, individual_fee: Fee, optimized_fee: Fee) {
        self.original_fee.get_or_insert(individual_fee);
        self.fee = Some(optimized_fee);
    }

    fn transition(&mut self, to: TransactionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(self.invalid(to));
        }
        self.force_status(to, now);
        Ok(())
    }

    fn force_status(&mut self, to: TransactionStatus, now: DateTime<Utc>) {
        self.status = to;
        self.updated_at = now;
        if !to.holds_batch() {
            self.batch_id = None;
        }
    }

    fn invalid(&self, to: TransactionStatus) -> QueueError {
        QueueError::InvalidTransition {
            entity: "transaction",
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn request(transaction_type: TransactionType) -> EnqueueRequest {
        EnqueueRequest::new(
            transaction_type,
            "rSender",
            "rReceiver",
            dec!(1000),
            "xrp",
            "enterprise-1",
            "user-1",
        )
    }

    fn queued(transaction_type: TransactionType) -> Transaction {
        let now = Utc::now();
        let mut tx = Transaction::new(request(transaction_type), 3, now).unwrap();
        tx.mark_queued(now).unwrap();
        tx
    }

    #[test]
    fn test_new_transaction_is_pending() {
        let tx = Transaction::new(request(TransactionType::Payment), 3, Utc::now()).unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.retry_count, 0);
        assert_eq!(tx.max_retries, 3);
        assert_eq!(tx.currency, "XRP");
        assert!(tx.batch_id.is_none());
    }

    #[test]
    fn test_shape_validation() {
        let now = Utc::now();

        let mut bad = request(TransactionType::Payment);
        bad.from_address = "  ".to_string();
        assert!(matches!(
            Transaction::new(bad, 3, now),
            Err(QueueError::InvalidTransaction(_))
        ));

        let mut bad = request(TransactionType::Payment);
        bad.amount = dec!(0);
        assert!(matches!(
            Transaction::new(bad, 3, now),
            Err(QueueError::InvalidTransaction(_))
        ));

        let bad = request(TransactionType::Payment)
            .with_metadata(MetadataBody::Escrow(EscrowMetadata::default()));
        assert!(matches!(
            Transaction::new(bad, 3, now),
            Err(QueueError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_escrow_window_validation() {
        let now = Utc::now();
        let escrow = EscrowMetadata {
            finish_after: Some(now + Duration::hours(2)),
            cancel_after: Some(now + Duration::hours(1)),
            ..Default::default()
        };
        let bad = request(TransactionType::EscrowCreate).with_metadata(MetadataBody::Escrow(escrow));
        assert!(Transaction::new(bad, 3, now).is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(matches!(
            "escrow_explode".parse::<TransactionType>(),
            Err(QueueError::InvalidTransaction(_))
        ));
        assert_eq!(
            "Wallet_Setup".parse::<TransactionType>().unwrap(),
            TransactionType::WalletSetup
        );
    }

    #[test]
    fn test_currency_validation() {
        let supported = BTreeSet::from(["XRP".to_string()]);
        assert!(request(TransactionType::Payment).validate_currency(&supported).is_ok());

        let mut other = request(TransactionType::Payment);
        other.currency = "DOGE".to_string();
        assert!(other.validate_currency(&supported).is_err());
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let now = Utc::now();
        let mut tx = queued(TransactionType::Payment);
        let batch_id = Uuid::new_v4();

        tx.begin_batching(batch_id, now).unwrap();
        assert_eq!(tx.batch_id, Some(batch_id));

        tx.mark_batched(Fee::new(dec!(13)), Fee::new(dec!(12)), now).unwrap();
        assert_eq!(tx.fee, Some(Fee::new(dec!(12))));
        assert_eq!(tx.original_fee, Some(Fee::new(dec!(13))));

        tx.mark_processing(now).unwrap();
        assert_eq!(tx.batch_id, Some(batch_id));

        tx.mark_submitted("ABC".to_string(), now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Submitted);
        assert!(tx.batch_id.is_none());
        assert_eq!(tx.last_batch_id, Some(batch_id));

        tx.confirm(now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);
    }

    #[test]
    fn test_wallet_setup_never_batches() {
        let tx = queued(TransactionType::WalletSetup);
        assert!(!tx.can_batch(Utc::now()));

        let mut tx = tx;
        assert!(tx.begin_batching(Uuid::new_v4(), Utc::now()).is_err());
        assert!(
            tx.assign_singleton(Uuid::new_v4(), Fee::new(dec!(15)), Utc::now())
                .is_ok()
        );
        assert_eq!(tx.status, TransactionStatus::Batched);
    }

    #[test]
    fn test_expired_transaction_cannot_batch() {
        let now = Utc::now();
        let req = request(TransactionType::Payment).with_expiry(now - Duration::seconds(5));
        let mut tx = Transaction::new(req, 3, now).unwrap();
        tx.mark_queued(now).unwrap();

        assert!(!tx.can_batch(now));
        assert!(tx.check_expiry(now));
        assert_eq!(tx.status, TransactionStatus::Expired);
        assert!(tx.last_error.is_some());
        assert!(!tx.can_batch(now));
    }

    #[test]
    fn test_check_expiry_ignores_terminal_states() {
        let now = Utc::now();
        let req = request(TransactionType::Payment).with_expiry(now - Duration::seconds(5));
        let mut tx = Transaction::new(req, 3, now).unwrap();
        tx.cancel(now).unwrap();
        assert!(!tx.check_expiry(now));
        assert_eq!(tx.status, TransactionStatus::Cancelled);
    }

    #[test]
    fn test_cancel_only_before_submission() {
        let now = Utc::now();
        let mut tx = queued(TransactionType::Payment);
        tx.begin_batching(Uuid::new_v4(), now).unwrap();
        tx.mark_batched(Fee::new(dec!(10)), Fee::new(dec!(10)), now).unwrap();
        tx.mark_processing(now).unwrap();

        assert!(matches!(
            tx.cancel(now),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert_eq!(tx.status, TransactionStatus::Processing);

        let mut tx = queued(TransactionType::Payment);
        tx.cancel(now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Cancelled);
        assert_eq!(tx.last_error.as_deref(), Some("Cancelled by request"));
    }

    #[test]
    fn test_increment_retry_until_exhausted() {
        let now = Utc::now();
        let mut tx = queued(TransactionType::Payment);

        for attempt in 1..=2 {
            tx.fail("ledger busy", now).unwrap();
            tx.increment_retry(now).unwrap();
            assert_eq!(tx.retry_count, attempt);
            assert_eq!(tx.status, TransactionStatus::Pending);
            tx.mark_queued(now).unwrap();
        }

        tx.fail("ledger busy", now).unwrap();
        tx.increment_retry(now).unwrap();
        assert_eq!(tx.retry_count, 3);
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(tx.last_error.as_deref().unwrap().contains("Retries exhausted"));

        assert!(matches!(
            tx.increment_retry(now),
            Err(QueueError::RetryExhausted { attempts: 3, .. })
        ));
        assert_eq!(tx.retry_count, 3);
    }

    #[test]
    fn test_batch_reference_cleared_on_revert() {
        let now = Utc::now();
        let mut tx = queued(TransactionType::EscrowFinish);
        tx.begin_batching(Uuid::new_v4(), now).unwrap();
        tx.revert_to_queued(now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Queued);
        assert!(tx.batch_id.is_none());
    }

    #[test]
    fn test_scheduled_transaction_not_due() {
        let now = Utc::now();
        let req = request(TransactionType::Payment).with_schedule(now + Duration::minutes(5));
        let tx = Transaction::new(req, 3, now).unwrap();
        assert!(!tx.is_due(now));
        assert!(tx.is_due(now + Duration::minutes(5)));
    }

    #[test]
    fn test_metadata_carries_version_and_kind() {
        let metadata = Metadata::new(MetadataBody::Payment(PaymentMetadata {
            destination_tag: Some(42),
            memo: None,
        }));
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["kind"], "payment");
        assert_eq!(json["destination_tag"], 42);
    }
}
