use crate::domain::batch::Batch;
use crate::domain::transaction::Transaction;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A priced batch (or batch of one) handed to the submission gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub batch: Batch,
    pub transactions: Vec<Transaction>,
}

impl Submission {
    pub fn batch_id(&self) -> Uuid {
        self.batch.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmissionResult {
    Submitted { ledger_hash: String },
    Failed { error: String, recoverable: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub transaction_id: Uuid,
    pub result: SubmissionResult,
}

/// What the gateway reports back for one submission.
///
/// `batch_error` without any per-transaction result means the submission call
/// itself failed before the ledger saw any member.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub results: Vec<TransactionOutcome>,
    pub batch_error: Option<String>,
}

impl SubmissionOutcome {
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            batch_error: Some(error.into()),
        }
    }

    pub fn is_batch_level_failure(&self) -> bool {
        self.batch_error.is_some() && self.results.is_empty()
    }

    pub fn result_for(&self, transaction_id: Uuid) -> Option<&SubmissionResult> {
        self.results
            .iter()
            .find(|outcome| outcome.transaction_id == transaction_id)
            .map(|outcome| &outcome.result)
    }
}
