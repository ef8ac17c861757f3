use crate::domain::ports::SubmissionGateway;
use crate::domain::submission::{
    Submission, SubmissionOutcome, SubmissionResult, TransactionOutcome,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Stand-in for the ledger submission client.
///
/// Accepts every member except those sent to a rejected destination, which
/// fail with a recoverable error. Ledger hashes are derived from the
/// transaction id so repeated runs report the same hash.
#[derive(Debug, Clone, Default)]
pub struct SimulatedGateway {
    rejected_destinations: HashSet<String>,
    latency: Duration,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting<I, S>(mut self, destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rejected_destinations
            .extend(destinations.into_iter().map(Into::into));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl SubmissionGateway for SimulatedGateway {
    async fn submit(&self, submission: &Submission) -> SubmissionOutcome {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let results = submission
            .transactions
            .iter()
            .map(|tx| {
                let result = if self.rejected_destinations.contains(&tx.to_address) {
                    SubmissionResult::Failed {
                        error: format!("Destination {} rejected the transaction", tx.to_address),
                        recoverable: true,
                    }
                } else {
                    SubmissionResult::Submitted {
                        ledger_hash: tx.id.simple().to_string().to_uppercase(),
                    }
                };
                TransactionOutcome {
                    transaction_id: tx.id,
                    result,
                }
            })
            .collect();

        debug!(batch_id = %submission.batch_id(), "simulated submission completed");
        SubmissionOutcome {
            results,
            batch_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::Batch;
    use crate::domain::transaction::{EnqueueRequest, Priority, Transaction, TransactionType};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn submission(destinations: &[&str]) -> Submission {
        let now = Utc::now();
        let transactions: Vec<Transaction> = destinations
            .iter()
            .map(|to| {
                let request = EnqueueRequest::new(
                    TransactionType::Payment,
                    "rSender",
                    *to,
                    dec!(5),
                    "XRP",
                    "enterprise-1",
                    "user-1",
                );
                Transaction::new(request, 3, now).unwrap()
            })
            .collect();
        let mut batch = Batch::open(Priority::Normal, 10, 2, 3, now);
        for tx in &transactions {
            batch.admit(tx.id).unwrap();
        }
        Submission {
            batch,
            transactions,
        }
    }

    #[tokio::test]
    async fn test_accepts_everything_by_default() {
        let submission = submission(&["rA", "rB"]);
        let outcome = SimulatedGateway::new().submit(&submission).await;
        assert!(outcome.batch_error.is_none());
        assert_eq!(outcome.results.len(), 2);
        assert!(
            outcome
                .results
                .iter()
                .all(|r| matches!(r.result, SubmissionResult::Submitted { .. }))
        );
    }

    #[tokio::test]
    async fn test_rejects_configured_destination() {
        let submission = submission(&["rA", "rBlocked"]);
        let gateway = SimulatedGateway::new().rejecting(["rBlocked"]);
        let outcome = gateway.submit(&submission).await;

        let blocked = submission.transactions[1].id;
        assert!(matches!(
            outcome.result_for(blocked),
            Some(SubmissionResult::Failed {
                recoverable: true,
                ..
            })
        ));
    }
}
