#![allow(dead_code)]

use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use settlement_queue::application::engine::SettlementEngine;
use settlement_queue::config::QueueConfig;
use settlement_queue::domain::ports::SubmissionGateway;
use settlement_queue::domain::submission::{
    Submission, SubmissionOutcome, SubmissionResult, TransactionOutcome,
};
use settlement_queue::domain::transaction::{EnqueueRequest, Priority, TransactionType};
use settlement_queue::infrastructure::in_memory::{InMemoryBatchStore, InMemoryTransactionStore};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Gateway whose failures are scripted per destination address.
///
/// Every submission it receives is recorded for later inspection.
#[derive(Default)]
pub struct ScriptedGateway {
    failing: Mutex<HashMap<String, (Option<u32>, bool)>>,
    rejected_calls: Mutex<u32>,
    submissions: Mutex<Vec<Submission>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails members sent to `destination`; `times: None` fails forever.
    pub fn fail_destination(&self, destination: &str, times: Option<u32>, recoverable: bool) {
        self.failing
            .lock()
            .unwrap()
            .insert(destination.to_string(), (times, recoverable));
    }

    /// Rejects the next `calls` submissions as a whole.
    pub fn reject_calls(&self, calls: u32) {
        *self.rejected_calls.lock().unwrap() = calls;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    fn result_for(&self, destination: &str, id: uuid::Uuid) -> SubmissionResult {
        let mut failing = self.failing.lock().unwrap();
        if let Some((times, recoverable)) = failing.get_mut(destination) {
            let fail = match times {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            };
            if fail {
                return SubmissionResult::Failed {
                    error: format!("tecNO_DST: {}", destination),
                    recoverable: *recoverable,
                };
            }
        }
        SubmissionResult::Submitted {
            ledger_hash: id.simple().to_string(),
        }
    }
}

#[async_trait]
impl SubmissionGateway for ScriptedGateway {
    async fn submit(&self, submission: &Submission) -> SubmissionOutcome {
        self.submissions.lock().unwrap().push(submission.clone());
        {
            let mut rejected = self.rejected_calls.lock().unwrap();
            if *rejected > 0 {
                *rejected -= 1;
                return SubmissionOutcome::rejected("connection reset by peer");
            }
        }
        let results = submission
            .transactions
            .iter()
            .map(|tx| TransactionOutcome {
                transaction_id: tx.id,
                result: self.result_for(&tx.to_address, tx.id),
            })
            .collect();
        SubmissionOutcome {
            results,
            batch_error: None,
        }
    }
}

pub fn engine(config: QueueConfig, gateway: Arc<ScriptedGateway>) -> SettlementEngine {
    SettlementEngine::new(
        config,
        Arc::new(InMemoryTransactionStore::new()),
        Arc::new(InMemoryBatchStore::new()),
        gateway,
    )
}

pub fn request(transaction_type: TransactionType, priority: Priority, to: &str) -> EnqueueRequest {
    EnqueueRequest::new(
        transaction_type,
        "rSender",
        to,
        Decimal::from(100),
        "XRP",
        "enterprise-1",
        "user-1",
    )
    .with_priority(priority)
}

pub fn payment(to: &str) -> EnqueueRequest {
    request(TransactionType::Payment, Priority::Normal, to)
}

const TYPES: [&str; 5] = [
    "escrow_create",
    "escrow_finish",
    "escrow_cancel",
    "payment",
    "wallet_setup",
];
const PRIORITIES: [&str; 5] = ["low", "normal", "high", "critical", ""];
const CURRENCIES: [&str; 3] = ["XRP", "USD", "EUR"];

/// Writes `rows` random but well-formed request rows.
pub fn generate_csv(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    let mut rng = rand::thread_rng();

    wtr.write_record([
        "type",
        "priority",
        "from",
        "to",
        "amount",
        "currency",
        "enterprise",
        "user",
        "expires_in_secs",
    ])?;

    for i in 1..=rows {
        let amount = format!("{}.{:02}", rng.gen_range(1..10_000), rng.gen_range(0..100));
        let enterprise = format!("enterprise-{}", rng.gen_range(1..=5));
        wtr.write_record([
            *TYPES.choose(&mut rng).unwrap_or(&"payment"),
            *PRIORITIES.choose(&mut rng).unwrap_or(&""),
            "rSender",
            format!("rDest{}", i).as_str(),
            amount.as_str(),
            *CURRENCIES.choose(&mut rng).unwrap_or(&"XRP"),
            enterprise.as_str(),
            format!("user-{}", i).as_str(),
            "",
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
