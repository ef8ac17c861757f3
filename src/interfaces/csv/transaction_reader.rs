use crate::domain::transaction::{EnqueueRequest, Priority, TransactionType};
use crate::error::{QueueError, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One request row: `type,priority,from,to,amount,currency,enterprise,user,expires_in_secs`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestRow {
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub priority: Option<Priority>,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub currency: String,
    pub enterprise: String,
    pub user: String,
    #[serde(default)]
    pub expires_in_secs: Option<i64>,
}

impl RequestRow {
    /// Fails when `expires_in_secs` puts the deadline outside the representable range.
    pub fn into_request(self, now: DateTime<Utc>) -> Result<EnqueueRequest> {
        let mut request = EnqueueRequest::new(
            self.transaction_type,
            self.from,
            self.to,
            self.amount,
            self.currency,
            self.enterprise,
            self.user,
        )
        .with_priority(self.priority.unwrap_or_default());
        if let Some(secs) = self.expires_in_secs {
            let expires_at = Duration::try_seconds(secs)
                .and_then(|offset| now.checked_add_signed(offset))
                .ok_or_else(|| {
                    QueueError::InvalidTransaction(format!("expires_in_secs {secs} is out of range"))
                })?;
            request = request.with_expiry(expires_at);
        }
        Ok(request)
    }
}

/// Reads enqueue requests from a CSV source.
///
/// Whitespace is trimmed and short rows are accepted, so optional trailing
/// columns may be left out entirely.
pub struct TransactionReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> TransactionReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily yields requests; expiry offsets are taken relative to `now`.
    pub fn requests(self, now: DateTime<Utc>) -> impl Iterator<Item = Result<EnqueueRequest>> {
        self.reader.into_deserialize().map(move |row| {
            let row: RequestRow = row?;
            row.into_request(now)
        })
    }
}
