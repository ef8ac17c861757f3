use crate::domain::transaction::Transaction;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct ReportRow<'a> {
    id: String,
    #[serde(rename = "type")]
    transaction_type: &'a str,
    priority: &'a str,
    status: &'a str,
    amount: String,
    currency: &'a str,
    fee: String,
    retry_count: u32,
    last_error: &'a str,
}

impl<'a> From<&'a Transaction> for ReportRow<'a> {
    fn from(tx: &'a Transaction) -> Self {
        Self {
            id: tx.id.to_string(),
            transaction_type: tx.transaction_type.as_str(),
            priority: tx.priority.as_str(),
            status: tx.status.as_str(),
            amount: tx.amount.to_string(),
            currency: &tx.currency,
            fee: tx.fee.map(|fee| fee.to_string()).unwrap_or_default(),
            retry_count: tx.retry_count,
            last_error: tx.last_error.as_deref().unwrap_or(""),
        }
    }
}

/// Writes the final state of each transaction as
/// `id,type,priority,status,amount,currency,fee,retry_count,last_error`.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_transactions<'a, I>(&mut self, transactions: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        for tx in transactions {
            self.writer.serialize(ReportRow::from(tx))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fee::Fee;
    use crate::domain::transaction::{EnqueueRequest, TransactionType};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_report_rows() {
        let now = Utc::now();
        let request = EnqueueRequest::new(
            TransactionType::Payment,
            "rA",
            "rB",
            dec!(12.50),
            "xrp",
            "ent-1",
            "user-1",
        );
        let mut tx = Transaction::new(request, 3, now).unwrap();
        tx.mark_queued(now).unwrap();
        tx.assign_singleton(uuid::Uuid::new_v4(), Fee::new(dec!(13)), now)
            .unwrap();

        let mut out = Vec::new();
        ReportWriter::new(&mut out)
            .write_transactions([&tx])
            .unwrap();
        let report = String::from_utf8(out).unwrap();

        let mut lines = report.lines();
        assert_eq!(
            lines.next(),
            Some("id,type,priority,status,amount,currency,fee,retry_count,last_error")
        );
        assert_eq!(
            lines.next().unwrap(),
            format!("{},payment,normal,batched,12.5,XRP,13,0,", tx.id)
        );
    }

    #[test]
    fn test_empty_report_has_no_rows() {
        let mut out = Vec::new();
        ReportWriter::new(&mut out)
            .write_transactions(Vec::<&Transaction>::new())
            .unwrap();
        assert!(out.is_empty());
    }
}
