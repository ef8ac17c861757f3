use crate::domain::fee::FeeSchedule;
use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_transactions: usize,
    pub min_transactions: usize,
    pub max_wait_ms: u64,
    /// Whole-batch resubmissions before falling back to per-member retry.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_transactions: 10,
            min_transactions: 2,
            max_wait_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl BatchSettings {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Process-wide settings, built once at start-up and shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub fees: FeeSchedule,
    pub batching: BatchSettings,
    pub retry: RetrySettings,
    pub supported_currencies: BTreeSet<String>,
    pub workers: usize,
    pub tick_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            fees: FeeSchedule::default(),
            batching: BatchSettings::default(),
            retry: RetrySettings::default(),
            supported_currencies: ["XRP", "USD", "EUR", "GBP", "USDC"]
                .into_iter()
                .map(String::from)
                .collect(),
            workers: 2,
            tick_interval_ms: 1_000,
        }
    }
}

impl QueueConfig {
    /// Loads a JSON config file; omitted fields keep their defaults.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: QueueConfig = serde_json::from_str(&raw)
            .map_err(|e| QueueError::Config(format!("Invalid config file: {}", e)))?;
        config.supported_currencies = config
            .supported_currencies
            .into_iter()
            .map(|currency| currency.to_ascii_uppercase())
            .collect();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fees.base_fee_floor > self.fees.max_fee {
            return Err(QueueError::Config(format!(
                "base_fee_floor {} exceeds max_fee {}",
                self.fees.base_fee_floor, self.fees.max_fee
            )));
        }
        if self.batching.max_transactions == 0 {
            return Err(QueueError::Config(
                "max_transactions must be at least 1".to_string(),
            ));
        }
        if self.batching.min_transactions > self.batching.max_transactions {
            return Err(QueueError::Config(format!(
                "min_transactions {} exceeds max_transactions {}",
                self.batching.min_transactions, self.batching.max_transactions
            )));
        }
        if self.supported_currencies.is_empty() {
            return Err(QueueError::Config(
                "at least one supported currency is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
