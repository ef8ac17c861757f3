use crate::domain::transaction::{Priority, Transaction, TransactionType};
use crate::error::{QueueError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

/// A network fee expressed in drop-equivalent units.
///
/// Backed by `rust_decimal::Decimal` and serialized as a decimal string so that
/// fee totals never pick up binary floating point drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fee(Decimal);

impl Fee {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// `self - rhs`, never below zero.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self((self.0 - rhs.0).max(Decimal::ZERO))
    }
}

impl fmt::Display for Fee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Add for Fee {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Fee {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Fee {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sum for Fee {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, fee| acc + fee)
    }
}

/// Represents a positive monetary amount carried by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(QueueError::InvalidTransaction(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = QueueError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

/// One scalar per priority level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityTable {
    pub low: Decimal,
    pub normal: Decimal,
    pub high: Decimal,
    pub critical: Decimal,
}

impl PriorityTable {
    pub fn get(&self, priority: Priority) -> Decimal {
        match priority {
            Priority::Low => self.low,
            Priority::Normal => self.normal,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }
}

/// Batches of at least `min_size` members earn `discount` off each member fee.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeTier {
    pub min_size: usize,
    pub discount: Decimal,
}

/// Every constant the fee model prices with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub base_fees: BTreeMap<TransactionType, Decimal>,
    /// Used for any type missing from `base_fees`.
    pub default_base_fee: Decimal,
    pub priority_multipliers: PriorityTable,
    /// Scales the size-tier discount; values above 1 discount more aggressively.
    pub priority_discount_factors: PriorityTable,
    pub size_tiers: Vec<SizeTier>,
    pub retry_escalation: Decimal,
    pub base_fee_floor: Decimal,
    pub max_fee: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        let base_fees = BTreeMap::from([
            (TransactionType::EscrowCreate, dec!(12)),
            (TransactionType::EscrowFinish, dec!(12)),
            (TransactionType::EscrowCancel, dec!(12)),
            (TransactionType::Payment, dec!(10)),
            (TransactionType::WalletSetup, dec!(15)),
        ]);

        Self {
            base_fees,
            default_base_fee: dec!(10),
            priority_multipliers: PriorityTable {
                low: dec!(0.8),
                normal: dec!(1.0),
                high: dec!(1.5),
                critical: dec!(2.0),
            },
            priority_discount_factors: PriorityTable {
                low: dec!(1.2),
                normal: dec!(1.0),
                high: dec!(0.8),
                critical: dec!(0.6),
            },
            size_tiers: vec![
                SizeTier {
                    min_size: 3,
                    discount: dec!(0.05),
                },
                SizeTier {
                    min_size: 5,
                    discount: dec!(0.10),
                },
                SizeTier {
                    min_size: 10,
                    discount: dec!(0.15),
                },
            ],
            retry_escalation: dec!(1.2),
            base_fee_floor: dec!(10),
            max_fee: dec!(10000),
        }
    }
}

/// Deterministic, side-effect free fee computation.
///
/// Every method is a pure function of its arguments and the schedule the model
/// was built with, so identical inputs always price identically. Fees are
/// rounded up to whole units and kept inside `[base_fee_floor, max_fee]`.
#[derive(Debug, Clone, Default)]
pub struct FeeModel {
    schedule: FeeSchedule,
}

impl FeeModel {
    pub fn new(schedule: FeeSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &FeeSchedule {
        &self.schedule
    }

    pub fn base_fee(&self, transaction_type: TransactionType) -> Decimal {
        self.schedule
            .base_fees
            .get(&transaction_type)
            .copied()
            .unwrap_or(self.schedule.default_base_fee)
    }

    pub fn priority_multiplier(&self, priority: Priority) -> Decimal {
        self.schedule.priority_multipliers.get(priority)
    }

    /// `retry_escalation ^ retry_count`; exactly 1 before the first retry.
    pub fn retry_multiplier(&self, retry_count: u32) -> Decimal {
        saturating_product((0..retry_count).map(|_| self.schedule.retry_escalation))
    }

    /// Discount fraction earned by a batch of `batch_size` members.
    pub fn size_discount(&self, batch_size: usize) -> Decimal {
        self.schedule
            .size_tiers
            .iter()
            .filter(|tier| batch_size >= tier.min_size)
            .map(|tier| tier.discount)
            .max()
            .unwrap_or(Decimal::ZERO)
    }

    /// Prices a single transaction from scratch.
    pub fn transaction_fee(&self, tx: &Transaction, network_load: Decimal) -> Result<Fee> {
        self.fee_for(tx.transaction_type, tx.priority, tx.retry_count, network_load)
    }

    pub fn fee_for(
        &self,
        transaction_type: TransactionType,
        priority: Priority,
        retry_count: u32,
        network_load: Decimal,
    ) -> Result<Fee> {
        let load = network_load.max(Decimal::ZERO);
        let raw = saturating_product([
            self.base_fee(transaction_type),
            Decimal::ONE.checked_add(load).unwrap_or(Decimal::MAX),
            self.priority_multiplier(priority),
            self.retry_multiplier(retry_count),
        ]);
        self.clamp(raw)
    }

    /// Applies the size-tier discount, scaled by the priority discount factor,
    /// to one member's individual fee.
    pub fn batch_optimized_fee(
        &self,
        individual_fee: Fee,
        batch_size: usize,
        priority: Priority,
    ) -> Result<Fee> {
        let discount = (self.size_discount(batch_size)
            * self.schedule.priority_discount_factors.get(priority))
        .min(Decimal::ONE)
        .max(Decimal::ZERO);
        self.clamp(individual_fee.value() * (Decimal::ONE - discount))
    }

    /// Escalates `original_fee` for the given retry attempt. Without an
    /// original fee the transaction is priced from scratch at that attempt.
    pub fn retry_fee(
        &self,
        original_fee: Option<Fee>,
        retry_count: u32,
        tx: &Transaction,
        network_load: Decimal,
    ) -> Result<Fee> {
        match original_fee {
            Some(fee) if fee.value() > Decimal::ZERO => {
                self.clamp(saturating_product([
                    fee.value(),
                    self.retry_multiplier(retry_count),
                ]))
            }
            _ => self.fee_for(tx.transaction_type, tx.priority, retry_count, network_load),
        }
    }

    /// Rejects a proposed fee outside `[base_fee_floor, max_fee]`.
    pub fn validate(&self, fee: Decimal) -> Result<Fee> {
        if fee < self.schedule.base_fee_floor || fee > self.schedule.max_fee {
            return Err(QueueError::FeeOutOfRange {
                fee,
                min: self.schedule.base_fee_floor,
                max: self.schedule.max_fee,
            });
        }
        Ok(Fee(fee))
    }

    fn clamp(&self, raw: Decimal) -> Result<Fee> {
        let fee = raw
            .ceil()
            .max(self.schedule.base_fee_floor)
            .min(self.schedule.max_fee);
        self.validate(fee)
    }
}

/// Overflow saturates at `Decimal::MAX`; every factor is non-negative, so
/// `FeeModel::clamp` then caps the result at `max_fee`.
fn saturating_product(factors: impl IntoIterator<Item = Decimal>) -> Decimal {
    factors
        .into_iter()
        .try_fold(Decimal::ONE, |acc, factor| acc.checked_mul(factor))
        .unwrap_or(Decimal::MAX)
}
