use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::{reconcile_last, Money};
use crate::errors::{LedgerError, Result};
use crate::late_fee::LateFeeBreakdown;
use crate::types::InstallmentId;

/// how a late-fee amount lands on installments and the loan-level counter
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeeDistribution {
    /// increments to each installment's `late_fee_paid`
    pub shares: Vec<(InstallmentId, Money)>,
    /// reduction of the loan-level late-fee counter
    pub loan_level: Money,
}

impl FeeDistribution {
    pub fn total(&self) -> Money {
        self.shares.iter().map(|(_, m)| *m).sum::<Money>() + self.loan_level
    }

    /// administrative removal spread in proportion to each row's current fee
    ///
    /// Shares follow the recomputed fee, not amounts charged earlier, so a
    /// removal can drift from what a row was actually billed.
    pub fn proportional(
        amount: Money,
        breakdown: &LateFeeBreakdown,
        loan_level_balance: Money,
        tolerance: Money,
    ) -> Result<Self> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount { amount });
        }

        let total = breakdown.total_late_fee;
        if total.is_zero() {
            return Self::loan_level_only(amount, loan_level_balance, tolerance);
        }

        if amount > total + tolerance {
            return Err(LedgerError::ExceedsMaximum {
                maximum: total,
                requested: amount,
            });
        }
        let amount = amount.min(total);

        let owing: Vec<_> = breakdown.items.iter().filter(|i| i.fee().is_positive()).collect();
        let mut shares: Vec<Money> = owing
            .iter()
            .map(|item| Money::from_decimal(amount.as_decimal() * weight(item.fee(), total)))
            .collect();
        reconcile_last(&mut shares, amount);

        Ok(Self {
            shares: owing.iter().map(|i| i.installment_id).zip(shares).collect(),
            loan_level: Money::ZERO,
        })
    }

    /// late-fee payment applied to the oldest overdue rows first
    pub fn oldest_first(
        amount: Money,
        breakdown: &LateFeeBreakdown,
        loan_level_balance: Money,
        tolerance: Money,
    ) -> Result<Self> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount { amount });
        }
        if amount.is_zero() {
            return Ok(Self::default());
        }

        let total = breakdown.total_late_fee;
        if total.is_zero() {
            return Self::loan_level_only(amount, loan_level_balance, tolerance);
        }

        if amount > total + tolerance {
            return Err(LedgerError::ExceedsMaximum {
                maximum: total,
                requested: amount,
            });
        }

        let mut remaining = amount.min(total);
        let mut shares = Vec::new();
        for item in &breakdown.items {
            if remaining.is_zero() {
                break;
            }
            let portion = remaining.min(item.fee());
            if portion.is_positive() {
                shares.push((item.installment_id, portion));
                remaining -= portion;
            }
        }

        Ok(Self {
            shares,
            loan_level: Money::ZERO,
        })
    }

    fn loan_level_only(amount: Money, loan_level_balance: Money, tolerance: Money) -> Result<Self> {
        if amount > loan_level_balance + tolerance {
            return Err(LedgerError::ExceedsMaximum {
                maximum: loan_level_balance,
                requested: amount,
            });
        }
        Ok(Self {
            shares: Vec::new(),
            loan_level: amount.min(loan_level_balance),
        })
    }
}

/// share of `total` carried by `part`
pub fn weight(part: Money, total: Money) -> Decimal {
    if total.is_zero() {
        return Decimal::ZERO;
    }
    part.as_decimal() / total.as_decimal()
}
