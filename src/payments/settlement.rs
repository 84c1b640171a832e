use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::balance::LedgerBalance;
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::late_fee::LateFeeBreakdown;

/// amounts needed to close a loan early
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementBreakdown {
    pub as_of: NaiveDate,
    /// outstanding principal plus unpaid charges; never forgivable
    pub capital_pending: Money,
    pub interest_pending: Money,
    pub late_fee_pending: Money,
    pub total_to_settle: Money,
}

impl SettlementBreakdown {
    pub fn from_parts(
        balance: &LedgerBalance,
        late_fees: &LateFeeBreakdown,
        loan_level_late_fee: Money,
        as_of: NaiveDate,
    ) -> Self {
        let capital_pending = balance.principal_pending + balance.charges_pending;
        let interest_pending = balance.interest_pending;
        let late_fee_pending = late_fees.payable(loan_level_late_fee);

        Self {
            as_of,
            capital_pending,
            interest_pending,
            late_fee_pending,
            total_to_settle: capital_pending + interest_pending + late_fee_pending,
        }
    }
}

/// what the payer offers for each component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub capital: Money,
    pub interest: Money,
    pub late_fee: Money,
    pub reference: Option<String>,
}

impl SettlementRequest {
    /// pay everything that is pending
    pub fn full(breakdown: &SettlementBreakdown) -> Self {
        Self {
            capital: breakdown.capital_pending,
            interest: breakdown.interest_pending,
            late_fee: breakdown.late_fee_pending,
            reference: None,
        }
    }

    pub fn total(&self) -> Money {
        self.capital + self.interest + self.late_fee
    }

    /// full capital is required; interest and late fee may be partly forgiven
    pub fn validate(&self, breakdown: &SettlementBreakdown, tolerance: Money) -> Result<SettlementTerms> {
        for amount in [self.capital, self.interest, self.late_fee] {
            if amount.is_negative() {
                return Err(LedgerError::InvalidAmount { amount });
            }
        }

        if self.capital + tolerance < breakdown.capital_pending {
            return Err(LedgerError::CapitalShortfall {
                pending: breakdown.capital_pending,
                offered: self.capital,
            });
        }

        let limits = [
            (self.capital, breakdown.capital_pending),
            (self.interest, breakdown.interest_pending),
            (self.late_fee, breakdown.late_fee_pending),
        ];
        for (requested, maximum) in limits {
            if requested > maximum + tolerance {
                return Err(LedgerError::ExceedsMaximum { maximum, requested });
            }
        }

        let interest_paid = self.interest.min(breakdown.interest_pending);
        let late_fee_paid = self.late_fee.min(breakdown.late_fee_pending);

        Ok(SettlementTerms {
            capital_paid: breakdown.capital_pending,
            interest_paid,
            late_fee_paid,
            interest_forgiven: breakdown.interest_pending - interest_paid,
            late_fee_forgiven: breakdown.late_fee_pending - late_fee_paid,
        })
    }
}

/// validated settlement split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementTerms {
    pub capital_paid: Money,
    pub interest_paid: Money,
    pub late_fee_paid: Money,
    pub interest_forgiven: Money,
    pub late_fee_forgiven: Money,
}

impl SettlementTerms {
    pub fn total_paid(&self) -> Money {
        self.capital_paid + self.interest_paid + self.late_fee_paid
    }

    pub fn total_forgiven(&self) -> Money {
        self.interest_forgiven + self.late_fee_forgiven
    }
}
