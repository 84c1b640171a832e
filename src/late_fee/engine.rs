use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::balance::LedgerBalance;
use crate::config::{LateFeeAccrual, LateFeeBasis, LateFeeConfig};
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::payments::schedule::compound_factor;
use crate::state::{LedgerState, Loan};
use crate::types::{days_between, Installment, InstallmentId, InstallmentKind};

/// late fee for one installment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateFeeCalculation {
    pub days_overdue: u32,
    pub basis: Money,
    /// fee before subtracting what was already paid or waived
    pub gross_fee: Money,
    pub already_paid: Money,
    /// remaining fee
    pub fee: Money,
    pub capped: bool,
}

impl LateFeeCalculation {
    fn none(basis: Money, already_paid: Money) -> Self {
        Self {
            days_overdue: 0,
            basis,
            gross_fee: Money::ZERO,
            already_paid,
            fee: Money::ZERO,
            capped: false,
        }
    }
}

/// per-installment entry of a breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallmentLateFee {
    pub installment_id: InstallmentId,
    pub number: u32,
    pub kind: InstallmentKind,
    pub due_date: NaiveDate,
    pub calculation: LateFeeCalculation,
}

impl InstallmentLateFee {
    pub fn fee(&self) -> Money {
        self.calculation.fee
    }
}

/// late fees across a loan as of one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateFeeBreakdown {
    pub as_of: NaiveDate,
    /// overdue open rows in due-date order
    pub items: Vec<InstallmentLateFee>,
    pub total_late_fee: Money,
}

impl LateFeeBreakdown {
    pub fn empty(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            items: Vec::new(),
            total_late_fee: Money::ZERO,
        }
    }

    /// fee currently owed, falling back to the loan-level counter when no row accrues
    pub fn payable(&self, loan_level_balance: Money) -> Money {
        if self.total_late_fee.is_zero() {
            loan_level_balance
        } else {
            self.total_late_fee
        }
    }
}

/// engine for calculating late fees
pub struct LateFeeEngine<'a> {
    pub config: &'a LateFeeConfig,
    /// regular rows carry no principal
    interest_only: bool,
}

impl<'a> LateFeeEngine<'a> {
    pub fn new(config: &'a LateFeeConfig) -> Self {
        Self {
            config,
            interest_only: false,
        }
    }

    /// engine for a loan's own late-fee terms
    pub fn for_loan(loan: &'a Loan) -> Self {
        Self {
            config: &loan.late_fee,
            interest_only: loan.is_indefinite(),
        }
    }

    /// amount the rate applies to for this row
    ///
    /// Interest-only rows have no principal, so a principal basis falls back
    /// to the amount the row is due.
    pub fn basis_for(&self, installment: &Installment) -> Money {
        match self.config.basis {
            LateFeeBasis::Principal if self.interest_only && installment.kind == InstallmentKind::Regular => {
                installment.total
            }
            LateFeeBasis::Principal => installment.principal,
            LateFeeBasis::InstallmentTotal => installment.total,
        }
    }

    /// fee for one due item as of `as_of`
    pub fn calculate(
        &self,
        basis: Money,
        due_date: NaiveDate,
        as_of: NaiveDate,
        late_fee_paid: Money,
    ) -> Result<LateFeeCalculation> {
        if !self.config.enabled {
            return Ok(LateFeeCalculation::none(basis, late_fee_paid));
        }

        let days_late = days_between(as_of, due_date);
        let days_overdue = days_late - self.config.grace_period_days as i64;
        if days_overdue <= 0 {
            return Ok(LateFeeCalculation::none(basis, late_fee_paid));
        }
        let days_overdue = u32::try_from(days_overdue).map_err(|_| LedgerError::CalculationError {
            message: format!("{} days overdue out of range", days_overdue),
        })?;

        let cap = self.config.max_late_fee;
        let rate = self.config.rate.as_decimal();

        let raw = match self.config.accrual {
            LateFeeAccrual::Daily => Some(basis.as_decimal() * rate * Decimal::from(days_overdue)),
            LateFeeAccrual::Monthly => {
                let months = days_overdue.div_ceil(30);
                Some(basis.as_decimal() * rate * Decimal::from(months))
            }
            LateFeeAccrual::Compound => match compound_factor(rate, days_overdue) {
                Ok(factor) => basis.as_decimal().checked_mul(factor - Decimal::ONE),
                // an overflowing factor is only usable when the cap bounds it
                Err(err) if !cap.is_positive() => return Err(err),
                Err(_) => None,
            },
        };

        let (gross_fee, capped) = match raw {
            Some(raw) => {
                let fee = Money::from_decimal(raw);
                if cap.is_positive() && fee > cap {
                    (cap, true)
                } else {
                    (fee, false)
                }
            }
            None => (cap, true),
        };

        Ok(LateFeeCalculation {
            days_overdue,
            basis,
            gross_fee,
            already_paid: late_fee_paid,
            fee: (gross_fee - late_fee_paid).non_negative(),
            capped,
        })
    }

    /// fee for every open, overdue row of the loan
    pub fn breakdown(
        &self,
        state: &LedgerState,
        balance: &LedgerBalance,
        as_of: NaiveDate,
        tolerance: Money,
    ) -> Result<LateFeeBreakdown> {
        if !self.config.enabled {
            return Ok(LateFeeBreakdown::empty(as_of));
        }

        let mut items = Vec::new();
        for row in state.installments.iter().filter(|i| i.is_open()) {
            // rows already covered by payments accrue nothing
            let covered = balance
                .item(row.id)
                .map(|s| s.outstanding() <= tolerance)
                .unwrap_or(false);
            if covered {
                continue;
            }

            let calculation = self.calculate(self.basis_for(row), row.due_date, as_of, row.late_fee_paid)?;
            if calculation.days_overdue == 0 {
                continue;
            }

            items.push(InstallmentLateFee {
                installment_id: row.id,
                number: row.number,
                kind: row.kind,
                due_date: row.due_date,
                calculation,
            });
        }

        let total_late_fee: Money = items.iter().map(|i| i.fee()).sum();

        debug!(
            loan_id = %state.loan.id,
            %as_of,
            overdue_rows = items.len(),
            total = %total_late_fee,
            "late fee breakdown computed"
        );

        Ok(LateFeeBreakdown {
            as_of,
            items,
            total_late_fee,
        })
    }
}
