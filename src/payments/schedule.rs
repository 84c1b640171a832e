use rust_decimal::Decimal;

use crate::decimal::{reconcile_last, Money, Rate};
use crate::errors::{LedgerError, Result};
use crate::state::Loan;
use crate::types::{AmortizationKind, Installment};

/// builds the regular installment rows for a loan
pub struct ScheduleGenerator<'a> {
    loan: &'a Loan,
}

impl<'a> ScheduleGenerator<'a> {
    pub fn new(loan: &'a Loan) -> Self {
        Self { loan }
    }

    /// generate `loan.term` rows starting one period after the start date
    pub fn generate(&self) -> Result<Vec<Installment>> {
        if self.loan.term == 0 {
            return Err(LedgerError::InvalidConfiguration {
                message: "term must be at least one period".to_string(),
            });
        }

        let (principals, interests) = match self.loan.amortization {
            AmortizationKind::Simple => self.simple_amounts(),
            AmortizationKind::French => self.french_amounts()?,
            AmortizationKind::Indefinite => self.indefinite_amounts(),
        };

        let mut rows = Vec::with_capacity(principals.len());
        for (i, (principal, interest)) in principals.into_iter().zip(interests).enumerate() {
            let number = i as u32 + 1;
            let due_date = self
                .loan
                .frequency
                .advance(self.loan.start_date, number)
                .ok_or_else(|| LedgerError::CalculationError {
                    message: format!("due date {} out of calendar range", number),
                })?;
            rows.push(Installment::regular(self.loan.id, number, due_date, principal, interest));
        }

        Ok(rows)
    }

    /// equal principal, flat interest on the original amount
    fn simple_amounts(&self) -> (Vec<Money>, Vec<Money>) {
        let principals = self.loan.amount.split_evenly(self.loan.term);
        let interest = self.loan.amount.percentage(self.loan.interest_rate);
        (principals, vec![interest; self.loan.term as usize])
    }

    /// annuity payment with interest on the declining balance
    fn french_amounts(&self) -> Result<(Vec<Money>, Vec<Money>)> {
        let rate = self.loan.interest_rate;
        if rate.is_zero() {
            return Ok(self.simple_amounts());
        }

        let payment = annuity_payment(self.loan.amount, rate, self.loan.term)?;

        let mut principals = Vec::with_capacity(self.loan.term as usize);
        let mut interests = Vec::with_capacity(self.loan.term as usize);
        let mut balance = self.loan.amount;

        for _ in 0..self.loan.term {
            let interest = balance.percentage(rate);
            let principal = (payment - interest).min(balance).non_negative();
            balance -= principal;
            principals.push(principal);
            interests.push(interest);
        }

        // last row takes whatever the rounded annuity left behind
        reconcile_last(&mut principals, self.loan.amount);

        Ok((principals, interests))
    }

    /// interest-only rows
    fn indefinite_amounts(&self) -> (Vec<Money>, Vec<Money>) {
        let interest = self.loan.amount.percentage(self.loan.interest_rate);
        let count = self.loan.term as usize;
        (vec![Money::ZERO; count], vec![interest; count])
    }
}

/// level payment: P * r * (1 + r)^n / ((1 + r)^n - 1)
pub fn annuity_payment(principal: Money, rate: Rate, periods: u32) -> Result<Money> {
    if periods == 0 {
        return Ok(principal);
    }

    let r = rate.as_decimal();
    if r.is_zero() {
        return Ok(principal / Decimal::from(periods));
    }

    let compound = compound_factor(r, periods)?;
    let numerator = principal.as_decimal() * r * compound;
    let denominator = compound - Decimal::ONE;

    Ok(Money::from_decimal(numerator / denominator))
}

/// (1 + r)^n, failing instead of overflowing
pub(crate) fn compound_factor(r: Decimal, periods: u32) -> Result<Decimal> {
    let base = Decimal::ONE + r;
    let mut compound = Decimal::ONE;
    for _ in 0..periods {
        compound = compound
            .checked_mul(base)
            .ok_or_else(|| LedgerError::CalculationError {
                message: format!("compound factor overflow after {} periods", periods),
            })?;
    }
    Ok(compound)
}
