//! Schedule restructuring after an out-of-schedule principal payment.
//!
//! A prepayment either shrinks every remaining installment (count held) or
//! drops trailing installments (size held). French loans are re-amortized
//! on the declining balance in both cases. Charges are never touched and
//! paid rows are never altered. The resulting [`ScheduleDiff`] is checked for
//! cent-exact reconciliation before anything is handed back for persistence.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::balance::{ItemStatus, LedgerBalance};
use crate::decimal::{reconcile_last, Money, Rate};
use crate::payments::schedule::annuity_payment;
use crate::errors::{LedgerError, Result};
use crate::state::LedgerState;
use crate::types::{AmortizationKind, Installment, InstallmentId, InstallmentKind};

/// extra principal payment request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepaymentRequest {
    pub amount: Money,
    /// hold the number of installments and shrink each one
    pub keep_installment_count: bool,
    /// penalty on the principal pending before the prepayment
    pub penalty_rate: Option<Rate>,
    /// pending principal the caller saw when it previewed
    pub capital_before: Option<Money>,
}

impl PrepaymentRequest {
    pub fn new(amount: Money, keep_installment_count: bool) -> Self {
        Self {
            amount,
            keep_installment_count,
            penalty_rate: None,
            capital_before: None,
        }
    }

    pub fn with_penalty(mut self, rate: Rate) -> Self {
        self.penalty_rate = Some(rate);
        self
    }

    /// pin the request to the principal shown in a preview
    pub fn observed(mut self, capital_before: Money) -> Self {
        self.capital_before = Some(capital_before);
        self
    }
}

/// before/after amounts of one rewritten row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub installment_id: InstallmentId,
    pub number: u32,
    pub due_date: NaiveDate,
    pub old_principal: Money,
    pub old_interest: Money,
    pub new_principal: Money,
    pub new_interest: Money,
}

/// restructured schedule, ready to preview or persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDiff {
    pub amount: Money,
    pub capital_before: Money,
    pub capital_after: Money,
    pub keep_installment_count: bool,
    /// open regular rows before and after
    pub old_count: usize,
    pub new_count: usize,
    pub changes: Vec<RowChange>,
    /// interest still owed on regular rows once the diff is applied
    pub interest_after: Money,
    /// rows to upsert
    pub updated: Vec<Installment>,
    /// rows to delete
    pub removed: Vec<InstallmentId>,
    pub penalty: Option<Money>,
    pub penalty_charge: Option<Installment>,
    /// new principal for indefinite loans
    pub new_loan_amount: Option<Money>,
}

impl ScheduleDiff {
    pub fn pays_off(&self, tolerance: Money) -> bool {
        self.capital_after.is_negligible(tolerance)
    }

    /// project the restructured schedule onto an in-memory snapshot
    pub fn apply_to(&self, state: &mut LedgerState) {
        state.installments.retain(|row| !self.removed.contains(&row.id));
        for row in &self.updated {
            match state.installments.iter_mut().find(|r| r.id == row.id) {
                Some(existing) => *existing = row.clone(),
                None => state.installments.push(row.clone()),
            }
        }
        if let Some(charge) = &self.penalty_charge {
            state.installments.push(charge.clone());
        }
        if let Some(amount) = self.new_loan_amount {
            state.loan.amount = amount;
        }
        state.installments.sort_by_key(|i| (i.due_date, i.number));
    }
}

/// recomputes the unpaid part of a schedule after a prepayment
pub struct PrepaymentRestructurer<'a> {
    state: &'a LedgerState,
    balance: &'a LedgerBalance,
    tolerance: Money,
}

impl<'a> PrepaymentRestructurer<'a> {
    pub fn new(state: &'a LedgerState, balance: &'a LedgerBalance, tolerance: Money) -> Self {
        Self {
            state,
            balance,
            tolerance,
        }
    }

    /// principal the prepayment is measured against
    pub fn pending_principal(&self) -> Money {
        if self.state.loan.is_indefinite() {
            self.state.loan.amount
        } else {
            self.balance.principal_pending
        }
    }

    pub fn plan(&self, request: &PrepaymentRequest, as_of: NaiveDate) -> Result<ScheduleDiff> {
        let overdue: Vec<&ItemStatus> = self
            .balance
            .overdue_items(as_of, self.tolerance)
            .into_iter()
            .filter(|i| i.kind == InstallmentKind::Regular)
            .collect();
        if let Some(oldest) = overdue.first() {
            return Err(LedgerError::OverdueInstallments {
                count: overdue.len(),
                oldest: oldest.due_date,
            });
        }

        let capital_before = self.pending_principal();
        if !request.amount.is_positive() {
            return Err(LedgerError::InvalidAmount {
                amount: request.amount,
            });
        }
        if request.amount > capital_before + self.tolerance {
            return Err(LedgerError::ExceedsMaximum {
                maximum: capital_before,
                requested: request.amount,
            });
        }
        let capital_after = (capital_before - request.amount).non_negative();

        let rows = self.unpaid_rows();
        let old_count = rows.len();

        let mut diff = ScheduleDiff {
            amount: request.amount,
            capital_before,
            capital_after,
            keep_installment_count: request.keep_installment_count,
            old_count,
            new_count: old_count,
            changes: Vec::new(),
            interest_after: self.covered_interest(),
            updated: Vec::new(),
            removed: Vec::new(),
            penalty: None,
            penalty_charge: None,
            new_loan_amount: None,
        };

        if self.state.loan.is_indefinite() {
            diff.new_loan_amount = Some(capital_after);
        }

        if diff.pays_off(self.tolerance) {
            self.retire_all(&rows, &mut diff);
        } else if self.state.loan.is_indefinite() {
            self.reprice_interest_only(&rows, capital_after, &mut diff);
        } else if self.state.loan.amortization == AmortizationKind::French {
            self.reamortize(&rows, capital_after, request.keep_installment_count, &mut diff)?;
        } else if request.keep_installment_count {
            self.shrink_installments(&rows, capital_after, &mut diff)?;
        } else {
            self.shrink_term(&rows, capital_after, &mut diff)?;
        }

        self.attach_penalty(request, as_of, &mut diff);
        self.verify(&diff)?;

        debug!(
            loan_id = %self.state.loan.id,
            capital_before = %diff.capital_before,
            capital_after = %diff.capital_after,
            old_count = diff.old_count,
            new_count = diff.new_count,
            removed = diff.removed.len(),
            "prepayment planned"
        );

        Ok(diff)
    }

    /// open regular rows with something still owed, in due-date order
    fn unpaid_rows(&self) -> Vec<(&'a Installment, &'a ItemStatus)> {
        self.state
            .open_regular()
            .filter_map(|row| self.balance.item(row.id).map(|item| (row, item)))
            .filter(|(_, item)| !item.is_covered(self.tolerance))
            .collect()
    }

    /// interest still owed on open rows that payments already cover
    fn covered_interest(&self) -> Money {
        self.state
            .open_regular()
            .filter_map(|row| self.balance.item(row.id))
            .filter(|item| item.is_covered(self.tolerance))
            .map(|item| item.interest_due())
            .sum()
    }

    /// interest-only rows priced off the new principal
    fn reprice_interest_only(
        &self,
        rows: &[(&Installment, &ItemStatus)],
        capital_after: Money,
        diff: &mut ScheduleDiff,
    ) {
        let interest = capital_after.percentage(self.state.loan.interest_rate);
        for (row, item) in rows {
            self.rewrite(row, item, Money::ZERO, interest, diff);
        }
    }

    /// keep the count, spread the new principal evenly
    fn shrink_installments(
        &self,
        rows: &[(&Installment, &ItemStatus)],
        capital_after: Money,
        diff: &mut ScheduleDiff,
    ) -> Result<()> {
        if rows.is_empty() {
            return Err(LedgerError::NothingDue);
        }

        let shares = capital_after.split_evenly(rows.len() as u32);
        let interest = capital_after.percentage(self.state.loan.interest_rate);
        for ((row, item), share) in rows.iter().zip(shares) {
            self.rewrite(row, item, share, interest, diff);
        }
        Ok(())
    }

    /// keep the installment size, drop surplus trailing rows
    fn shrink_term(
        &self,
        rows: &[(&Installment, &ItemStatus)],
        capital_after: Money,
        diff: &mut ScheduleDiff,
    ) -> Result<()> {
        let Some((first, _)) = rows.first() else {
            return Err(LedgerError::NothingDue);
        };

        let principal_per = first.principal;
        if !principal_per.is_positive() {
            return Err(LedgerError::CalculationError {
                message: format!("installment principal {} cannot size a shorter term", principal_per),
            });
        }

        let needed = (capital_after.as_decimal() / principal_per.as_decimal())
            .ceil()
            .to_usize()
            .ok_or_else(|| LedgerError::CalculationError {
                message: format!("installment count for {} out of range", capital_after),
            })?;
        let new_count = needed.clamp(1, rows.len());

        let mut shares = vec![principal_per; new_count];
        reconcile_last(&mut shares, capital_after);

        for ((row, item), share) in rows.iter().zip(shares) {
            self.rewrite(row, item, share, row.interest, diff);
        }
        for (row, item) in &rows[new_count..] {
            self.retire(row, item, diff);
        }
        diff.new_count = new_count;
        Ok(())
    }

    /// level payment on the declining balance
    ///
    /// Holding the count prices a new annuity over the same rows. Holding the
    /// size keeps the current row total and retires the rows it no longer needs.
    fn reamortize(
        &self,
        rows: &[(&Installment, &ItemStatus)],
        capital_after: Money,
        keep_count: bool,
        diff: &mut ScheduleDiff,
    ) -> Result<()> {
        let Some((first, _)) = rows.first() else {
            return Err(LedgerError::NothingDue);
        };

        let rate = self.state.loan.interest_rate;
        let payment = if keep_count {
            annuity_payment(capital_after, rate, rows.len() as u32)?
        } else {
            first.total
        };
        if payment <= capital_after.percentage(rate) {
            return Err(LedgerError::CalculationError {
                message: format!("payment {} does not cover interest on {}", payment, capital_after),
            });
        }

        let mut balance = capital_after;
        let mut kept = 0;
        for (i, (row, item)) in rows.iter().enumerate() {
            if !balance.is_positive() {
                break;
            }
            let interest = balance.percentage(rate).max(item.paid_interest);
            let mut room = payment - interest;
            if !keep_count {
                // the row total stays within the held payment
                room -= item.paid_principal;
            }
            let share = if i + 1 == rows.len() {
                balance
            } else {
                room.non_negative().min(balance)
            };
            balance -= share;
            self.rewrite(row, item, share, interest, diff);
            kept += 1;
        }
        for (row, item) in &rows[kept..] {
            self.retire(row, item, diff);
        }
        diff.new_count = kept;
        Ok(())
    }

    /// principal fully prepaid: nothing regular stays open
    fn retire_all(&self, rows: &[(&Installment, &ItemStatus)], diff: &mut ScheduleDiff) {
        for (row, item) in rows {
            self.retire(row, item, diff);
        }
        diff.new_count = 0;
    }

    /// delete an untouched row, or close a partially paid one at what it received
    fn retire(&self, row: &Installment, item: &ItemStatus, diff: &mut ScheduleDiff) {
        if item.paid_principal.is_zero() && item.paid_interest.is_zero() {
            diff.removed.push(row.id);
            return;
        }

        let mut closed = row.clone();
        closed.set_amounts(item.paid_principal, item.paid_interest);
        closed.paid = true;
        diff.changes.push(change(row, &closed));
        diff.updated.push(closed);
    }

    /// `share` is the principal still to be paid on the row
    fn rewrite(&self, row: &Installment, item: &ItemStatus, share: Money, interest: Money, diff: &mut ScheduleDiff) {
        let mut next = row.clone();
        next.set_amounts(item.paid_principal + share, interest.max(item.paid_interest));
        diff.interest_after += next.interest - item.paid_interest;
        if next.principal != row.principal || next.interest != row.interest {
            diff.changes.push(change(row, &next));
            diff.updated.push(next);
        }
    }

    fn attach_penalty(&self, request: &PrepaymentRequest, as_of: NaiveDate, diff: &mut ScheduleDiff) {
        let Some(rate) = request.penalty_rate else {
            return;
        };
        let penalty = diff.capital_before.percentage(rate);
        if !penalty.is_positive() {
            return;
        }

        diff.penalty = Some(penalty);
        diff.penalty_charge = Some(Installment::charge(
            self.state.loan.id,
            self.state.next_number(),
            as_of,
            penalty,
            Some(format!("prepayment penalty ({})", rate)),
        ));
    }

    /// principal still owed on the projected rows must equal the new capital
    fn verify(&self, diff: &ScheduleDiff) -> Result<()> {
        let mut projected = self.state.clone();
        diff.apply_to(&mut projected);

        let mut outstanding = Money::ZERO;
        let mut interest = Money::ZERO;
        for row in projected.open_regular() {
            if self.state.loan.is_indefinite() && !row.principal.is_zero() {
                return self.fail("indefinite installment principal", Money::ZERO, row.principal);
            }
            let (paid, paid_interest) = self
                .balance
                .item(row.id)
                .map(|i| (i.paid_principal, i.paid_interest))
                .unwrap_or((Money::ZERO, Money::ZERO));
            let due = row.principal - paid;
            if due.is_negative() {
                return self.fail("installment principal", paid, row.principal);
            }
            outstanding += due;
            interest += (row.interest - paid_interest).non_negative();
        }

        if !interest.approx_eq(diff.interest_after, self.tolerance) {
            return self.fail("restructured interest", diff.interest_after, interest);
        }
        // prepaid principal never raises the interest still owed
        if interest > self.balance.interest_pending + self.tolerance {
            return self.fail("interest after prepayment", self.balance.interest_pending, interest);
        }

        let expected = if self.state.loan.is_indefinite() {
            Money::ZERO
        } else {
            diff.capital_after
        };
        if !outstanding.approx_eq(expected, self.tolerance) {
            return self.fail("restructured principal", expected, outstanding);
        }
        Ok(())
    }

    fn fail(&self, component: &'static str, expected: Money, actual: Money) -> Result<()> {
        error!(
            loan_id = %self.state.loan.id,
            component,
            %expected,
            %actual,
            "restructured schedule does not reconcile"
        );
        Err(LedgerError::Reconciliation {
            component,
            expected,
            actual,
        })
    }
}

fn change(old: &Installment, new: &Installment) -> RowChange {
    RowChange {
        installment_id: old.id,
        number: old.number,
        due_date: old.due_date,
        old_principal: old.principal,
        old_interest: old.interest,
        new_principal: new.principal,
        new_interest: new.interest,
    }
}
