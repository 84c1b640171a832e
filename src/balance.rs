//! Balance reconstruction.
//!
//! The outstanding balance is always re-derived from the installment and
//! payment history. Payments are matched to rows by their attributed due date
//! and target kind; rows sharing a due date are filled in ascending sequence
//! order, interest before principal for regular installments.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::state::LedgerState;
use crate::types::{InstallmentId, InstallmentKind, PaymentTarget};

/// replayed position of one installment or charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStatus {
    pub installment_id: InstallmentId,
    pub number: u32,
    pub kind: InstallmentKind,
    pub due_date: NaiveDate,
    pub expected_principal: Money,
    pub expected_interest: Money,
    pub paid_principal: Money,
    pub paid_interest: Money,
    pub paid: bool,
    pub settled: bool,
}

impl ItemStatus {
    pub fn is_closed(&self) -> bool {
        self.paid || self.settled
    }

    pub fn principal_due(&self) -> Money {
        if self.is_closed() {
            return Money::ZERO;
        }
        (self.expected_principal - self.paid_principal).non_negative()
    }

    pub fn interest_due(&self) -> Money {
        if self.is_closed() {
            return Money::ZERO;
        }
        (self.expected_interest - self.paid_interest).non_negative()
    }

    pub fn outstanding(&self) -> Money {
        self.principal_due() + self.interest_due()
    }

    /// accumulated payments cover the full expected total
    pub fn is_covered(&self, tolerance: Money) -> bool {
        let expected = self.expected_principal + self.expected_interest;
        let paid = self.paid_principal + self.paid_interest;
        (expected - paid) <= tolerance
    }
}

/// derived outstanding position of a loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub principal_pending: Money,
    pub interest_pending: Money,
    pub charges_pending: Money,
    pub total: Money,
    /// per-row replay in due-date order
    pub items: Vec<ItemStatus>,
}

impl LedgerBalance {
    pub fn item(&self, id: InstallmentId) -> Option<&ItemStatus> {
        self.items.iter().find(|i| i.installment_id == id)
    }

    /// first open item, by due date, with more than `tolerance` outstanding
    pub fn current_due(&self, tolerance: Money) -> Option<&ItemStatus> {
        self.items
            .iter()
            .find(|i| !i.is_closed() && i.outstanding() > tolerance)
    }

    /// open items with an outstanding amount whose due date is before `as_of`
    pub fn overdue_items(&self, as_of: NaiveDate, tolerance: Money) -> Vec<&ItemStatus> {
        self.items
            .iter()
            .filter(|i| !i.is_closed() && i.due_date < as_of && i.outstanding() > tolerance)
            .collect()
    }

    pub fn is_cleared(&self, tolerance: Money) -> bool {
        self.total <= tolerance
    }
}

/// replays installments and payments into a balance
pub struct BalanceEngine {
    tolerance: Money,
}

impl BalanceEngine {
    pub fn new(tolerance: Money) -> Self {
        Self { tolerance }
    }

    pub fn compute(&self, state: &LedgerState) -> Result<LedgerBalance> {
        let indefinite = state.loan.is_indefinite();
        if indefinite {
            if let Some(row) = state
                .installments
                .iter()
                .find(|i| i.kind == InstallmentKind::Regular && !i.principal.is_zero())
            {
                return Err(LedgerError::Reconciliation {
                    component: "indefinite installment principal",
                    expected: Money::ZERO,
                    actual: row.principal,
                });
            }
        }

        let items = replay(state);

        let mut principal_pending = Money::ZERO;
        let mut interest_pending = Money::ZERO;
        let mut charges_pending = Money::ZERO;

        // a row covered within tolerance owes nothing
        for item in items.iter().filter(|i| !i.is_closed() && !i.is_covered(self.tolerance)) {
            match item.kind {
                InstallmentKind::Regular => {
                    principal_pending += item.principal_due();
                    interest_pending += item.interest_due();
                }
                InstallmentKind::Charge => charges_pending += item.outstanding(),
            }
        }

        if indefinite {
            principal_pending = state.loan.amount;
        }

        let total = principal_pending + interest_pending + charges_pending;

        debug!(
            loan_id = %state.loan.id,
            principal = %principal_pending,
            interest = %interest_pending,
            charges = %charges_pending,
            total = %total,
            "balance reconstructed"
        );

        Ok(LedgerBalance {
            principal_pending,
            interest_pending,
            charges_pending,
            total,
            items,
        })
    }
}

#[derive(Default, Clone, Copy)]
struct Pool {
    principal: Money,
    interest: Money,
}

/// match payments to rows by (kind, due date), filling rows in sequence order
fn replay(state: &LedgerState) -> Vec<ItemStatus> {
    let mut pools: HashMap<(InstallmentKind, NaiveDate), Pool> = HashMap::new();
    for payment in &state.payments {
        let kind = match payment.target {
            PaymentTarget::Installment => InstallmentKind::Regular,
            PaymentTarget::Charge => InstallmentKind::Charge,
            PaymentTarget::Settlement => continue,
        };
        let pool = pools.entry((kind, payment.due_date)).or_default();
        pool.principal += payment.principal;
        pool.interest += payment.interest;
    }

    let mut order: Vec<usize> = (0..state.installments.len()).collect();
    order.sort_by_key(|&idx| {
        let row = &state.installments[idx];
        (row.due_date, row.number)
    });

    let mut items = Vec::with_capacity(order.len());
    for idx in order {
        let row = &state.installments[idx];
        let pool = pools.entry((row.kind, row.due_date)).or_default();

        let (paid_principal, paid_interest) = match row.kind {
            InstallmentKind::Regular => {
                let interest = pool.interest.min(row.interest).non_negative();
                pool.interest -= interest;
                let principal = pool.principal.min(row.principal).non_negative();
                pool.principal -= principal;
                (principal, interest)
            }
            InstallmentKind::Charge => {
                // charges carry no interest; every paid cent counts toward the total
                let available = pool.principal + pool.interest;
                let applied = available.min(row.total).non_negative();
                let from_principal = applied.min(pool.principal);
                pool.principal -= from_principal;
                pool.interest -= applied - from_principal;
                (applied, Money::ZERO)
            }
        };

        items.push(ItemStatus {
            installment_id: row.id,
            number: row.number,
            kind: row.kind,
            due_date: row.due_date,
            expected_principal: row.principal,
            expected_interest: row.interest,
            paid_principal,
            paid_interest,
            paid: row.paid,
            settled: row.settled,
        });
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoanTerms;
    use crate::decimal::Rate;
    use crate::payments::schedule::ScheduleGenerator;
    use crate::state::Loan;
    use crate::types::{Installment, Payment, PaymentFrequency};
    use chrono::Utc;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn simple_state() -> LedgerState {
        let terms = LoanTerms::monthly_simple(
            Money::from_major(10_000),
            Rate::from_percentage(2),
            10,
            date(2024, 1, 1),
        );
        let loan = Loan::from_terms(&terms, Utc::now());
        let rows = ScheduleGenerator::new(&loan).generate().unwrap();
        LedgerState::new(loan, rows, Vec::new(), Vec::new())
    }

    fn payment(state: &LedgerState, target: PaymentTarget, due: NaiveDate, principal: i64, interest: i64) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            loan_id: state.loan.id,
            amount: Money::from_major(principal + interest),
            principal: Money::from_major(principal),
            interest: Money::from_major(interest),
            late_fee: Money::ZERO,
            target,
            due_date: due,
            paid_on: due,
            reference: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_fresh_loan_balance() {
        let state = simple_state();
        let balance = BalanceEngine::new(Money::CENT).compute(&state).unwrap();

        assert_eq!(balance.principal_pending, Money::from_major(10_000));
        assert_eq!(balance.interest_pending, Money::from_major(2_000));
        assert_eq!(balance.charges_pending, Money::ZERO);
        assert_eq!(balance.total, Money::from_major(12_000));
    }

    #[test]
    fn test_full_payment_reduces_principal_by_installment_share() {
        let mut state = simple_state();
        let engine = BalanceEngine::new(Money::CENT);
        let before = engine.compute(&state).unwrap();

        let due = state.installments[0].due_date;
        let p = payment(&state, PaymentTarget::Installment, due, 1_000, 200);
        state.payments.push(p);

        let after = engine.compute(&state).unwrap();
        assert_eq!(before.principal_pending - after.principal_pending, Money::from_major(1_000));
        assert_eq!(before.total - after.total, Money::from_major(1_200));
    }

    #[test]
    fn test_charges_do_not_absorb_installment_payments() {
        let mut state = simple_state();
        let due = state.installments[0].due_date;
        let number = state.next_number();
        state.installments.push(Installment::charge(state.loan.id, number, due, Money::from_major(50), None));
        state = LedgerState::new(state.loan, state.installments, state.payments, state.capital_payments);

        let p = payment(&state, PaymentTarget::Installment, due, 1_000, 200);
        state.payments.push(p);

        let balance = BalanceEngine::new(Money::CENT).compute(&state).unwrap();
        assert_eq!(balance.charges_pending, Money::from_major(50));

        let current = balance.current_due(Money::CENT).unwrap();
        assert_eq!(current.kind, InstallmentKind::Charge);
        assert_eq!(current.due_date, due);
    }

    #[test]
    fn test_charges_sharing_due_date_fill_in_sequence_order() {
        let state = simple_state();
        let loan_id = state.loan.id;
        let due = date(2024, 6, 15);
        let mut rows = state.installments.clone();
        rows.push(Installment::charge(loan_id, 12, due, Money::from_major(30), None));
        rows.push(Installment::charge(loan_id, 11, due, Money::from_major(20), None));
        let mut state = LedgerState::new(state.loan, rows, Vec::new(), Vec::new());

        let p = payment(&state, PaymentTarget::Charge, due, 25, 0);
        state.payments.push(p);

        let balance = BalanceEngine::new(Money::CENT).compute(&state).unwrap();
        let charges: Vec<&ItemStatus> = balance.items.iter().filter(|i| i.kind == InstallmentKind::Charge).collect();

        assert_eq!(charges[0].number, 11);
        assert_eq!(charges[0].outstanding(), Money::ZERO);
        assert_eq!(charges[1].number, 12);
        assert_eq!(charges[1].outstanding(), Money::from_major(25));
        assert_eq!(balance.charges_pending, Money::from_major(25));
    }

    #[test]
    fn test_indefinite_uses_loan_amount_for_principal() {
        let terms = LoanTerms::indefinite(
            Money::from_major(5_000),
            Rate::from_percentage(3),
            4,
            PaymentFrequency::Monthly,
            date(2024, 1, 1),
        );
        let loan = Loan::from_terms(&terms, Utc::now());
        let rows = ScheduleGenerator::new(&loan).generate().unwrap();
        let state = LedgerState::new(loan, rows, Vec::new(), Vec::new());

        let balance = BalanceEngine::new(Money::CENT).compute(&state).unwrap();
        assert_eq!(balance.principal_pending, Money::from_major(5_000));
        assert_eq!(balance.interest_pending, Money::from_major(600));
    }

    #[test]
    fn test_indefinite_rejects_principal_rows() {
        let terms = LoanTerms::indefinite(
            Money::from_major(5_000),
            Rate::from_percentage(3),
            2,
            PaymentFrequency::Monthly,
            date(2024, 1, 1),
        );
        let loan = Loan::from_terms(&terms, Utc::now());
        let mut rows = ScheduleGenerator::new(&loan).generate().unwrap();
        rows[0].set_amounts(Money::from_major(10), Money::from_major(150));
        let state = LedgerState::new(loan, rows, Vec::new(), Vec::new());

        let err = BalanceEngine::new(Money::CENT).compute(&state).unwrap_err();
        assert!(matches!(err, LedgerError::Reconciliation { .. }));
    }

    #[test]
    fn test_settled_rows_contribute_nothing() {
        let mut state = simple_state();
        for row in state.installments.iter_mut() {
            row.settled = true;
        }

        let balance = BalanceEngine::new(Money::CENT).compute(&state).unwrap();
        assert_eq!(balance.total, Money::ZERO);
        assert!(balance.current_due(Money::CENT).is_none());
    }

    #[test]
    fn test_overdue_items() {
        let state = simple_state();
        let balance = BalanceEngine::new(Money::CENT).compute(&state).unwrap();

        // first due date is 2024-02-01
        assert!(balance.overdue_items(date(2024, 2, 1), Money::CENT).is_empty());
        assert_eq!(balance.overdue_items(date(2024, 3, 15), Money::CENT).len(), 2);
    }
}
