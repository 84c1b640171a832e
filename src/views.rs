//! Serialization support for loans.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::balance::{ItemStatus, LedgerBalance};
use crate::decimal::{Money, Rate};
use crate::late_fee::LateFeeBreakdown;
use crate::state::LedgerState;
use crate::types::{AmortizationKind, InstallmentKind, LoanId, LoanStatus, PaymentFrequency};

/// serializable view of a loan's derived position
#[derive(Debug, Serialize, Deserialize)]
pub struct LoanView {
    pub id: LoanId,
    pub status: LoanStatus,
    pub as_of: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub terms: TermsView,
    pub balance: BalanceView,
    pub next_due: Option<DueItemView>,
    pub schedule: ScheduleView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TermsView {
    pub amount: Money,
    pub interest_rate: Rate,
    pub term: u32,
    pub amortization: AmortizationKind,
    pub frequency: PaymentFrequency,
    pub start_date: NaiveDate,
    pub late_fee_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceView {
    pub principal_pending: Money,
    pub interest_pending: Money,
    pub charges_pending: Money,
    pub late_fee_pending: Money,
    /// principal, interest and charges; late fees are reported separately
    pub total: Money,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DueItemView {
    pub number: u32,
    pub kind: InstallmentKind,
    pub due_date: NaiveDate,
    pub amount_due: Money,
    pub days_overdue: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleView {
    pub installments: usize,
    pub charges: usize,
    pub paid: usize,
    pub settled: usize,
    pub overdue: usize,
    pub payment_count: usize,
    pub capital_payment_count: usize,
    pub last_payment_date: Option<NaiveDate>,
}

impl LoanView {
    pub fn new(
        state: &LedgerState,
        balance: &LedgerBalance,
        late_fees: &LateFeeBreakdown,
        as_of: NaiveDate,
        tolerance: Money,
    ) -> Self {
        let loan = &state.loan;
        let count = |f: fn(&ItemStatus) -> bool| balance.items.iter().filter(|i| f(i)).count();

        LoanView {
            id: loan.id,
            status: loan.status,
            as_of,
            created_at: loan.created_at,
            terms: TermsView {
                amount: loan.amount,
                interest_rate: loan.interest_rate,
                term: loan.term,
                amortization: loan.amortization,
                frequency: loan.frequency,
                start_date: loan.start_date,
                late_fee_enabled: loan.late_fee.enabled,
            },
            balance: BalanceView {
                principal_pending: balance.principal_pending,
                interest_pending: balance.interest_pending,
                charges_pending: balance.charges_pending,
                late_fee_pending: late_fees.payable(loan.late_fee_balance),
                total: balance.total,
            },
            next_due: balance.current_due(tolerance).map(|item| DueItemView {
                number: item.number,
                kind: item.kind,
                due_date: item.due_date,
                amount_due: item.outstanding(),
                days_overdue: (as_of - item.due_date).num_days().max(0),
            }),
            schedule: ScheduleView {
                installments: count(|i| i.kind == InstallmentKind::Regular),
                charges: count(|i| i.kind == InstallmentKind::Charge),
                paid: count(|i| i.paid),
                settled: count(|i| i.settled),
                overdue: balance.overdue_items(as_of, tolerance).len(),
                payment_count: state.payments.len(),
                capital_payment_count: state.capital_payments.len(),
                last_payment_date: state.payments.iter().map(|p| p.paid_on).max(),
            },
        }
    }

    /// convert to pretty-printed json string
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
