use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Money;

/// unique identifier for a loan
pub type LoanId = Uuid;

/// unique identifier for an installment or charge row
pub type InstallmentId = Uuid;

/// unique identifier for a payment record
pub type PaymentId = Uuid;

/// unique identifier for a capital payment record
pub type CapitalPaymentId = Uuid;

/// signed whole days from `earlier` to `later`
pub fn days_between(later: NaiveDate, earlier: NaiveDate) -> i64 {
    (later - earlier).num_days()
}

/// how scheduled installments split principal and interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmortizationKind {
    /// equal principal shares, flat interest on the original amount
    Simple,
    /// equal total payments, interest on the declining balance
    French,
    /// interest-only rows; principal moves only through capital payments
    Indefinite,
}

/// spacing between scheduled due dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentFrequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
}

impl PaymentFrequency {
    /// due date `periods` steps after `start`
    pub fn advance(&self, start: NaiveDate, periods: u32) -> Option<NaiveDate> {
        match self {
            PaymentFrequency::Daily => start.checked_add_days(Days::new(periods as u64)),
            PaymentFrequency::Weekly => start.checked_add_days(Days::new(7 * periods as u64)),
            PaymentFrequency::Biweekly => start.checked_add_days(Days::new(14 * periods as u64)),
            PaymentFrequency::Monthly => start.checked_add_months(Months::new(periods)),
        }
    }
}

/// loan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Active,
    /// at least one unpaid item is past its due date
    Overdue,
    Paid,
    Deleted,
}

impl LoanStatus {
    /// whether ledger mutations are allowed
    pub fn is_pending(&self) -> bool {
        matches!(self, LoanStatus::Active | LoanStatus::Overdue)
    }
}

/// regular scheduled installment or ad-hoc charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallmentKind {
    #[default]
    Regular,
    /// principal-only fee row, never recalculated by restructuring
    Charge,
}

/// one scheduled due item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    pub id: InstallmentId,
    pub loan_id: LoanId,
    pub number: u32,
    pub kind: InstallmentKind,
    pub due_date: NaiveDate,
    pub principal: Money,
    pub interest: Money,
    pub total: Money,
    pub paid: bool,
    /// closed by an early settlement rather than by payments
    pub settled: bool,
    pub late_fee_paid: Money,
    pub description: Option<String>,
}

impl Installment {
    pub fn regular(
        loan_id: LoanId,
        number: u32,
        due_date: NaiveDate,
        principal: Money,
        interest: Money,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            loan_id,
            number,
            kind: InstallmentKind::Regular,
            due_date,
            principal,
            interest,
            total: principal + interest,
            paid: false,
            settled: false,
            late_fee_paid: Money::ZERO,
            description: None,
        }
    }

    pub fn charge(
        loan_id: LoanId,
        number: u32,
        due_date: NaiveDate,
        amount: Money,
        description: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            loan_id,
            number,
            kind: InstallmentKind::Charge,
            due_date,
            principal: amount,
            interest: Money::ZERO,
            total: amount,
            paid: false,
            settled: false,
            late_fee_paid: Money::ZERO,
            description,
        }
    }

    pub fn is_charge(&self) -> bool {
        self.kind == InstallmentKind::Charge
    }

    /// neither paid nor settled
    pub fn is_open(&self) -> bool {
        !self.paid && !self.settled
    }

    /// rewrite the principal/interest split, keeping `total` in step
    pub fn set_amounts(&mut self, principal: Money, interest: Money) {
        self.principal = principal;
        self.interest = interest;
        self.total = principal + interest;
    }
}

/// which kind of due item a payment was attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentTarget {
    Installment,
    Charge,
    /// early payoff; not matched against individual rows
    Settlement,
}

impl PaymentTarget {
    pub fn for_kind(kind: InstallmentKind) -> Self {
        match kind {
            InstallmentKind::Regular => PaymentTarget::Installment,
            InstallmentKind::Charge => PaymentTarget::Charge,
        }
    }
}

/// append-only payment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub loan_id: LoanId,
    pub amount: Money,
    pub principal: Money,
    pub interest: Money,
    pub late_fee: Money,
    pub target: PaymentTarget,
    /// due date the payment was attributed to
    pub due_date: NaiveDate,
    pub paid_on: NaiveDate,
    pub reference: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// append-only out-of-schedule principal payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalPayment {
    pub id: CapitalPaymentId,
    pub loan_id: LoanId,
    pub amount: Money,
    pub capital_before: Money,
    pub capital_after: Money,
    pub keep_installment_count: bool,
    pub penalty: Option<Money>,
    pub idempotency_key: Uuid,
    pub recorded_at: DateTime<Utc>,
}

/// namespace for capital payment idempotency keys
const CAPITAL_PAYMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_4a2e_9b7d_4f0a_8e35_d2c4_71b9_0a56);

impl CapitalPayment {
    /// deterministic key over (loan, amount, capital before, capital after)
    pub fn idempotency_key(loan_id: LoanId, amount: Money, capital_before: Money, capital_after: Money) -> Uuid {
        let name = format!("{}:{}:{}:{}", loan_id, amount, capital_before, capital_after);
        Uuid::new_v5(&CAPITAL_PAYMENT_NAMESPACE, name.as_bytes())
    }
}
