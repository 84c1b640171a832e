use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{LateFeeConfig, LoanTerms};
use crate::decimal::{Money, Rate};
use crate::errors::Result;
use crate::store::LedgerStore;
use crate::types::{
    AmortizationKind, CapitalPayment, Installment, InstallmentId, InstallmentKind, LoanId,
    LoanStatus, Payment, PaymentFrequency,
};

/// loan record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    /// principal; for indefinite loans the current outstanding principal
    pub amount: Money,
    pub interest_rate: Rate,
    pub term: u32,
    pub amortization: AmortizationKind,
    pub frequency: PaymentFrequency,
    pub start_date: NaiveDate,
    pub late_fee: LateFeeConfig,
    pub status: LoanStatus,
    /// loan-level late fee not attributed to any installment
    ///
    /// Set by the host through `LedgerStore::update_loan`, for instance when
    /// fees are carried over from another system. The ledger only draws it down.
    pub late_fee_balance: Money,
    /// last derived balance, for display only
    pub balance: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    /// create new loan record from terms
    pub fn from_terms(terms: &LoanTerms, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            amount: terms.amount,
            interest_rate: terms.interest_rate,
            term: terms.term,
            amortization: terms.amortization,
            frequency: terms.frequency,
            start_date: terms.start_date,
            late_fee: terms.late_fee.clone(),
            status: LoanStatus::Active,
            late_fee_balance: Money::ZERO,
            balance: terms.amount,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn is_indefinite(&self) -> bool {
        self.amortization == AmortizationKind::Indefinite
    }
}

/// partial update of loan fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoanUpdate {
    pub amount: Option<Money>,
    pub status: Option<LoanStatus>,
    pub balance: Option<Money>,
    pub late_fee_balance: Option<Money>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LoanUpdate {
    pub fn apply_to(&self, loan: &mut Loan) {
        if let Some(amount) = self.amount {
            loan.amount = amount;
        }
        if let Some(status) = self.status {
            loan.status = status;
        }
        if let Some(balance) = self.balance {
            loan.balance = balance;
        }
        if let Some(late_fee_balance) = self.late_fee_balance {
            loan.late_fee_balance = late_fee_balance;
        }
        if let Some(updated_at) = self.updated_at {
            loan.updated_at = updated_at;
        }
    }
}

/// full snapshot of one loan's ledger, read before every computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerState {
    pub loan: Loan,
    /// ordered by due date, then sequence number
    pub installments: Vec<Installment>,
    pub payments: Vec<Payment>,
    pub capital_payments: Vec<CapitalPayment>,
}

impl LedgerState {
    pub fn new(
        loan: Loan,
        mut installments: Vec<Installment>,
        payments: Vec<Payment>,
        capital_payments: Vec<CapitalPayment>,
    ) -> Self {
        installments.sort_by_key(|i| (i.due_date, i.number));
        Self {
            loan,
            installments,
            payments,
            capital_payments,
        }
    }

    /// read the loan and its full history from the store
    pub fn load<S: LedgerStore + ?Sized>(store: &S, loan_id: LoanId) -> Result<Self> {
        let loan = store.get_loan(loan_id)?;
        let installments = store.list_installments(loan_id)?;
        let payments = store.list_payments(loan_id)?;
        let capital_payments = store.list_capital_payments(loan_id)?;

        Ok(Self::new(loan, installments, payments, capital_payments))
    }

    pub fn installment(&self, id: InstallmentId) -> Option<&Installment> {
        self.installments.iter().find(|i| i.id == id)
    }

    /// open regular rows in due-date order
    pub fn open_regular(&self) -> impl Iterator<Item = &Installment> {
        self.installments
            .iter()
            .filter(|i| i.kind == InstallmentKind::Regular && i.is_open())
    }

    /// sequence number for a newly appended row
    pub fn next_number(&self) -> u32 {
        self.installments.iter().map(|i| i.number).max().unwrap_or(0) + 1
    }
}
