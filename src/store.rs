//! Persistence collaborator.
//!
//! The ledger reads and writes plain records through [`LedgerStore`]; storage
//! engineering (transactions, schemas, retries) belongs to the implementation.
//! [`InMemoryStore`] keeps everything in process for tests and demos.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::state::{Loan, LoanUpdate};
use crate::types::{CapitalPayment, Installment, InstallmentId, LoanId, Payment};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// synchronous persistence interface consumed by the ledger
pub trait LedgerStore {
    fn get_loan(&self, loan_id: LoanId) -> StoreResult<Loan>;

    fn insert_loan(&self, loan: &Loan) -> StoreResult<()>;

    fn list_installments(&self, loan_id: LoanId) -> StoreResult<Vec<Installment>>;

    fn list_payments(&self, loan_id: LoanId) -> StoreResult<Vec<Payment>>;

    fn list_capital_payments(&self, loan_id: LoanId) -> StoreResult<Vec<CapitalPayment>>;

    /// insert new rows or replace rows with a matching id
    fn upsert_installments(&self, rows: &[Installment]) -> StoreResult<()>;

    fn delete_installments(&self, ids: &[InstallmentId]) -> StoreResult<()>;

    fn insert_payment(&self, row: &Payment) -> StoreResult<()>;

    fn insert_capital_payment(&self, row: &CapitalPayment) -> StoreResult<()>;

    fn update_loan(&self, loan_id: LoanId, update: &LoanUpdate) -> StoreResult<()>;
}

/// in-memory store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    loans: RwLock<HashMap<LoanId, Loan>>,
    installments: RwLock<HashMap<InstallmentId, Installment>>,
    payments: RwLock<Vec<Payment>>,
    capital_payments: RwLock<Vec<CapitalPayment>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_loan(&self, loan_id: LoanId) -> StoreResult<()> {
        if self.loans.read().contains_key(&loan_id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("loan {}", loan_id)))
        }
    }
}

impl LedgerStore for InMemoryStore {
    fn get_loan(&self, loan_id: LoanId) -> StoreResult<Loan> {
        self.loans
            .read()
            .get(&loan_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("loan {}", loan_id)))
    }

    fn insert_loan(&self, loan: &Loan) -> StoreResult<()> {
        let mut loans = self.loans.write();
        if loans.contains_key(&loan.id) {
            return Err(StoreError::AlreadyExists(format!("loan {}", loan.id)));
        }
        loans.insert(loan.id, loan.clone());
        Ok(())
    }

    fn list_installments(&self, loan_id: LoanId) -> StoreResult<Vec<Installment>> {
        self.ensure_loan(loan_id)?;
        let mut rows: Vec<Installment> = self
            .installments
            .read()
            .values()
            .filter(|i| i.loan_id == loan_id)
            .cloned()
            .collect();
        rows.sort_by_key(|i| (i.due_date, i.number));
        Ok(rows)
    }

    fn list_payments(&self, loan_id: LoanId) -> StoreResult<Vec<Payment>> {
        self.ensure_loan(loan_id)?;
        Ok(self
            .payments
            .read()
            .iter()
            .filter(|p| p.loan_id == loan_id)
            .cloned()
            .collect())
    }

    fn list_capital_payments(&self, loan_id: LoanId) -> StoreResult<Vec<CapitalPayment>> {
        self.ensure_loan(loan_id)?;
        Ok(self
            .capital_payments
            .read()
            .iter()
            .filter(|c| c.loan_id == loan_id)
            .cloned()
            .collect())
    }

    fn upsert_installments(&self, rows: &[Installment]) -> StoreResult<()> {
        let mut installments = self.installments.write();
        for row in rows {
            installments.insert(row.id, row.clone());
        }
        Ok(())
    }

    fn delete_installments(&self, ids: &[InstallmentId]) -> StoreResult<()> {
        let mut installments = self.installments.write();
        for id in ids {
            installments.remove(id);
        }
        Ok(())
    }

    fn insert_payment(&self, row: &Payment) -> StoreResult<()> {
        self.ensure_loan(row.loan_id)?;
        self.payments.write().push(row.clone());
        Ok(())
    }

    fn insert_capital_payment(&self, row: &CapitalPayment) -> StoreResult<()> {
        self.ensure_loan(row.loan_id)?;
        self.capital_payments.write().push(row.clone());
        Ok(())
    }

    fn update_loan(&self, loan_id: LoanId, update: &LoanUpdate) -> StoreResult<()> {
        let mut loans = self.loans.write();
        let loan = loans
            .get_mut(&loan_id)
            .ok_or_else(|| StoreError::NotFound(format!("loan {}", loan_id)))?;
        update.apply_to(loan);
        Ok(())
    }
}
