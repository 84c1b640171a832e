use chrono::NaiveDate;
use thiserror::Error;

use crate::decimal::Money;
use crate::store::StoreError;
use crate::types::LoanStatus;

/// broad classification used by callers to decide how to surface an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// bad input; surfaced, not retried
    Validation,
    /// ledger state forbids the operation; surfaced, not retried
    Precondition,
    /// internal arithmetic mismatch; mutation aborted before persistence
    Reconciliation,
    /// persistence collaborator failure, propagated unchanged
    Storage,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid amount: {amount}")]
    InvalidAmount {
        amount: Money,
    },

    #[error("payment has neither a principal nor a late fee portion")]
    EmptyPayment,

    #[error("amount exceeds allowed maximum: maximum {maximum}, requested {requested}")]
    ExceedsMaximum {
        maximum: Money,
        requested: Money,
    },

    #[error("a reason code is required")]
    MissingReason,

    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        message: String,
    },

    #[error("loan not pending: current status is {status:?}")]
    LoanNotActive {
        status: LoanStatus,
    },

    #[error("{count} overdue installment(s) block the operation, oldest due {oldest}")]
    OverdueInstallments {
        count: usize,
        oldest: NaiveDate,
    },

    #[error("nothing is due on this loan")]
    NothingDue,

    #[error("capital changed since preview: expected {expected}, current {current}")]
    StaleCapital {
        expected: Money,
        current: Money,
    },

    #[error("settlement must cover the full capital: pending {pending}, offered {offered}")]
    CapitalShortfall {
        pending: Money,
        offered: Money,
    },

    #[error("schedule does not reconcile: {component} expected {expected}, got {actual}")]
    Reconciliation {
        component: &'static str,
        expected: Money,
        actual: Money,
    },

    #[error("calculation error: {message}")]
    CalculationError {
        message: String,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount { .. }
            | LedgerError::EmptyPayment
            | LedgerError::ExceedsMaximum { .. }
            | LedgerError::MissingReason
            | LedgerError::InvalidConfiguration { .. } => ErrorKind::Validation,
            LedgerError::LoanNotActive { .. }
            | LedgerError::OverdueInstallments { .. }
            | LedgerError::NothingDue
            | LedgerError::StaleCapital { .. }
            | LedgerError::CapitalShortfall { .. } => ErrorKind::Precondition,
            LedgerError::Reconciliation { .. } | LedgerError::CalculationError { .. } => {
                ErrorKind::Reconciliation
            }
            LedgerError::Storage(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
