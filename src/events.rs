use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::{CapitalPaymentId, InstallmentId, InstallmentKind, LoanId, LoanStatus};

/// all events that can be emitted by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // lifecycle events
    LoanCreated {
        loan_id: LoanId,
        amount: Money,
        installments: u32,
        timestamp: DateTime<Utc>,
    },
    ChargeAdded {
        loan_id: LoanId,
        installment_id: InstallmentId,
        amount: Money,
        due_date: NaiveDate,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        loan_id: LoanId,
        old_status: LoanStatus,
        new_status: LoanStatus,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // payment events
    PaymentApplied {
        loan_id: LoanId,
        amount: Money,
        applied_to_interest: Money,
        applied_to_principal: Money,
        applied_to_late_fee: Money,
        due_date: NaiveDate,
        kind: InstallmentKind,
        new_balance: Money,
        timestamp: DateTime<Utc>,
    },
    InstallmentPaid {
        loan_id: LoanId,
        installment_id: InstallmentId,
        number: u32,
        due_date: NaiveDate,
        timestamp: DateTime<Utc>,
    },

    // late fee events
    LateFeePaid {
        loan_id: LoanId,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    LateFeeWaived {
        loan_id: LoanId,
        amount: Money,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // prepayment events
    ScheduleRestructured {
        loan_id: LoanId,
        old_principal: Money,
        new_principal: Money,
        old_count: usize,
        new_count: usize,
        keep_installment_count: bool,
        timestamp: DateTime<Utc>,
    },
    CapitalPaymentRecorded {
        loan_id: LoanId,
        capital_payment_id: CapitalPaymentId,
        amount: Money,
        penalty: Option<Money>,
        timestamp: DateTime<Utc>,
    },
    CapitalPaymentDeduplicated {
        loan_id: LoanId,
        capital_payment_id: CapitalPaymentId,
        amount: Money,
        timestamp: DateTime<Utc>,
    },

    // settlement events
    LoanSettled {
        loan_id: LoanId,
        capital_paid: Money,
        interest_paid: Money,
        late_fee_paid: Money,
        interest_forgiven: Money,
        late_fee_forgiven: Money,
        timestamp: DateTime<Utc>,
    },
}

/// event store for collecting events during operations
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
        }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
