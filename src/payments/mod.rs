pub mod allocation;
pub mod prepayment;
pub mod schedule;
pub mod settlement;

use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::late_fee::FeeDistribution;
use crate::types::Payment;

pub use allocation::{validate_payment, Allocation, PaymentAllocator};
pub use prepayment::{PrepaymentRequest, PrepaymentRestructurer, RowChange, ScheduleDiff};
pub use schedule::{annuity_payment, ScheduleGenerator};
pub use settlement::{SettlementBreakdown, SettlementRequest, SettlementTerms};

/// payment request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// amount for interest and principal of the current due item
    pub amount: Money,
    /// amount for accrued late fees
    pub late_fee_amount: Money,
    pub reference: Option<String>,
}

impl PaymentRequest {
    pub fn new(amount: Money) -> Self {
        Self {
            amount,
            late_fee_amount: Money::ZERO,
            reference: None,
        }
    }

    pub fn with_late_fee(mut self, late_fee_amount: Money) -> Self {
        self.late_fee_amount = late_fee_amount;
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn total(&self) -> Money {
        self.amount + self.late_fee_amount
    }
}

/// result of an applied payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    /// `None` for a late-fee-only payment
    pub allocation: Option<Allocation>,
    pub late_fee: FeeDistribution,
    pub installment_paid: bool,
    pub previous_balance: Money,
    pub new_balance: Money,
}
