pub mod balance;
pub mod config;
pub mod decimal;
pub mod errors;
pub mod events;
pub mod late_fee;
pub mod ledger;
pub mod payments;
pub mod state;
pub mod store;
pub mod types;
pub mod views;

// re-export key types
pub use balance::{BalanceEngine, ItemStatus, LedgerBalance};
pub use config::{
    LateFeeAccrual, LateFeeBasis, LateFeeConfig, LedgerConfig, LoanTerms, PrepaymentPenalty,
};
pub use decimal::{reconcile_last, round2, Money, Rate};
pub use errors::{ErrorKind, LedgerError, Result};
pub use events::{Event, EventStore};
pub use late_fee::{FeeDistribution, InstallmentLateFee, LateFeeBreakdown, LateFeeCalculation, LateFeeEngine};
pub use ledger::{derive_status, CapitalPaymentOutcome, Ledger, PrepaymentReceipt, SettlementReceipt};
pub use payments::{
    Allocation, PaymentAllocator, PaymentReceipt, PaymentRequest, PrepaymentRequest,
    PrepaymentRestructurer, RowChange, ScheduleDiff, ScheduleGenerator, SettlementBreakdown,
    SettlementRequest, SettlementTerms,
};
pub use state::{LedgerState, Loan, LoanUpdate};
pub use store::{InMemoryStore, LedgerStore, StoreError, StoreResult};
pub use types::{
    AmortizationKind, CapitalPayment, CapitalPaymentId, Installment, InstallmentId,
    InstallmentKind, LoanId, LoanStatus, Payment, PaymentFrequency, PaymentId, PaymentTarget,
};
pub use views::LoanView;

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
