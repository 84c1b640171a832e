use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::decimal::{Money, Rate};
use crate::errors::{LedgerError, Result};
use crate::types::{AmortizationKind, PaymentFrequency};

/// how late fees grow with days overdue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateFeeAccrual {
    /// rate charged once per overdue day
    Daily,
    /// rate charged once per started 30-day block
    Monthly,
    /// rate compounded daily
    Compound,
}

/// amount the late-fee rate is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LateFeeBasis {
    /// principal portion of the installment
    #[default]
    Principal,
    /// principal plus interest of the installment
    InstallmentTotal,
}

/// late-fee configuration carried by each loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateFeeConfig {
    pub enabled: bool,
    /// rate per accrual step
    pub rate: Rate,
    pub grace_period_days: u32,
    /// zero means uncapped
    pub max_late_fee: Money,
    pub accrual: LateFeeAccrual,
    #[serde(default)]
    pub basis: LateFeeBasis,
}

impl LateFeeConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            rate: Rate::ZERO,
            grace_period_days: 0,
            max_late_fee: Money::ZERO,
            accrual: LateFeeAccrual::Daily,
            basis: LateFeeBasis::Principal,
        }
    }

    pub fn daily(rate: Rate, grace_period_days: u32) -> Self {
        Self {
            enabled: true,
            rate,
            grace_period_days,
            max_late_fee: Money::ZERO,
            accrual: LateFeeAccrual::Daily,
            basis: LateFeeBasis::Principal,
        }
    }

    pub fn monthly(rate: Rate, grace_period_days: u32) -> Self {
        Self {
            accrual: LateFeeAccrual::Monthly,
            ..Self::daily(rate, grace_period_days)
        }
    }

    pub fn compound(rate: Rate, grace_period_days: u32) -> Self {
        Self {
            accrual: LateFeeAccrual::Compound,
            ..Self::daily(rate, grace_period_days)
        }
    }

    /// cap the fee per installment
    pub fn with_cap(mut self, max_late_fee: Money) -> Self {
        self.max_late_fee = max_late_fee;
        self
    }

    pub fn with_basis(mut self, basis: LateFeeBasis) -> Self {
        self.basis = basis;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate.as_decimal() < Decimal::ZERO {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("late fee rate must not be negative: {}", self.rate),
            });
        }
        if self.max_late_fee.is_negative() {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("late fee cap must not be negative: {}", self.max_late_fee),
            });
        }
        Ok(())
    }
}

impl Default for LateFeeConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// terms used to originate a loan and generate its schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    pub amount: Money,
    /// interest rate per payment period
    pub interest_rate: Rate,
    /// number of scheduled installments
    pub term: u32,
    pub amortization: AmortizationKind,
    pub frequency: PaymentFrequency,
    /// first due date is one period after this date
    pub start_date: NaiveDate,
    pub late_fee: LateFeeConfig,
}

impl LoanTerms {
    /// monthly loan with equal principal and flat interest
    pub fn monthly_simple(amount: Money, rate: Rate, term: u32, start_date: NaiveDate) -> Self {
        Self {
            amount,
            interest_rate: rate,
            term,
            amortization: AmortizationKind::Simple,
            frequency: PaymentFrequency::Monthly,
            start_date,
            late_fee: LateFeeConfig::disabled(),
        }
    }

    /// monthly annuity loan
    pub fn monthly_french(amount: Money, rate: Rate, term: u32, start_date: NaiveDate) -> Self {
        Self {
            amortization: AmortizationKind::French,
            ..Self::monthly_simple(amount, rate, term, start_date)
        }
    }

    /// interest-only loan with a rolling horizon of `horizon` rows
    pub fn indefinite(
        amount: Money,
        rate: Rate,
        horizon: u32,
        frequency: PaymentFrequency,
        start_date: NaiveDate,
    ) -> Self {
        Self {
            amount,
            interest_rate: rate,
            term: horizon,
            amortization: AmortizationKind::Indefinite,
            frequency,
            start_date,
            late_fee: LateFeeConfig::disabled(),
        }
    }

    pub fn with_late_fee(mut self, late_fee: LateFeeConfig) -> Self {
        self.late_fee = late_fee;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.amount.is_positive() {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("loan amount must be positive: {}", self.amount),
            });
        }
        if self.interest_rate.as_decimal() < Decimal::ZERO {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("interest rate must not be negative: {}", self.interest_rate),
            });
        }
        if self.term == 0 {
            return Err(LedgerError::InvalidConfiguration {
                message: "term must be at least one period".to_string(),
            });
        }
        self.late_fee.validate()
    }
}

/// prepayment penalty applied to the outstanding principal before the prepayment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepaymentPenalty {
    pub rate: Rate,
}

/// ledger-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// amounts within this distance are treated as equal
    pub tolerance: Money,
    /// duplicate capital payments inside this window are suppressed
    pub idempotency_window_secs: u32,
    /// default penalty when a prepayment request carries none
    pub prepayment_penalty: Option<PrepaymentPenalty>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            tolerance: Money::CENT,
            idempotency_window_secs: 120,
            prepayment_penalty: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LedgerConfig =
            serde_json::from_str(json).map_err(|e| LedgerError::InvalidConfiguration {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn idempotency_window(&self) -> Duration {
        Duration::seconds(self.idempotency_window_secs as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tolerance.is_negative() || self.tolerance.as_decimal() > dec!(1) {
            return Err(LedgerError::InvalidConfiguration {
                message: format!("tolerance out of range: {}", self.tolerance),
            });
        }
        if let Some(penalty) = &self.prepayment_penalty {
            if penalty.rate.as_decimal() < Decimal::ZERO {
                return Err(LedgerError::InvalidConfiguration {
                    message: format!("prepayment penalty must not be negative: {}", penalty.rate),
                });
            }
        }
        Ok(())
    }
}
