use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use hourglass_rs::SafeTimeProvider;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::balance::{BalanceEngine, LedgerBalance};
use crate::config::{LedgerConfig, LoanTerms};
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::late_fee::{FeeDistribution, LateFeeBreakdown, LateFeeEngine};
use crate::payments::{
    validate_payment, Allocation, PaymentAllocator, PaymentReceipt, PaymentRequest,
    PrepaymentRequest, PrepaymentRestructurer, ScheduleDiff, ScheduleGenerator,
    SettlementBreakdown, SettlementRequest, SettlementTerms,
};
use crate::state::{LedgerState, Loan, LoanUpdate};
use crate::store::LedgerStore;
use crate::types::{
    CapitalPayment, Installment, InstallmentId, LoanId, LoanStatus, Payment, PaymentTarget,
};
use crate::views::LoanView;

/// capital payment result; a suppressed duplicate is a successful no-op
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CapitalPaymentOutcome {
    Recorded(PrepaymentReceipt),
    DuplicateSuppressed(CapitalPayment),
}

impl CapitalPaymentOutcome {
    pub fn capital_payment(&self) -> &CapitalPayment {
        match self {
            CapitalPaymentOutcome::Recorded(receipt) => &receipt.capital_payment,
            CapitalPaymentOutcome::DuplicateSuppressed(existing) => existing,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CapitalPaymentOutcome::DuplicateSuppressed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepaymentReceipt {
    pub capital_payment: CapitalPayment,
    pub diff: ScheduleDiff,
    pub new_balance: Money,
    pub status: LoanStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub payment: Payment,
    pub terms: SettlementTerms,
    pub settled_rows: usize,
}

/// loan ledger over a persistence collaborator
///
/// Every operation follows load, compute, mutate, re-derive. Operations on one
/// loan are serialised by a per-loan lock; different loans run in parallel.
pub struct Ledger<S: LedgerStore> {
    store: S,
    config: LedgerConfig,
    locks: Mutex<HashMap<LoanId, Arc<Mutex<()>>>>,
    events: Mutex<EventStore>,
}

impl<S: LedgerStore> Ledger<S> {
    pub fn new(store: S, config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            locks: Mutex::new(HashMap::new()),
            events: Mutex::new(EventStore::new()),
        })
    }

    pub fn with_defaults(store: S) -> Self {
        Self {
            store,
            config: LedgerConfig::default(),
            locks: Mutex::new(HashMap::new()),
            events: Mutex::new(EventStore::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// drain events collected since the last call
    pub fn take_events(&self) -> Vec<Event> {
        self.events.lock().take_events()
    }

    fn emit(&self, event: Event) {
        self.events.lock().emit(event);
    }

    /// lock for one loan; entries nobody holds are dropped on the way in
    fn loan_lock(&self, loan_id: LoanId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|id, lock| *id == loan_id || Arc::strong_count(lock) > 1);
        locks.entry(loan_id).or_default().clone()
    }

    fn tolerance(&self) -> Money {
        self.config.tolerance
    }

    fn balances(&self) -> BalanceEngine {
        BalanceEngine::new(self.tolerance())
    }

    /// originate a loan and persist its generated schedule
    pub fn create_loan(&self, terms: &LoanTerms, time: &SafeTimeProvider) -> Result<Loan> {
        terms.validate()?;

        let now = time.now();
        let loan = Loan::from_terms(terms, now);
        let rows = ScheduleGenerator::new(&loan).generate()?;

        self.store.insert_loan(&loan)?;
        self.store.upsert_installments(&rows)?;

        info!(
            loan_id = %loan.id,
            amount = %loan.amount,
            installments = rows.len(),
            amortization = ?loan.amortization,
            "loan created"
        );
        self.emit(Event::LoanCreated {
            loan_id: loan.id,
            amount: loan.amount,
            installments: rows.len() as u32,
            timestamp: now,
        });

        Ok(loan)
    }

    /// append an ad-hoc charge row
    pub fn add_charge(
        &self,
        loan_id: LoanId,
        amount: Money,
        due_date: NaiveDate,
        description: Option<String>,
        time: &SafeTimeProvider,
    ) -> Result<Installment> {
        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock();

        let state = LedgerState::load(&self.store, loan_id)?;
        ensure_pending(&state.loan)?;
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount { amount });
        }

        let charge = Installment::charge(loan_id, state.next_number(), due_date, amount, description);
        self.store.upsert_installments(std::slice::from_ref(&charge))?;

        let now = time.now();
        info!(%loan_id, %amount, %due_date, number = charge.number, "charge added");
        self.emit(Event::ChargeAdded {
            loan_id,
            installment_id: charge.id,
            amount,
            due_date,
            timestamp: now,
        });

        self.rederive(loan_id, now)?;
        Ok(charge)
    }

    /// balance re-derived from the full history
    pub fn balance(&self, loan_id: LoanId) -> Result<LedgerBalance> {
        let state = LedgerState::load(&self.store, loan_id)?;
        self.balances().compute(&state)
    }

    /// split a payment against the current due item without recording it
    pub fn preview_allocation(&self, loan_id: LoanId, amount: Money) -> Result<Allocation> {
        let state = LedgerState::load(&self.store, loan_id)?;
        let balance = self.balances().compute(&state)?;
        PaymentAllocator::new(self.tolerance()).allocate(amount, &balance)
    }

    pub fn apply_payment(
        &self,
        loan_id: LoanId,
        request: &PaymentRequest,
        time: &SafeTimeProvider,
    ) -> Result<PaymentReceipt> {
        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock();

        let state = LedgerState::load(&self.store, loan_id)?;
        ensure_pending(&state.loan)?;
        if let Err(err) = validate_payment(request.amount, request.late_fee_amount) {
            warn!(%loan_id, amount = %request.amount, late_fee = %request.late_fee_amount, %err, "payment rejected");
            return Err(err);
        }

        let tolerance = self.tolerance();
        let balance = self.balances().compute(&state)?;
        let now = time.now();
        let today = now.date_naive();

        let allocator = PaymentAllocator::new(tolerance);
        let allocation = if request.amount.is_positive() {
            let allocation = allocator.allocate(request.amount, &balance)?;
            if let Err(err) = allocator.ensure_fits(&allocation) {
                warn!(%loan_id, amount = %request.amount, excess = %allocation.excess, "payment exceeds current due item");
                return Err(err);
            }
            Some(allocation)
        } else {
            None
        };

        let late_fee = if request.late_fee_amount.is_positive() {
            let fees = LateFeeEngine::for_loan(&state.loan).breakdown(&state, &balance, today, tolerance)?;
            FeeDistribution::oldest_first(request.late_fee_amount, &fees, state.loan.late_fee_balance, tolerance)?
        } else {
            FeeDistribution::default()
        };

        let (target, due_date) = match &allocation {
            Some(a) => (PaymentTarget::for_kind(a.kind), a.due_date),
            // a late-fee-only payment is attributed to the oldest row it paid
            None => late_fee
                .shares
                .first()
                .and_then(|(id, _)| state.installment(*id))
                .map(|row| (PaymentTarget::for_kind(row.kind), row.due_date))
                .unwrap_or((PaymentTarget::Installment, today)),
        };

        let (principal, interest) = allocation
            .as_ref()
            .map(|a| (a.principal_applied, a.interest_applied))
            .unwrap_or((Money::ZERO, Money::ZERO));
        let late_fee_paid = late_fee.total();

        let payment = Payment {
            id: Uuid::new_v4(),
            loan_id,
            amount: principal + interest + late_fee_paid,
            principal,
            interest,
            late_fee: late_fee_paid,
            target,
            due_date,
            paid_on: today,
            reference: request.reference.clone(),
            recorded_at: now,
        };

        let mut touched: HashMap<InstallmentId, Installment> = HashMap::new();
        let installment_paid = match &allocation {
            Some(a) if a.completes_item => {
                if let Some(row) = state.installment(a.installment_id) {
                    let mut row = row.clone();
                    row.paid = true;
                    touched.insert(row.id, row);
                }
                true
            }
            _ => false,
        };
        credit_late_fee(&state, &late_fee, &mut touched);

        self.store.insert_payment(&payment)?;
        if !touched.is_empty() {
            let rows: Vec<Installment> = touched.into_values().collect();
            self.store.upsert_installments(&rows)?;
        }
        if late_fee.loan_level.is_positive() {
            self.store.update_loan(
                loan_id,
                &LoanUpdate {
                    late_fee_balance: Some((state.loan.late_fee_balance - late_fee.loan_level).non_negative()),
                    ..Default::default()
                },
            )?;
        }

        let (new_balance, _) = self.rederive(loan_id, now)?;

        info!(
            %loan_id,
            amount = %payment.amount,
            interest = %interest,
            principal = %principal,
            late_fee = %late_fee_paid,
            new_balance = %new_balance.total,
            "payment applied"
        );
        self.emit(Event::PaymentApplied {
            loan_id,
            amount: payment.amount,
            applied_to_interest: interest,
            applied_to_principal: principal,
            applied_to_late_fee: late_fee_paid,
            due_date,
            kind: allocation.as_ref().map(|a| a.kind).unwrap_or_default(),
            new_balance: new_balance.total,
            timestamp: now,
        });
        if let Some(a) = allocation.as_ref().filter(|_| installment_paid) {
            self.emit(Event::InstallmentPaid {
                loan_id,
                installment_id: a.installment_id,
                number: a.number,
                due_date: a.due_date,
                timestamp: now,
            });
        }
        if late_fee_paid.is_positive() {
            self.emit(Event::LateFeePaid {
                loan_id,
                amount: late_fee_paid,
                timestamp: now,
            });
        }

        Ok(PaymentReceipt {
            payment,
            allocation,
            late_fee,
            installment_paid,
            previous_balance: balance.total,
            new_balance: new_balance.total,
        })
    }

    pub fn compute_late_fee_breakdown(&self, loan_id: LoanId, as_of: NaiveDate) -> Result<LateFeeBreakdown> {
        let state = LedgerState::load(&self.store, loan_id)?;
        let balance = self.balances().compute(&state)?;
        LateFeeEngine::for_loan(&state.loan).breakdown(&state, &balance, as_of, self.tolerance())
    }

    /// administrative late-fee waiver, spread by each row's current fee
    pub fn remove_late_fee(
        &self,
        loan_id: LoanId,
        amount: Money,
        reason: &str,
        time: &SafeTimeProvider,
    ) -> Result<FeeDistribution> {
        if reason.trim().is_empty() {
            warn!(%loan_id, %amount, "late fee removal without a reason code");
            return Err(LedgerError::MissingReason);
        }

        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock();

        let state = LedgerState::load(&self.store, loan_id)?;
        ensure_pending(&state.loan)?;

        let tolerance = self.tolerance();
        let balance = self.balances().compute(&state)?;
        let now = time.now();
        let fees = LateFeeEngine::for_loan(&state.loan).breakdown(&state, &balance, now.date_naive(), tolerance)?;
        let plan = FeeDistribution::proportional(amount, &fees, state.loan.late_fee_balance, tolerance)?;

        let mut touched = HashMap::new();
        credit_late_fee(&state, &plan, &mut touched);
        if !touched.is_empty() {
            let rows: Vec<Installment> = touched.into_values().collect();
            self.store.upsert_installments(&rows)?;
        }
        if plan.loan_level.is_positive() {
            self.store.update_loan(
                loan_id,
                &LoanUpdate {
                    late_fee_balance: Some((state.loan.late_fee_balance - plan.loan_level).non_negative()),
                    updated_at: Some(now),
                    ..Default::default()
                },
            )?;
        }

        info!(%loan_id, %amount, reason, rows = plan.shares.len(), "late fee removed");
        self.emit(Event::LateFeeWaived {
            loan_id,
            amount: plan.total(),
            reason: reason.to_string(),
            timestamp: now,
        });

        Ok(plan)
    }

    /// restructured schedule for a prepayment, without persisting it
    pub fn preview_prepayment(
        &self,
        loan_id: LoanId,
        request: &PrepaymentRequest,
        time: &SafeTimeProvider,
    ) -> Result<ScheduleDiff> {
        let state = LedgerState::load(&self.store, loan_id)?;
        ensure_pending(&state.loan)?;
        let balance = self.balances().compute(&state)?;
        let request = self.resolve_penalty(request);
        PrepaymentRestructurer::new(&state, &balance, self.tolerance()).plan(&request, time.now().date_naive())
    }

    pub fn apply_prepayment(
        &self,
        loan_id: LoanId,
        request: &PrepaymentRequest,
        time: &SafeTimeProvider,
    ) -> Result<CapitalPaymentOutcome> {
        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock();

        let state = LedgerState::load(&self.store, loan_id)?;
        ensure_pending(&state.loan)?;

        let tolerance = self.tolerance();
        let balance = self.balances().compute(&state)?;
        let now = time.now();
        let request = self.resolve_penalty(request);
        let restructurer = PrepaymentRestructurer::new(&state, &balance, tolerance);
        let current = restructurer.pending_principal();

        // a retried request carries the principal it was previewed against
        let observed = request.capital_before.unwrap_or(current);
        let key = CapitalPayment::idempotency_key(
            loan_id,
            request.amount,
            observed,
            (observed - request.amount).non_negative(),
        );
        if let Some(existing) = self.recent_duplicate(&state, key, now) {
            warn!(%loan_id, amount = %request.amount, capital_payment_id = %existing.id, "duplicate capital payment suppressed");
            self.emit(Event::CapitalPaymentDeduplicated {
                loan_id,
                capital_payment_id: existing.id,
                amount: existing.amount,
                timestamp: now,
            });
            return Ok(CapitalPaymentOutcome::DuplicateSuppressed(existing.clone()));
        }
        if !observed.approx_eq(current, tolerance) {
            return Err(LedgerError::StaleCapital {
                expected: observed,
                current,
            });
        }

        let diff = restructurer.plan(&request, now.date_naive())?;

        if !diff.removed.is_empty() {
            self.store.delete_installments(&diff.removed)?;
        }
        let mut rows = diff.updated.clone();
        rows.extend(diff.penalty_charge.iter().cloned());
        if !rows.is_empty() {
            self.store.upsert_installments(&rows)?;
        }
        if let Some(amount) = diff.new_loan_amount {
            self.store.update_loan(
                loan_id,
                &LoanUpdate {
                    amount: Some(amount),
                    ..Default::default()
                },
            )?;
        }

        let capital_payment = CapitalPayment {
            id: Uuid::new_v4(),
            loan_id,
            amount: diff.amount,
            capital_before: diff.capital_before,
            capital_after: diff.capital_after,
            keep_installment_count: diff.keep_installment_count,
            penalty: diff.penalty,
            idempotency_key: key,
            recorded_at: now,
        };
        self.store.insert_capital_payment(&capital_payment)?;

        let (new_balance, status) = self.rederive(loan_id, now)?;

        info!(
            %loan_id,
            amount = %diff.amount,
            capital_before = %diff.capital_before,
            capital_after = %diff.capital_after,
            keep_installment_count = diff.keep_installment_count,
            new_count = diff.new_count,
            "prepayment applied"
        );
        if let Some(charge) = &diff.penalty_charge {
            self.emit(Event::ChargeAdded {
                loan_id,
                installment_id: charge.id,
                amount: charge.total,
                due_date: charge.due_date,
                timestamp: now,
            });
        }
        self.emit(Event::ScheduleRestructured {
            loan_id,
            old_principal: diff.capital_before,
            new_principal: diff.capital_after,
            old_count: diff.old_count,
            new_count: diff.new_count,
            keep_installment_count: diff.keep_installment_count,
            timestamp: now,
        });
        self.emit(Event::CapitalPaymentRecorded {
            loan_id,
            capital_payment_id: capital_payment.id,
            amount: capital_payment.amount,
            penalty: capital_payment.penalty,
            timestamp: now,
        });

        Ok(CapitalPaymentOutcome::Recorded(PrepaymentReceipt {
            capital_payment,
            diff,
            new_balance: new_balance.total,
            status,
        }))
    }

    pub fn compute_settlement(&self, loan_id: LoanId, as_of: NaiveDate) -> Result<SettlementBreakdown> {
        let state = LedgerState::load(&self.store, loan_id)?;
        self.settlement_for(&state, as_of)
    }

    /// close the loan early; unpaid rows are flagged settled, not paid
    pub fn apply_settlement(
        &self,
        loan_id: LoanId,
        request: &SettlementRequest,
        time: &SafeTimeProvider,
    ) -> Result<SettlementReceipt> {
        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock();

        let state = LedgerState::load(&self.store, loan_id)?;
        ensure_pending(&state.loan)?;

        let tolerance = self.tolerance();
        let now = time.now();
        let today = now.date_naive();
        let breakdown = self.settlement_for(&state, today)?;
        let terms = match request.validate(&breakdown, tolerance) {
            Ok(terms) => terms,
            Err(err) => {
                warn!(%loan_id, capital = %request.capital, pending = %breakdown.capital_pending, %err, "settlement rejected");
                return Err(err);
            }
        };

        let settled: Vec<Installment> = state
            .installments
            .iter()
            .filter(|row| row.is_open())
            .map(|row| Installment {
                settled: true,
                ..row.clone()
            })
            .collect();

        // the projected ledger must come out cleared before anything is written
        let mut projected = state.clone();
        for row in projected.installments.iter_mut() {
            row.settled = row.settled || row.is_open();
        }
        if projected.loan.is_indefinite() {
            projected.loan.amount = Money::ZERO;
        }
        let remaining = self.balances().compute(&projected)?;
        if !remaining.is_cleared(tolerance) {
            return Err(LedgerError::Reconciliation {
                component: "settled balance",
                expected: Money::ZERO,
                actual: remaining.total,
            });
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            loan_id,
            amount: terms.total_paid(),
            principal: terms.capital_paid,
            interest: terms.interest_paid,
            late_fee: terms.late_fee_paid,
            target: PaymentTarget::Settlement,
            due_date: today,
            paid_on: today,
            reference: request.reference.clone(),
            recorded_at: now,
        };

        self.store.insert_payment(&payment)?;
        if !settled.is_empty() {
            self.store.upsert_installments(&settled)?;
        }
        self.store.update_loan(
            loan_id,
            &LoanUpdate {
                amount: projected.loan.is_indefinite().then_some(Money::ZERO),
                status: Some(LoanStatus::Paid),
                balance: Some(Money::ZERO),
                late_fee_balance: Some(Money::ZERO),
                updated_at: Some(now),
            },
        )?;

        info!(
            %loan_id,
            paid = %terms.total_paid(),
            forgiven = %terms.total_forgiven(),
            settled_rows = settled.len(),
            "loan settled"
        );
        self.emit(Event::LoanSettled {
            loan_id,
            capital_paid: terms.capital_paid,
            interest_paid: terms.interest_paid,
            late_fee_paid: terms.late_fee_paid,
            interest_forgiven: terms.interest_forgiven,
            late_fee_forgiven: terms.late_fee_forgiven,
            timestamp: now,
        });
        self.emit(Event::StatusChanged {
            loan_id,
            old_status: state.loan.status,
            new_status: LoanStatus::Paid,
            reason: "settlement".to_string(),
            timestamp: now,
        });

        Ok(SettlementReceipt {
            payment,
            terms,
            settled_rows: settled.len(),
        })
    }

    /// flip between active and overdue from the installment history
    pub fn refresh_status(&self, loan_id: LoanId, time: &SafeTimeProvider) -> Result<LoanStatus> {
        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock();

        let loan = self.store.get_loan(loan_id)?;
        if !loan.status.is_pending() {
            return Ok(loan.status);
        }
        let (_, status) = self.rederive(loan_id, time.now())?;
        Ok(status)
    }

    /// display snapshot of a loan
    pub fn loan_view(&self, loan_id: LoanId, as_of: NaiveDate) -> Result<LoanView> {
        let state = LedgerState::load(&self.store, loan_id)?;
        let tolerance = self.tolerance();
        let balance = self.balances().compute(&state)?;
        let fees = LateFeeEngine::for_loan(&state.loan).breakdown(&state, &balance, as_of, tolerance)?;
        Ok(LoanView::new(&state, &balance, &fees, as_of, tolerance))
    }

    fn settlement_for(&self, state: &LedgerState, as_of: NaiveDate) -> Result<SettlementBreakdown> {
        let balance = self.balances().compute(state)?;
        let fees = LateFeeEngine::for_loan(&state.loan).breakdown(state, &balance, as_of, self.tolerance())?;
        Ok(SettlementBreakdown::from_parts(&balance, &fees, state.loan.late_fee_balance, as_of))
    }

    fn resolve_penalty(&self, request: &PrepaymentRequest) -> PrepaymentRequest {
        let mut request = request.clone();
        if request.penalty_rate.is_none() {
            request.penalty_rate = self.config.prepayment_penalty.as_ref().map(|p| p.rate);
        }
        request
    }

    fn recent_duplicate<'s>(&self, state: &'s LedgerState, key: Uuid, now: DateTime<Utc>) -> Option<&'s CapitalPayment> {
        let window = self.config.idempotency_window();
        state
            .capital_payments
            .iter()
            .filter(|c| c.idempotency_key == key)
            .filter(|c| now >= c.recorded_at && now - c.recorded_at <= window)
            .max_by_key(|c| c.recorded_at)
    }

    /// re-derive the balance after a mutation and store the figures on the loan
    fn rederive(&self, loan_id: LoanId, now: DateTime<Utc>) -> Result<(LedgerBalance, LoanStatus)> {
        let state = LedgerState::load(&self.store, loan_id)?;
        let balance = self.balances().compute(&state)?;
        let status = derive_status(state.loan.status, &balance, now.date_naive(), self.tolerance());

        self.store.update_loan(
            loan_id,
            &LoanUpdate {
                status: Some(status),
                balance: Some(balance.total),
                updated_at: Some(now),
                ..Default::default()
            },
        )?;

        if status != state.loan.status {
            info!(%loan_id, old = ?state.loan.status, new = ?status, "loan status changed");
            self.emit(Event::StatusChanged {
                loan_id,
                old_status: state.loan.status,
                new_status: status,
                reason: "balance re-derived".to_string(),
                timestamp: now,
            });
        }

        Ok((balance, status))
    }
}

fn ensure_pending(loan: &Loan) -> Result<()> {
    if loan.status.is_pending() {
        Ok(())
    } else {
        Err(LedgerError::LoanNotActive { status: loan.status })
    }
}

/// status implied by a re-derived balance
pub fn derive_status(current: LoanStatus, balance: &LedgerBalance, as_of: NaiveDate, tolerance: Money) -> LoanStatus {
    if !current.is_pending() {
        current
    } else if balance.is_cleared(tolerance) {
        LoanStatus::Paid
    } else if !balance.overdue_items(as_of, tolerance).is_empty() {
        LoanStatus::Overdue
    } else {
        LoanStatus::Active
    }
}

fn credit_late_fee(state: &LedgerState, plan: &FeeDistribution, touched: &mut HashMap<InstallmentId, Installment>) {
    for (id, share) in &plan.shares {
        if !touched.contains_key(id) {
            match state.installment(*id) {
                Some(row) => {
                    touched.insert(*id, row.clone());
                }
                None => continue,
            }
        }
        if let Some(row) = touched.get_mut(id) {
            row.late_fee_paid += *share;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LateFeeConfig, PrepaymentPenalty};
    use crate::decimal::Rate;
    use crate::errors::ErrorKind;
    use crate::store::{InMemoryStore, StoreError, StoreResult};
    use crate::types::PaymentFrequency;
    use chrono::{Duration, TimeZone};
    use hourglass_rs::TimeSource;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn clock(y: i32, m: u32, d: u32) -> SafeTimeProvider {
        SafeTimeProvider::new(TimeSource::Test(Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()))
    }

    fn ledger() -> Ledger<InMemoryStore> {
        Ledger::with_defaults(InMemoryStore::new())
    }

    fn simple_terms(amount: i64, term: u32) -> LoanTerms {
        LoanTerms::monthly_simple(Money::from_major(amount), Rate::from_percentage(2), term, date(2024, 1, 1))
    }

    #[test]
    fn test_create_loan_persists_schedule() {
        let ledger = ledger();
        let time = clock(2024, 1, 1);

        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        assert_eq!(ledger.store().list_installments(loan.id).unwrap().len(), 10);
        assert_eq!(ledger.balance(loan.id).unwrap().total, Money::from_major(12_000));
        assert!(matches!(ledger.take_events()[0], Event::LoanCreated { installments: 10, .. }));
    }

    #[test]
    fn test_full_payment_reduces_principal_by_share() {
        let ledger = ledger();
        let time = clock(2024, 1, 20);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();
        let before = ledger.balance(loan.id).unwrap();

        let receipt = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(1_200)), &time)
            .unwrap();

        let after = ledger.balance(loan.id).unwrap();
        assert!(receipt.installment_paid);
        assert_eq!(before.principal_pending - after.principal_pending, Money::from_major(1_000));
        assert_eq!(receipt.new_balance, Money::from_major(10_800));

        let rows = ledger.store().list_installments(loan.id).unwrap();
        assert!(rows[0].paid);
        assert!(!rows[1].paid);
    }

    #[test]
    fn test_partial_payments_accumulate_on_same_due_date() {
        let ledger = ledger();
        let time = clock(2024, 1, 20);
        let terms = LoanTerms::monthly_simple(Money::from_major(10_000), Rate::from_percentage(5), 10, date(2024, 1, 1));
        let loan = ledger.create_loan(&terms, &time).unwrap();

        let first = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(300)), &time)
            .unwrap();
        let first = first.allocation.unwrap();
        assert_eq!(first.interest_applied, Money::from_major(300));
        assert_eq!(first.principal_applied, Money::ZERO);

        let second = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(400)), &time)
            .unwrap();
        let allocation = second.allocation.as_ref().unwrap();
        assert_eq!(allocation.due_date, first.due_date);
        assert_eq!(allocation.interest_applied, Money::from_major(200));
        assert_eq!(allocation.principal_applied, Money::from_major(200));
        assert!(!second.installment_paid);
        assert!(second.new_balance < second.previous_balance);
    }

    #[test]
    fn test_payment_rules() {
        let ledger = ledger();
        let time = clock(2024, 1, 20);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        let err = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::ZERO), &time)
            .unwrap_err();
        assert!(matches!(err, LedgerError::EmptyPayment));

        let err = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(-5)), &time)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        // more than the current installment is rejected, though the preview reports it
        let preview = ledger.preview_allocation(loan.id, Money::from_major(1_500)).unwrap();
        assert_eq!(preview.excess, Money::from_major(300));
        let err = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(1_500)), &time)
            .unwrap_err();
        assert!(matches!(err, LedgerError::ExceedsMaximum { .. }));
        assert!(ledger.store().list_payments(loan.id).unwrap().is_empty());
    }

    #[test]
    fn test_charge_is_paid_before_later_installments() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        ledger
            .add_charge(loan.id, Money::from_major(50), date(2024, 1, 15), Some("collection visit".into()), &time)
            .unwrap();

        let preview = ledger.preview_allocation(loan.id, Money::from_major(50)).unwrap();
        assert_eq!(preview.kind, crate::types::InstallmentKind::Charge);
        assert_eq!(preview.principal_applied, Money::from_major(50));

        let receipt = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(50)), &time)
            .unwrap();
        assert!(receipt.installment_paid);
        assert_eq!(receipt.payment.target, PaymentTarget::Charge);
        assert_eq!(ledger.balance(loan.id).unwrap().charges_pending, Money::ZERO);
    }

    #[test]
    fn test_late_fee_payment_and_status() {
        let ledger = ledger();
        let time = clock(2024, 1, 1);
        let terms = simple_terms(10_000, 10).with_late_fee(LateFeeConfig::daily(Rate::from_percentage(2), 3));
        let loan = ledger.create_loan(&terms, &time).unwrap();

        // first row due 2024-02-01; ten days late
        time.test_control().unwrap().advance(Duration::days(41));
        assert_eq!(ledger.refresh_status(loan.id, &time).unwrap(), LoanStatus::Overdue);

        let fees = ledger.compute_late_fee_breakdown(loan.id, date(2024, 2, 11)).unwrap();
        assert_eq!(fees.total_late_fee, Money::from_major(140));
        assert_eq!(fees, ledger.compute_late_fee_breakdown(loan.id, date(2024, 2, 11)).unwrap());

        let request = PaymentRequest::new(Money::from_major(1_200)).with_late_fee(Money::from_major(140));
        let receipt = ledger.apply_payment(loan.id, &request, &time).unwrap();
        assert_eq!(receipt.payment.late_fee, Money::from_major(140));
        assert_eq!(receipt.payment.amount, Money::from_major(1_340));

        // the paid row no longer accrues and the loan is current again
        let fees = ledger.compute_late_fee_breakdown(loan.id, date(2024, 2, 11)).unwrap();
        assert_eq!(fees.total_late_fee, Money::ZERO);
        assert_eq!(ledger.store().get_loan(loan.id).unwrap().status, LoanStatus::Active);
    }

    #[test]
    fn test_late_fee_removal_requires_reason() {
        let ledger = ledger();
        let time = clock(2024, 1, 1);
        let terms = simple_terms(10_000, 10).with_late_fee(LateFeeConfig::daily(Rate::from_percentage(2), 3));
        let loan = ledger.create_loan(&terms, &time).unwrap();
        time.test_control().unwrap().advance(Duration::days(41));

        let err = ledger.remove_late_fee(loan.id, Money::from_major(40), "  ", &time).unwrap_err();
        assert!(matches!(err, LedgerError::MissingReason));

        let err = ledger
            .remove_late_fee(loan.id, Money::from_major(500), "goodwill", &time)
            .unwrap_err();
        assert!(matches!(err, LedgerError::ExceedsMaximum { .. }));

        let plan = ledger
            .remove_late_fee(loan.id, Money::from_major(40), "goodwill", &time)
            .unwrap();
        assert_eq!(plan.total(), Money::from_major(40));

        let fees = ledger.compute_late_fee_breakdown(loan.id, date(2024, 2, 11)).unwrap();
        assert_eq!(fees.total_late_fee, Money::from_major(100));
    }

    #[test]
    fn test_prepayment_keep_count() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 4), &time).unwrap();

        let request = PrepaymentRequest::new(Money::from_major(2_000), true);
        let preview = ledger.preview_prepayment(loan.id, &request, &time).unwrap();
        assert_eq!(preview.capital_after, Money::from_major(8_000));
        // a preview writes nothing
        assert!(ledger.store().list_capital_payments(loan.id).unwrap().is_empty());

        let outcome = ledger.apply_prepayment(loan.id, &request, &time).unwrap();
        assert!(!outcome.is_duplicate());

        let rows = ledger.store().list_installments(loan.id).unwrap();
        assert!(rows.iter().all(|r| r.principal == Money::from_major(2_000)));
        assert_eq!(ledger.balance(loan.id).unwrap().principal_pending, Money::from_major(8_000));
    }

    #[test]
    fn test_prepayment_with_configured_penalty() {
        let config = LedgerConfig {
            prepayment_penalty: Some(PrepaymentPenalty {
                rate: Rate::from_percentage(2),
            }),
            ..LedgerConfig::default()
        };
        let ledger = Ledger::new(InMemoryStore::new(), config).unwrap();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        let outcome = ledger
            .apply_prepayment(loan.id, &PrepaymentRequest::new(Money::from_major(3_000), false), &time)
            .unwrap();

        assert_eq!(outcome.capital_payment().penalty, Some(Money::from_major(200)));
        let balance = ledger.balance(loan.id).unwrap();
        assert_eq!(balance.principal_pending, Money::from_major(7_000));
        assert_eq!(balance.charges_pending, Money::from_major(200));
        assert_eq!(ledger.store().list_installments(loan.id).unwrap().len(), 8);
    }

    #[test]
    fn test_prepayment_blocked_while_overdue() {
        let ledger = ledger();
        let time = clock(2024, 3, 5);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &clock(2024, 1, 1)).unwrap();

        let err = ledger
            .apply_prepayment(loan.id, &PrepaymentRequest::new(Money::from_major(1_000), true), &time)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_duplicate_capital_payment_is_suppressed() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        let request = PrepaymentRequest::new(Money::from_major(2_000), true).observed(Money::from_major(10_000));
        let first = ledger.apply_prepayment(loan.id, &request, &time).unwrap();

        time.test_control().unwrap().advance(Duration::seconds(45));
        let second = ledger.apply_prepayment(loan.id, &request, &time).unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.capital_payment(), first.capital_payment());
        assert_eq!(ledger.store().list_capital_payments(loan.id).unwrap().len(), 1);
        assert_eq!(ledger.balance(loan.id).unwrap().principal_pending, Money::from_major(8_000));
        assert!(ledger
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::CapitalPaymentDeduplicated { .. })));
    }

    #[test]
    fn test_stale_retry_after_window_is_rejected() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        let request = PrepaymentRequest::new(Money::from_major(2_000), true).observed(Money::from_major(10_000));
        ledger.apply_prepayment(loan.id, &request, &time).unwrap();

        time.test_control().unwrap().advance(Duration::minutes(3));
        let err = ledger.apply_prepayment(loan.id, &request, &time).unwrap_err();
        assert!(matches!(err, LedgerError::StaleCapital { .. }));

        // a fresh request against the current principal is a distinct prepayment
        let fresh = PrepaymentRequest::new(Money::from_major(2_000), true);
        let outcome = ledger.apply_prepayment(loan.id, &fresh, &time).unwrap();
        assert!(!outcome.is_duplicate());
        assert_eq!(ledger.store().list_capital_payments(loan.id).unwrap().len(), 2);
    }

    #[test]
    fn test_indefinite_prepayment_moves_loan_amount() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let terms = LoanTerms::indefinite(
            Money::from_major(10_000),
            Rate::from_percentage(3),
            6,
            PaymentFrequency::Monthly,
            date(2024, 1, 1),
        );
        let loan = ledger.create_loan(&terms, &time).unwrap();

        ledger
            .apply_prepayment(loan.id, &PrepaymentRequest::new(Money::from_major(4_000), true), &time)
            .unwrap();

        assert_eq!(ledger.store().get_loan(loan.id).unwrap().amount, Money::from_major(6_000));
        let balance = ledger.balance(loan.id).unwrap();
        assert_eq!(balance.principal_pending, Money::from_major(6_000));
        assert_eq!(balance.interest_pending, Money::from_major(1_080));
    }

    #[test]
    fn test_settlement_requires_full_capital() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        let breakdown = ledger.compute_settlement(loan.id, date(2024, 1, 10)).unwrap();
        assert_eq!(breakdown.capital_pending, Money::from_major(10_000));
        assert_eq!(breakdown.interest_pending, Money::from_major(2_000));

        let short = SettlementRequest {
            capital: Money::from_major(9_000),
            ..SettlementRequest::full(&breakdown)
        };
        let err = ledger.apply_settlement(loan.id, &short, &time).unwrap_err();
        assert!(matches!(err, LedgerError::CapitalShortfall { .. }));

        let request = SettlementRequest {
            interest: Money::from_major(500),
            ..SettlementRequest::full(&breakdown)
        };
        let receipt = ledger.apply_settlement(loan.id, &request, &time).unwrap();

        assert_eq!(receipt.terms.interest_forgiven, Money::from_major(1_500));
        assert_eq!(receipt.settled_rows, 10);

        let loan = ledger.store().get_loan(loan.id).unwrap();
        assert_eq!(loan.status, LoanStatus::Paid);
        assert_eq!(loan.balance, Money::ZERO);
        let rows = ledger.store().list_installments(loan.id).unwrap();
        assert!(rows.iter().all(|r| r.settled && !r.paid));
        assert!(ledger.balance(loan.id).unwrap().is_cleared(Money::CENT));

        let err = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(10)), &time)
            .unwrap_err();
        assert!(matches!(err, LedgerError::LoanNotActive { status: LoanStatus::Paid }));
    }

    #[test]
    fn test_last_payment_marks_loan_paid() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(1_000, 2), &time).unwrap();

        for _ in 0..2 {
            ledger
                .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(520)), &time)
                .unwrap();
        }

        assert_eq!(ledger.store().get_loan(loan.id).unwrap().status, LoanStatus::Paid);
    }

    #[test]
    fn test_concurrent_payments_on_one_loan() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let time = clock(2024, 1, 10);
                    ledger
                        .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(100)), &time)
                        .unwrap();
                });
            }
        });

        let balance = ledger.balance(loan.id).unwrap();
        assert_eq!(ledger.store().list_payments(loan.id).unwrap().len(), 4);
        assert_eq!(balance.total, Money::from_major(11_600));
        assert_eq!(balance.interest_pending, Money::from_major(1_800));
    }

    #[test]
    fn test_french_reduce_term_shortens_schedule() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let terms = LoanTerms::monthly_french(Money::from_major(10_000), Rate::from_percentage(2), 12, date(2024, 1, 1));
        let loan = ledger.create_loan(&terms, &time).unwrap();
        let held = ledger.store().list_installments(loan.id).unwrap()[0].total;

        ledger
            .apply_prepayment(loan.id, &PrepaymentRequest::new(Money::from_major(2_000), false), &time)
            .unwrap();

        let rows = ledger.store().list_installments(loan.id).unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r.total <= held));
        assert_eq!(ledger.balance(loan.id).unwrap().principal_pending, Money::from_major(8_000));
    }

    #[test]
    fn test_indefinite_loan_accrues_late_fee() {
        let ledger = ledger();
        let terms = LoanTerms::indefinite(
            Money::from_major(10_000),
            Rate::from_percentage(3),
            6,
            PaymentFrequency::Monthly,
            date(2024, 1, 1),
        )
        .with_late_fee(LateFeeConfig::daily(Rate::from_percentage(2), 3));
        let loan = ledger.create_loan(&terms, &clock(2024, 1, 1)).unwrap();

        // 300 of interest due 02-01, 26 days past grace
        let fees = ledger.compute_late_fee_breakdown(loan.id, date(2024, 3, 1)).unwrap();
        assert_eq!(fees.total_late_fee, Money::from_major(156));
    }

    #[test]
    fn test_loan_level_late_fee_is_drawn_down() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();
        // carried over from a previous servicing system
        ledger
            .store()
            .update_loan(
                loan.id,
                &LoanUpdate {
                    late_fee_balance: Some(Money::from_major(75)),
                    ..Default::default()
                },
            )
            .unwrap();

        let breakdown = ledger.compute_settlement(loan.id, date(2024, 1, 10)).unwrap();
        assert_eq!(breakdown.late_fee_pending, Money::from_major(75));

        let plan = ledger
            .remove_late_fee(loan.id, Money::from_major(25), "goodwill", &time)
            .unwrap();
        assert!(plan.shares.is_empty());
        assert_eq!(plan.loan_level, Money::from_major(25));

        let too_much = PaymentRequest::new(Money::ZERO).with_late_fee(Money::from_major(60));
        let err = ledger.apply_payment(loan.id, &too_much, &time).unwrap_err();
        assert!(matches!(err, LedgerError::ExceedsMaximum { .. }));

        let request = PaymentRequest::new(Money::ZERO).with_late_fee(Money::from_major(50));
        let receipt = ledger.apply_payment(loan.id, &request, &time).unwrap();
        assert!(receipt.allocation.is_none());
        assert_eq!(receipt.late_fee.loan_level, Money::from_major(50));
        assert_eq!(receipt.payment.amount, Money::from_major(50));
        assert_eq!(receipt.new_balance, Money::from_major(12_000));
        assert_eq!(ledger.store().get_loan(loan.id).unwrap().late_fee_balance, Money::ZERO);
    }

    #[test]
    fn test_idle_loan_locks_are_released() {
        let ledger = ledger();
        let time = clock(2024, 1, 10);
        let first = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();
        let second = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        for id in [first.id, second.id] {
            ledger
                .apply_payment(id, &PaymentRequest::new(Money::from_major(100)), &time)
                .unwrap();
        }

        let locks = ledger.locks.lock();
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key(&second.id));
    }

    proptest! {
        #[test]
        fn prop_payments_never_raise_balance(cents in prop::collection::vec(1i64..150_000, 1..15)) {
            let ledger = ledger();
            let time = clock(2024, 1, 10);
            let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

            for cents in cents {
                let Ok(preview) = ledger.preview_allocation(loan.id, Money::ZERO) else {
                    break;
                };
                let amount = Money::from_minor(cents).min(preview.outstanding_before());

                let receipt = ledger.apply_payment(loan.id, &PaymentRequest::new(amount), &time).unwrap();
                let allocation = receipt.allocation.unwrap();

                prop_assert!(receipt.new_balance <= receipt.previous_balance);
                prop_assert!(receipt.previous_balance - receipt.new_balance >= allocation.applied());
                prop_assert!(allocation.applied() <= amount);
                prop_assert!(allocation.interest_applied <= allocation.interest_due);
                if allocation.principal_applied.is_positive() {
                    prop_assert_eq!(allocation.interest_applied, allocation.interest_due);
                }
            }
        }
    }

    /// store whose payment writes always fail
    struct FailingStore {
        inner: InMemoryStore,
    }

    impl LedgerStore for FailingStore {
        fn get_loan(&self, loan_id: LoanId) -> StoreResult<Loan> {
            self.inner.get_loan(loan_id)
        }
        fn insert_loan(&self, loan: &Loan) -> StoreResult<()> {
            self.inner.insert_loan(loan)
        }
        fn list_installments(&self, loan_id: LoanId) -> StoreResult<Vec<Installment>> {
            self.inner.list_installments(loan_id)
        }
        fn list_payments(&self, loan_id: LoanId) -> StoreResult<Vec<Payment>> {
            self.inner.list_payments(loan_id)
        }
        fn list_capital_payments(&self, loan_id: LoanId) -> StoreResult<Vec<CapitalPayment>> {
            self.inner.list_capital_payments(loan_id)
        }
        fn upsert_installments(&self, rows: &[Installment]) -> StoreResult<()> {
            self.inner.upsert_installments(rows)
        }
        fn delete_installments(&self, ids: &[InstallmentId]) -> StoreResult<()> {
            self.inner.delete_installments(ids)
        }
        fn insert_payment(&self, _row: &Payment) -> StoreResult<()> {
            Err(StoreError::Backend("connection reset".to_string()))
        }
        fn insert_capital_payment(&self, row: &CapitalPayment) -> StoreResult<()> {
            self.inner.insert_capital_payment(row)
        }
        fn update_loan(&self, loan_id: LoanId, update: &LoanUpdate) -> StoreResult<()> {
            self.inner.update_loan(loan_id, update)
        }
    }

    #[test]
    fn test_storage_errors_propagate_unchanged() {
        let ledger = Ledger::with_defaults(FailingStore {
            inner: InMemoryStore::new(),
        });
        let time = clock(2024, 1, 10);
        let loan = ledger.create_loan(&simple_terms(10_000, 10), &time).unwrap();

        let err = ledger
            .apply_payment(loan.id, &PaymentRequest::new(Money::from_major(100)), &time)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(matches!(err, LedgerError::Storage(StoreError::Backend(_))));
        assert_eq!(ledger.balance(loan.id).unwrap().total, Money::from_major(12_000));
    }
}
