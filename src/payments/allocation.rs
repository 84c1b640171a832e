use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::balance::{ItemStatus, LedgerBalance};
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::types::{InstallmentId, InstallmentKind};

/// split of one payment against the current due item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub installment_id: InstallmentId,
    pub number: u32,
    pub kind: InstallmentKind,
    pub due_date: NaiveDate,
    /// interest still owed on the item before this payment
    pub interest_due: Money,
    /// principal still owed on the item before this payment
    pub principal_due: Money,
    pub interest_applied: Money,
    pub principal_applied: Money,
    /// amount left over after the item is covered; applies to the next item
    pub excess: Money,
    /// the item is fully covered once this payment lands
    pub completes_item: bool,
}

impl Allocation {
    pub fn applied(&self) -> Money {
        self.interest_applied + self.principal_applied
    }

    pub fn outstanding_before(&self) -> Money {
        self.interest_due + self.principal_due
    }

    pub fn outstanding_after(&self) -> Money {
        (self.outstanding_before() - self.applied()).non_negative()
    }
}

/// splits payments interest-first against the oldest open item
pub struct PaymentAllocator {
    tolerance: Money,
}

impl PaymentAllocator {
    pub fn new(tolerance: Money) -> Self {
        Self { tolerance }
    }

    /// split `amount` against the current due item of `balance`
    pub fn allocate(&self, amount: Money, balance: &LedgerBalance) -> Result<Allocation> {
        if amount.is_negative() {
            return Err(LedgerError::InvalidAmount { amount });
        }

        let item = balance
            .current_due(self.tolerance)
            .ok_or(LedgerError::NothingDue)?;

        let allocation = self.split(amount, item);

        debug!(
            installment = allocation.number,
            kind = ?allocation.kind,
            due_date = %allocation.due_date,
            interest = %allocation.interest_applied,
            principal = %allocation.principal_applied,
            excess = %allocation.excess,
            "payment allocated"
        );

        Ok(allocation)
    }

    /// apply `amount` to one item, tolerating earlier partial payments
    pub fn split(&self, amount: Money, item: &ItemStatus) -> Allocation {
        let (interest_due, principal_due) = match item.kind {
            // charges carry no interest component
            InstallmentKind::Charge => (Money::ZERO, item.outstanding()),
            InstallmentKind::Regular => (item.interest_due(), item.principal_due()),
        };

        let interest_applied = amount.min(interest_due).non_negative();
        let remaining = amount - interest_applied;
        let principal_applied = remaining.min(principal_due).non_negative();
        let excess = (remaining - principal_applied).non_negative();

        let mut allocation = Allocation {
            installment_id: item.installment_id,
            number: item.number,
            kind: item.kind,
            due_date: item.due_date,
            interest_due,
            principal_due,
            interest_applied,
            principal_applied,
            excess,
            completes_item: false,
        };
        allocation.completes_item = allocation.outstanding_after() <= self.tolerance;
        allocation
    }

    /// reject a split that would leave money unapplied
    pub fn ensure_fits(&self, allocation: &Allocation) -> Result<()> {
        if allocation.excess > self.tolerance {
            return Err(LedgerError::ExceedsMaximum {
                maximum: allocation.outstanding_before(),
                requested: allocation.applied() + allocation.excess,
            });
        }
        Ok(())
    }
}

/// reject payments that are negative or carry nothing at all
pub fn validate_payment(amount: Money, late_fee_amount: Money) -> Result<()> {
    if amount.is_negative() {
        return Err(LedgerError::InvalidAmount { amount });
    }
    if late_fee_amount.is_negative() {
        return Err(LedgerError::InvalidAmount {
            amount: late_fee_amount,
        });
    }
    if amount.is_zero() && late_fee_amount.is_zero() {
        return Err(LedgerError::EmptyPayment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn item(kind: InstallmentKind, principal: i64, interest: i64, paid_principal: i64, paid_interest: i64) -> ItemStatus {
        ItemStatus {
            installment_id: Uuid::new_v4(),
            number: 1,
            kind,
            due_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            expected_principal: Money::from_major(principal),
            expected_interest: Money::from_major(interest),
            paid_principal: Money::from_major(paid_principal),
            paid_interest: Money::from_major(paid_interest),
            paid: false,
            settled: false,
        }
    }

    fn balance_of(items: Vec<ItemStatus>) -> LedgerBalance {
        let total = items.iter().map(|i| i.outstanding()).sum();
        LedgerBalance {
            principal_pending: Money::ZERO,
            interest_pending: Money::ZERO,
            charges_pending: Money::ZERO,
            total,
            items,
        }
    }

    #[test]
    fn test_interest_before_principal() {
        let allocator = PaymentAllocator::new(Money::CENT);
        let row = item(InstallmentKind::Regular, 1_000, 200, 0, 0);

        let allocation = allocator.split(Money::from_major(500), &row);

        assert_eq!(allocation.interest_applied, Money::from_major(200));
        assert_eq!(allocation.principal_applied, Money::from_major(300));
        assert_eq!(allocation.excess, Money::ZERO);
        assert!(!allocation.completes_item);
    }

    #[test]
    fn test_partial_payments_on_same_due_date() {
        let allocator = PaymentAllocator::new(Money::CENT);

        // first partial payment of 300 against 500 interest
        let fresh = item(InstallmentKind::Regular, 1_000, 500, 0, 0);
        let first = allocator.split(Money::from_major(300), &fresh);
        assert_eq!(first.interest_applied, Money::from_major(300));
        assert_eq!(first.principal_applied, Money::ZERO);

        // second payment of 400 sees 200 interest still owed
        let after_first = item(InstallmentKind::Regular, 1_000, 500, 0, 300);
        let second = allocator.split(Money::from_major(400), &after_first);
        assert_eq!(second.interest_due, Money::from_major(200));
        assert_eq!(second.interest_applied, Money::from_major(200));
        assert_eq!(second.principal_applied, Money::from_major(200));
    }

    #[test]
    fn test_charge_takes_everything_as_principal() {
        let allocator = PaymentAllocator::new(Money::CENT);
        let charge = item(InstallmentKind::Charge, 50, 0, 20, 0);

        let allocation = allocator.split(Money::from_major(30), &charge);

        assert_eq!(allocation.interest_applied, Money::ZERO);
        assert_eq!(allocation.principal_applied, Money::from_major(30));
        assert!(allocation.completes_item);
    }

    #[test]
    fn test_excess_is_reported_and_rejected_on_apply() {
        let allocator = PaymentAllocator::new(Money::CENT);
        let row = item(InstallmentKind::Regular, 1_000, 200, 0, 0);

        let allocation = allocator.split(Money::from_major(1_500), &row);
        assert_eq!(allocation.excess, Money::from_major(300));
        assert!(allocation.completes_item);

        let err = allocator.ensure_fits(&allocation).unwrap_err();
        assert!(matches!(err, LedgerError::ExceedsMaximum { .. }));
    }

    #[test]
    fn test_allocate_picks_oldest_open_item() {
        let allocator = PaymentAllocator::new(Money::CENT);
        let mut done = item(InstallmentKind::Regular, 1_000, 200, 1_000, 200);
        done.paid = true;
        let open = item(InstallmentKind::Regular, 1_000, 200, 0, 0);
        let open_id = open.installment_id;

        let allocation = allocator
            .allocate(Money::from_major(100), &balance_of(vec![done, open]))
            .unwrap();
        assert_eq!(allocation.installment_id, open_id);

        let err = allocator.allocate(Money::from_major(100), &balance_of(Vec::new())).unwrap_err();
        assert!(matches!(err, LedgerError::NothingDue));
    }

    #[test]
    fn test_validate_payment() {
        assert!(validate_payment(Money::from_major(10), Money::ZERO).is_ok());
        assert!(validate_payment(Money::ZERO, Money::from_major(5)).is_ok());
        assert!(matches!(
            validate_payment(Money::ZERO, Money::ZERO),
            Err(LedgerError::EmptyPayment)
        ));
        assert!(matches!(
            validate_payment(Money::from_major(-1), Money::ZERO),
            Err(LedgerError::InvalidAmount { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_split_never_exceeds_payment(
            amount in 0i64..500_000,
            principal in 0i64..200_000,
            interest in 0i64..50_000,
            paid_interest_pct in 0i64..=100,
        ) {
            let allocator = PaymentAllocator::new(Money::CENT);
            let paid_interest = interest * paid_interest_pct / 100;
            let mut row = item(InstallmentKind::Regular, 0, 0, 0, 0);
            row.expected_principal = Money::from_minor(principal);
            row.expected_interest = Money::from_minor(interest);
            row.paid_interest = Money::from_minor(paid_interest);

            let allocation = allocator.split(Money::from_minor(amount), &row);

            prop_assert!(allocation.applied() <= Money::from_minor(amount));
            prop_assert!(allocation.interest_applied <= allocation.interest_due);
            prop_assert!(allocation.principal_applied <= allocation.principal_due);
            if allocation.principal_applied.is_positive() {
                prop_assert_eq!(allocation.interest_applied, allocation.interest_due);
            }
            prop_assert_eq!(allocation.applied() + allocation.excess, Money::from_minor(amount));
        }
    }
}
